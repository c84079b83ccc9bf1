//! Per-job log file.

use chrono::{DateTime, Utc};
use crossmatrix_core::Result;
use crossmatrix_core::ports::ExecOutput;
use std::path::{Path, PathBuf};
use tokio::fs::File;
use tokio::io::AsyncWriteExt;
use tracing::warn;

/// Output line captured from a command.
#[derive(Debug, Clone)]
pub struct OutputLine {
    pub stream: OutputStream,
    pub content: String,
    pub timestamp: DateTime<Utc>,
}

/// Output stream type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputStream {
    Stdout,
    Stderr,
}

impl OutputStream {
    fn tag(&self) -> &'static str {
        match self {
            OutputStream::Stdout => "out",
            OutputStream::Stderr => "err",
        }
    }
}

/// Append-only log at `<output>/<job>/job.log`.
///
/// Write failures are logged and swallowed; a broken log never fails a job.
pub struct JobLog {
    path: PathBuf,
    file: Option<File>,
}

impl JobLog {
    pub async fn create(dir: &Path) -> Result<Self> {
        tokio::fs::create_dir_all(dir).await?;
        let path = dir.join("job.log");
        let file = File::create(&path).await?;
        Ok(Self {
            path,
            file: Some(file),
        })
    }

    /// A log that discards everything, used when the file cannot be created.
    pub fn disabled(path: PathBuf) -> Self {
        Self { path, file: None }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub async fn section(&mut self, title: &str) {
        let text = format!("==> [{}] {}\n", Utc::now().format("%H:%M:%S"), title);
        self.write(text.as_bytes()).await;
    }

    pub async fn line(&mut self, line: &OutputLine) {
        let text = format!(
            "[{}] {} | {}\n",
            line.timestamp.format("%H:%M:%S%.3f"),
            line.stream.tag(),
            line.content
        );
        self.write(text.as_bytes()).await;
    }

    /// Record captured output of one command.
    pub async fn exec_output(&mut self, output: &ExecOutput) {
        let now = Utc::now();
        for (stream, text) in [
            (OutputStream::Stdout, &output.stdout),
            (OutputStream::Stderr, &output.stderr),
        ] {
            for content in text.lines() {
                let line = OutputLine {
                    stream,
                    content: content.to_string(),
                    timestamp: now,
                };
                self.line(&line).await;
            }
        }
        self.section(&format!("exit code {}", output.exit_code)).await;
    }

    pub async fn flush(&mut self) {
        if let Some(file) = &mut self.file
            && let Err(e) = file.flush().await
        {
            warn!(path = %self.path.display(), error = %e, "Failed to flush job log");
        }
    }

    async fn write(&mut self, bytes: &[u8]) {
        let Some(file) = &mut self.file else {
            return;
        };
        if let Err(e) = file.write_all(bytes).await {
            warn!(path = %self.path.display(), error = %e, "Job log write failed, disabling log");
            self.file = None;
        }
    }
}
