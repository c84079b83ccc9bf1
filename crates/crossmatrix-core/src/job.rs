//! Job and job result types.

use crate::error::{Error, Result};
use crate::ids::JobId;
use crate::matrix::{Architecture, MatrixEntry, Platform};
use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Running,
    Succeeded,
    Failed,
    Skipped,
    TimedOut,
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStatus::Succeeded | JobStatus::Failed | JobStatus::Skipped | JobStatus::TimedOut
        )
    }

    /// Failed or timed out.
    pub fn is_failure(&self) -> bool {
        matches!(self, JobStatus::Failed | JobStatus::TimedOut)
    }

    fn can_transition_to(&self, next: JobStatus) -> bool {
        match self {
            JobStatus::Pending => matches!(next, JobStatus::Running | JobStatus::Skipped),
            JobStatus::Running => matches!(
                next,
                JobStatus::Succeeded | JobStatus::Failed | JobStatus::TimedOut
            ),
            _ => false,
        }
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            JobStatus::Pending => "pending",
            JobStatus::Running => "running",
            JobStatus::Succeeded => "succeeded",
            JobStatus::Failed => "failed",
            JobStatus::Skipped => "skipped",
            JobStatus::TimedOut => "timed_out",
        };
        f.pad(s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum TestStatus {
    Passed,
    Failed,
    /// An optional command failed; recorded but does not fail the job.
    Informational,
}

/// Outcome of one test command executed inside a job's sandbox.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct TestCaseResult {
    pub name: String,
    pub suite: String,
    pub status: TestStatus,
    pub optional: bool,
    pub exit_code: Option<i32>,
    pub duration_seconds: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

/// Runtime instance of a matrix entry.
///
/// Status transitions are owned by whoever executes the job and are checked:
/// once a job leaves `Running` (or is skipped) it never changes again.
#[derive(Debug, Clone)]
pub struct Job {
    pub entry: MatrixEntry,
    status: JobStatus,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub artifact_paths: Vec<PathBuf>,
    /// Total size of the extracted artifacts.
    pub artifact_bytes: u64,
    pub log_path: Option<PathBuf>,
    pub exit_code: Option<i32>,
    pub error: Option<String>,
    pub tests: Vec<TestCaseResult>,
}

impl Job {
    pub fn new(entry: MatrixEntry) -> Self {
        Self {
            entry,
            status: JobStatus::Pending,
            started_at: None,
            finished_at: None,
            artifact_paths: Vec::new(),
            artifact_bytes: 0,
            log_path: None,
            exit_code: None,
            error: None,
            tests: Vec::new(),
        }
    }

    pub fn id(&self) -> &JobId {
        &self.entry.id
    }

    pub fn status(&self) -> JobStatus {
        self.status
    }

    fn transition(&mut self, next: JobStatus) -> Result<()> {
        if !self.status.can_transition_to(next) {
            return Err(Error::InvalidTransition {
                from: self.status.to_string(),
                to: next.to_string(),
            });
        }
        self.status = next;
        Ok(())
    }

    pub fn start(&mut self) -> Result<()> {
        self.transition(JobStatus::Running)?;
        self.started_at = Some(Utc::now());
        Ok(())
    }

    pub fn finish(&mut self, status: JobStatus) -> Result<()> {
        self.transition(status)?;
        self.finished_at = Some(Utc::now());
        Ok(())
    }

    pub fn skip(&mut self, reason: impl Into<String>) -> Result<()> {
        self.transition(JobStatus::Skipped)?;
        self.error = Some(reason.into());
        Ok(())
    }

    /// Append error detail without touching the status.
    pub fn append_error(&mut self, detail: impl AsRef<str>) {
        match &mut self.error {
            Some(existing) => {
                existing.push_str("; ");
                existing.push_str(detail.as_ref());
            }
            None => self.error = Some(detail.as_ref().to_string()),
        }
    }

    pub fn duration_seconds(&self) -> f64 {
        match (self.started_at, self.finished_at) {
            (Some(start), Some(end)) => (end - start).num_milliseconds().max(0) as f64 / 1000.0,
            _ => 0.0,
        }
    }

    /// Snapshot the job. Only meaningful once the job is terminal.
    pub fn to_result(&self) -> JobResult {
        JobResult {
            job_id: self.entry.id.clone(),
            platform: self.entry.platform,
            architecture: self.entry.architecture,
            status: self.status,
            duration_seconds: self.duration_seconds(),
            exit_code: self.exit_code,
            artifact_paths: self.artifact_paths.clone(),
            artifact_bytes: self.artifact_bytes,
            log_path: self.log_path.clone(),
            error: self.error.clone(),
            tests: self.tests.clone(),
        }
    }
}

/// Immutable snapshot of a finished job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct JobResult {
    pub job_id: JobId,
    pub platform: Platform,
    pub architecture: Architecture,
    pub status: JobStatus,
    pub duration_seconds: f64,
    pub exit_code: Option<i32>,
    #[serde(default)]
    pub artifact_paths: Vec<PathBuf>,
    #[serde(default)]
    pub artifact_bytes: u64,
    pub log_path: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tests: Vec<TestCaseResult>,
}

impl JobResult {
    pub fn pair_label(&self) -> String {
        format!("{}/{}", self.platform, self.architecture)
    }
}
