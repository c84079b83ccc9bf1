use crate::{ReportFormat, render_format};
use crossmatrix_core::Result;
use crossmatrix_core::report::Report;
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use tracing::info;

/// Write the report into `dir`, once per format.
///
/// The JSON document and the text summary are always written; `formats`
/// adds JUnit XML and HTML. Returns the written paths in format order.
pub fn write_reports(report: &Report, dir: &Path, formats: &[ReportFormat]) -> Result<Vec<PathBuf>> {
    std::fs::create_dir_all(dir)?;

    let selected: BTreeSet<ReportFormat> = [ReportFormat::Json, ReportFormat::Text]
        .into_iter()
        .chain(formats.iter().copied())
        .collect();

    let mut written = Vec::with_capacity(selected.len());
    for format in selected {
        let path = dir.join(format.file_name());
        let content = render_format(report, format)?;
        std::fs::write(&path, content)?;
        info!(format = %format, path = %path.display(), "Wrote report");
        written.push(path);
    }
    Ok(written)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fixtures::sample_report;
    use tempfile::TempDir;

    #[test]
    fn test_writes_default_files() {
        let dir = TempDir::new().unwrap();
        let written = write_reports(&sample_report(), dir.path(), &[]).unwrap();

        assert_eq!(
            written,
            vec![dir.path().join("report.json"), dir.path().join("summary.txt")]
        );
        let json = std::fs::read_to_string(dir.path().join("report.json")).unwrap();
        assert!(json.contains("\"linux-amd64\""));
    }

    #[test]
    fn test_duplicate_formats_written_once() {
        let dir = TempDir::new().unwrap();
        let out = dir.path().join("nested/out");
        let written = write_reports(
            &sample_report(),
            &out,
            &[ReportFormat::Junit, ReportFormat::Html, ReportFormat::Junit, ReportFormat::Json],
        )
        .unwrap();

        assert_eq!(written.len(), 4);
        assert!(out.join("junit.xml").exists());
        assert!(out.join("report.html").exists());
    }
}
