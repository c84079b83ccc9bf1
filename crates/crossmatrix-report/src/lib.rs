//! Rendering and persistence of the run report.
//!
//! Every renderer is a pure function of the [`Report`]: rendering the same
//! report twice yields the same bytes.

mod html;
mod junit;
mod text;
mod writer;

pub use writer::write_reports;

use crossmatrix_core::Result;
use crossmatrix_core::report::Report;
use std::fmt;

/// Output format for report files
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ReportFormat {
    /// Structured JSON document
    Json,
    /// Human-readable summary
    Text,
    /// JUnit XML (for CI systems)
    Junit,
    /// Standalone HTML page
    Html,
}

impl ReportFormat {
    pub const ALL: [ReportFormat; 4] = [
        ReportFormat::Json,
        ReportFormat::Text,
        ReportFormat::Junit,
        ReportFormat::Html,
    ];

    /// File name the format is written to inside the output directory.
    pub fn file_name(&self) -> &'static str {
        match self {
            ReportFormat::Json => "report.json",
            ReportFormat::Text => "summary.txt",
            ReportFormat::Junit => "junit.xml",
            ReportFormat::Html => "report.html",
        }
    }
}

impl fmt::Display for ReportFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ReportFormat::Json => write!(f, "json"),
            ReportFormat::Text => write!(f, "text"),
            ReportFormat::Junit => write!(f, "junit"),
            ReportFormat::Html => write!(f, "html"),
        }
    }
}

impl std::str::FromStr for ReportFormat {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "json" => Ok(ReportFormat::Json),
            "text" | "txt" | "summary" => Ok(ReportFormat::Text),
            "junit" | "junit-xml" | "xml" => Ok(ReportFormat::Junit),
            "html" => Ok(ReportFormat::Html),
            _ => Err(format!(
                "Unknown report format '{}'. Valid formats: json, text, junit, html",
                s
            )),
        }
    }
}

/// The two renderings every run produces.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RenderedReport {
    pub structured: String,
    pub summary: String,
}

pub fn render(report: &Report) -> Result<RenderedReport> {
    Ok(RenderedReport {
        structured: to_json(report)?,
        summary: text::to_text(report),
    })
}

/// Render a single format.
pub fn render_format(report: &Report, format: ReportFormat) -> Result<String> {
    match format {
        ReportFormat::Json => to_json(report),
        ReportFormat::Text => Ok(text::to_text(report)),
        ReportFormat::Junit => Ok(junit::to_junit_xml(report)),
        ReportFormat::Html => Ok(html::to_html(report)),
    }
}

fn to_json(report: &Report) -> Result<String> {
    let mut json = serde_json::to_string_pretty(report)?;
    json.push('\n');
    Ok(json)
}

/// Byte count with a binary unit, one decimal above bytes.
pub(crate) fn format_bytes(bytes: u64) -> String {
    const UNITS: [&str; 3] = ["KB", "MB", "GB"];
    if bytes < 1024 {
        return format!("{} B", bytes);
    }
    let mut value = bytes as f64 / 1024.0;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    format!("{:.1} {}", value, UNITS[unit])
}

/// Escape special XML/HTML characters
pub(crate) fn escape(s: &str) -> String {
    s.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
        .replace('\'', "&apos;")
}

#[cfg(test)]
pub(crate) mod fixtures {
    use chrono::TimeZone;
    use crossmatrix_core::RunId;
    use crossmatrix_core::ids::JobId;
    use crossmatrix_core::job::{JobResult, JobStatus, TestCaseResult, TestStatus};
    use crossmatrix_core::matrix::{Architecture, Platform};
    use crossmatrix_core::policy::PolicySettings;
    use crossmatrix_core::report::{Report, ReportAggregator, ReportWarning, WarningKind};
    use std::path::PathBuf;

    fn result(
        id: &str,
        platform: Platform,
        architecture: Architecture,
        status: JobStatus,
    ) -> JobResult {
        JobResult {
            job_id: JobId::from(id),
            platform,
            architecture,
            status,
            duration_seconds: 1.5,
            exit_code: None,
            artifact_paths: Vec::new(),
            artifact_bytes: 0,
            log_path: Some(PathBuf::from(format!("out/{id}/job.log"))),
            error: None,
            tests: Vec::new(),
        }
    }

    pub fn sample_report() -> Report {
        let run_id = RunId::from_uuid(uuid_for_tests());
        let mut aggregator = ReportAggregator::new(run_id, PolicySettings::sequential());

        let mut ok = result("linux-amd64", Platform::Linux, Architecture::Amd64, JobStatus::Succeeded);
        ok.exit_code = Some(0);
        ok.artifact_paths = vec![PathBuf::from("out/linux-amd64/artifacts/app")];
        ok.artifact_bytes = 1536;
        ok.tests = vec![
            TestCaseResult {
                name: "version".to_string(),
                suite: "basic".to_string(),
                status: TestStatus::Passed,
                optional: false,
                exit_code: Some(0),
                duration_seconds: 0.25,
                message: None,
            },
            TestCaseResult {
                name: "ipv6".to_string(),
                suite: "network".to_string(),
                status: TestStatus::Informational,
                optional: true,
                exit_code: Some(1),
                duration_seconds: 0.5,
                message: Some("exit code 1".to_string()),
            },
        ];

        let mut failed = result("alpine-amd64", Platform::Alpine, Architecture::Amd64, JobStatus::Failed);
        failed.error = Some("build failed: <missing> & broken".to_string());

        let mut skipped = result("freebsd-arm64", Platform::Freebsd, Architecture::Arm64, JobStatus::Skipped);
        skipped.log_path = None;
        skipped.error = Some("unsupported combination freebsd/arm64".to_string());

        for r in [ok, failed, skipped] {
            aggregator.merge(r).unwrap();
        }
        aggregator.warn(ReportWarning::new(
            WarningKind::ResourceLeak,
            Some(JobId::from("alpine-amd64")),
            "container abc could not be removed after 3 attempts",
        ));

        let mut report = aggregator.finish(false);
        report.timestamp = chrono::Utc.with_ymd_and_hms(2026, 1, 2, 3, 4, 5).unwrap();
        report
    }

    fn uuid_for_tests() -> uuid::Uuid {
        uuid::Uuid::from_u128(0x0190_0000_0000_7000_8000_0000_0000_0001)
    }
}
