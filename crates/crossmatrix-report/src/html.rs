//! Standalone HTML page with a per-job compatibility table.

use crate::{escape, format_bytes};
use crossmatrix_core::job::{JobStatus, TestStatus};
use crossmatrix_core::report::Report;

const STYLE: &str = r#"
        body { font-family: -apple-system, "Segoe UI", sans-serif; margin: 2rem; color: #222; }
        .summary { display: flex; gap: 1rem; margin-bottom: 1.5rem; }
        .metric { border: 1px solid #ddd; border-radius: 6px; padding: 0.75rem 1.25rem; text-align: center; }
        .metric-value { font-size: 1.6rem; font-weight: 600; }
        .metric-label { font-size: 0.8rem; color: #666; }
        table { border-collapse: collapse; width: 100%; }
        th, td { border-bottom: 1px solid #eee; padding: 0.4rem 0.6rem; text-align: left; }
        .succeeded { color: #1a7f37; }
        .failed, .timed_out { color: #cf222e; }
        .skipped { color: #9a6700; }
        .warnings li { margin-bottom: 0.3rem; }
"#;

pub(crate) fn to_html(report: &Report) -> String {
    let totals = &report.totals;
    let run_id = escape(&report.run_id.to_string());
    let mut html = String::new();

    html.push_str("<!DOCTYPE html>\n<html lang=\"en\">\n<head>\n");
    html.push_str("    <meta charset=\"UTF-8\">\n");
    html.push_str(&format!("    <title>Matrix report {}</title>\n", run_id));
    html.push_str(&format!("    <style>{}    </style>\n", STYLE));
    html.push_str("</head>\n<body>\n");

    html.push_str(&format!("    <h1>Matrix report</h1>\n    <p>Run {} | Started {}", run_id, report.timestamp.to_rfc3339()));
    if report.interrupted {
        html.push_str(" | <strong>interrupted</strong>");
    }
    html.push_str("</p>\n");

    html.push_str("    <div class=\"summary\">\n");
    for (value, label) in [
        (totals.total, "Jobs"),
        (totals.succeeded, "Succeeded"),
        (totals.failed, "Failed"),
        (totals.skipped, "Skipped"),
    ] {
        html.push_str(&format!(
            "        <div class=\"metric\"><div class=\"metric-value\">{}</div><div class=\"metric-label\">{}</div></div>\n",
            value, label
        ));
    }
    html.push_str("    </div>\n");

    html.push_str("    <table>\n        <thead>\n            <tr><th>Job</th><th>Platform</th><th>Status</th><th>Duration</th><th>Tests</th><th>Artifacts</th><th>Details</th></tr>\n        </thead>\n        <tbody>\n");
    for result in report.results.values() {
        let passed = result
            .tests
            .iter()
            .filter(|t| t.status != TestStatus::Failed)
            .count();
        let tests = if result.tests.is_empty() {
            "-".to_string()
        } else {
            format!("{}/{}", passed, result.tests.len())
        };
        let artifacts = if result.artifact_paths.is_empty() {
            "-".to_string()
        } else {
            format_bytes(result.artifact_bytes)
        };
        let mut details = result
            .error
            .as_deref()
            .map(escape)
            .unwrap_or_default();
        if result.status != JobStatus::Succeeded
            && let Some(log) = &result.log_path
        {
            if !details.is_empty() {
                details.push_str("<br>");
            }
            details.push_str(&format!("log: {}", escape(&log.display().to_string())));
        }

        html.push_str(&format!(
            "            <tr><td>{}</td><td>{}</td><td class=\"{}\">{}</td><td>{:.1}s</td><td>{}</td><td>{}</td><td>{}</td></tr>\n",
            escape(result.job_id.as_str()),
            escape(&result.pair_label()),
            result.status,
            result.status,
            result.duration_seconds,
            tests,
            artifacts,
            details
        ));
    }
    html.push_str("        </tbody>\n    </table>\n");

    let common = &report.failure_analysis.common_failures;
    if !common.is_empty() {
        html.push_str("    <h2>Common failures</h2>\n    <ul class=\"common-failures\">\n");
        for failure in common {
            let jobs: Vec<String> = failure.jobs.iter().map(|j| escape(j.as_str())).collect();
            html.push_str(&format!(
                "        <li>{}/{} failed on {}</li>\n",
                escape(&failure.suite),
                escape(&failure.test),
                jobs.join(", ")
            ));
        }
        html.push_str("    </ul>\n");
    }

    if !report.warnings.is_empty() {
        html.push_str("    <h2>Warnings</h2>\n    <ul class=\"warnings\">\n");
        for warning in &report.warnings {
            let job = warning
                .job_id
                .as_ref()
                .map(|id| format!("{}: ", escape(id.as_str())))
                .unwrap_or_default();
            html.push_str(&format!(
                "        <li>[{}] {}{}</li>\n",
                warning.kind,
                job,
                escape(&warning.message)
            ));
        }
        html.push_str("    </ul>\n");
    }

    html.push_str("</body>\n</html>\n");
    html
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fixtures::sample_report;
    use crossmatrix_core::ids::JobId;
    use crossmatrix_core::report::CommonFailure;

    #[test]
    fn test_html_contains_table_rows() {
        let html = to_html(&sample_report());

        assert!(html.starts_with("<!DOCTYPE html>"));
        assert!(html.contains("<td>linux-amd64</td><td>linux/amd64</td><td class=\"succeeded\">succeeded</td>"));
        assert!(html.contains("<td>2/2</td>"));
        assert!(html.contains("build failed: &lt;missing&gt; &amp; broken<br>log: out/alpine-amd64/job.log"));
        assert!(html.contains("[resource_leak] alpine-amd64: container abc"));
    }

    #[test]
    fn test_html_shows_artifact_size_and_common_failures() {
        let mut report = sample_report();
        report.failure_analysis.common_failures = vec![CommonFailure {
            suite: "basic".to_string(),
            test: "<version>".to_string(),
            jobs: vec![JobId::from("alpine-amd64"), JobId::from("linux-amd64")],
        }];
        let html = to_html(&report);

        assert!(html.contains("<td>2/2</td><td>1.5 KB</td>"));
        assert!(html.contains("<li>basic/&lt;version&gt; failed on alpine-amd64, linux-amd64</li>"));
    }
}
