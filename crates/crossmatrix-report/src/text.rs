//! Human-readable summary.

use crossmatrix_core::job::{JobStatus, TestStatus};
use crossmatrix_core::matrix::{Architecture, Platform};
use crate::format_bytes;
use crossmatrix_core::report::{Report, Totals};
use std::collections::BTreeMap;

pub(crate) fn to_text(report: &Report) -> String {
    let mut out = String::new();
    let policy = &report.policy;

    out.push_str(&format!("Matrix run {}\n", report.run_id));
    out.push_str(&format!(
        "Started: {}\n",
        report.timestamp.format("%Y-%m-%d %H:%M:%S UTC")
    ));
    out.push_str(&format!(
        "Policy: {}, {}\n",
        if policy.parallel { "parallel" } else { "sequential" },
        if policy.continue_on_error {
            "continue-on-error"
        } else {
            "stop-on-error"
        }
    ));
    out.push_str(&"=".repeat(60));
    out.push('\n');

    for result in report.results.values() {
        let symbol = match result.status {
            JobStatus::Succeeded => "+",
            JobStatus::Skipped => "-",
            _ => "x",
        };
        out.push_str(&format!(
            "  [{}] {:<24} {:<16} {:<10} {:>8.2}s\n",
            symbol,
            result.job_id,
            result.pair_label(),
            result.status,
            result.duration_seconds,
        ));

        for test in &result.tests {
            if test.status != TestStatus::Passed {
                let label = match test.status {
                    TestStatus::Informational => "INFO",
                    _ => "FAIL",
                };
                out.push_str(&format!("       {}: {}/{}", label, test.suite, test.name));
                if let Some(msg) = &test.message {
                    out.push_str(&format!(" ({})", msg));
                }
                out.push('\n');
            }
        }
    }

    out.push_str(&"-".repeat(60));
    out.push('\n');

    out.push_str("Platform breakdown:\n");
    let mut breakdown: BTreeMap<(Platform, Architecture), Totals> = BTreeMap::new();
    for result in report.results.values() {
        let totals = breakdown
            .entry((result.platform, result.architecture))
            .or_default();
        totals.total += 1;
        match result.status {
            JobStatus::Succeeded => totals.succeeded += 1,
            JobStatus::Skipped => totals.skipped += 1,
            _ => totals.failed += 1,
        }
    }
    for ((platform, arch), totals) in &breakdown {
        out.push_str(&format!(
            "  {:<18} {} passed, {} failed, {} skipped\n",
            format!("{}/{}", platform, arch),
            totals.succeeded,
            totals.failed,
            totals.skipped
        ));
    }

    let totals = &report.totals;
    out.push_str(&format!(
        "\nTotal: {} jobs, {} succeeded, {} failed, {} skipped\n",
        totals.total, totals.succeeded, totals.failed, totals.skipped
    ));

    let failures: Vec<_> = report.failures().collect();
    if !failures.is_empty() {
        out.push_str("\nFailed jobs:\n");
        for result in failures {
            out.push_str(&format!(
                "  {} ({}): {}\n",
                result.job_id,
                result.status,
                result.error.as_deref().unwrap_or("no reason recorded")
            ));
            if let Some(log) = &result.log_path {
                out.push_str(&format!("    log: {}\n", log.display()));
            }
        }
    }

    let analysis = &report.failure_analysis;
    if !analysis.common_failures.is_empty() {
        out.push_str(&format!(
            "\nCommon failures ({} failed tests in total):\n",
            analysis.total_failures
        ));
        for common in &analysis.common_failures {
            let jobs: Vec<&str> = common.jobs.iter().map(|j| j.as_str()).collect();
            out.push_str(&format!(
                "  {}/{} failed on {} jobs: {}\n",
                common.suite,
                common.test,
                jobs.len(),
                jobs.join(", ")
            ));
        }
    }

    let with_artifacts: Vec<_> = report
        .results
        .values()
        .filter(|r| !r.artifact_paths.is_empty())
        .collect();
    if !with_artifacts.is_empty() {
        out.push_str("\nArtifacts:\n");
        for result in &with_artifacts {
            out.push_str(&format!(
                "  {:<24} {} file(s), {}\n",
                result.job_id,
                result.artifact_paths.len(),
                format_bytes(result.artifact_bytes)
            ));
        }
        let total: u64 = with_artifacts.iter().map(|r| r.artifact_bytes).sum();
        out.push_str(&format!("  total: {}\n", format_bytes(total)));
    }

    let skipped: Vec<_> = report
        .results
        .values()
        .filter(|r| r.status == JobStatus::Skipped)
        .collect();
    if !skipped.is_empty() {
        out.push_str("\nSkipped jobs:\n");
        for result in skipped {
            out.push_str(&format!(
                "  {}: {}\n",
                result.job_id,
                result.error.as_deref().unwrap_or("skipped")
            ));
        }
    }

    if !report.warnings.is_empty() {
        out.push_str("\nWarnings:\n");
        for warning in &report.warnings {
            match &warning.job_id {
                Some(job) => out.push_str(&format!(
                    "  [{}] {}: {}\n",
                    warning.kind, job, warning.message
                )),
                None => out.push_str(&format!("  [{}] {}\n", warning.kind, warning.message)),
            }
        }
    }

    if report.interrupted {
        out.push_str("\nRun was interrupted; results are partial.\n");
    }
    out.push_str(&format!(
        "\nResult: {}\n",
        if report.is_success() { "SUCCESS" } else { "FAILURE" }
    ));
    out
}
