//! JUnit XML: one testsuite per job.
//!
//! Jobs without test results are reported as a single `job` testcase so that
//! build failures and skips still show up in CI dashboards.

use crate::escape;
use crossmatrix_core::job::{JobResult, JobStatus, TestStatus};
use crossmatrix_core::report::Report;

pub(crate) fn to_junit_xml(report: &Report) -> String {
    let mut xml = String::new();
    xml.push_str("<?xml version=\"1.0\" encoding=\"UTF-8\"?>\n");

    let (tests, failures, skipped) = report
        .results
        .values()
        .map(counts)
        .fold((0, 0, 0), |acc, c| (acc.0 + c.0, acc.1 + c.1, acc.2 + c.2));
    let time: f64 = report.results.values().map(|r| r.duration_seconds).sum();

    xml.push_str(&format!(
        "<testsuites name=\"{}\" tests=\"{}\" failures=\"{}\" errors=\"0\" skipped=\"{}\" time=\"{:.3}\">\n",
        escape(&report.run_id.to_string()),
        tests,
        failures,
        skipped,
        time
    ));

    for result in report.results.values() {
        let (tests, failures, skipped) = counts(result);
        xml.push_str(&format!(
            "  <testsuite name=\"{}\" tests=\"{}\" failures=\"{}\" errors=\"0\" skipped=\"{}\" time=\"{:.3}\">\n",
            escape(result.job_id.as_str()),
            tests,
            failures,
            skipped,
            result.duration_seconds
        ));
        xml.push_str("    <properties>\n");
        xml.push_str(&format!(
            "      <property name=\"platform\" value=\"{}\" />\n",
            result.platform
        ));
        xml.push_str(&format!(
            "      <property name=\"architecture\" value=\"{}\" />\n",
            result.architecture
        ));
        xml.push_str(&format!(
            "      <property name=\"status\" value=\"{}\" />\n",
            result.status
        ));
        xml.push_str("    </properties>\n");

        if needs_job_case(result) {
            job_case(&mut xml, result);
        }

        for test in &result.tests {
            xml.push_str(&format!(
                "    <testcase name=\"{}\" classname=\"{}.{}\" time=\"{:.3}\"",
                escape(&test.name),
                escape(result.job_id.as_str()),
                escape(&test.suite),
                test.duration_seconds
            ));
            match test.status {
                TestStatus::Passed => xml.push_str(" />\n"),
                TestStatus::Failed => {
                    xml.push_str(">\n");
                    xml.push_str(&format!(
                        "      <failure message=\"{}\" />\n",
                        escape(test.message.as_deref().unwrap_or("Test failed"))
                    ));
                    xml.push_str("    </testcase>\n");
                }
                TestStatus::Informational => {
                    xml.push_str(">\n");
                    xml.push_str(&format!(
                        "      <system-out>optional test failed: {}</system-out>\n",
                        escape(test.message.as_deref().unwrap_or("no detail"))
                    ));
                    xml.push_str("    </testcase>\n");
                }
            }
        }

        xml.push_str("  </testsuite>\n");
    }

    xml.push_str("</testsuites>\n");
    xml
}

fn has_failed_test(result: &JobResult) -> bool {
    result.tests.iter().any(|t| t.status == TestStatus::Failed)
}

/// Whether the synthetic `job` testcase is emitted for this result.
fn needs_job_case(result: &JobResult) -> bool {
    result.tests.is_empty() || (result.status != JobStatus::Succeeded && !has_failed_test(result))
}

fn counts(result: &JobResult) -> (usize, usize, usize) {
    let mut tests = result.tests.len();
    let mut failures = result
        .tests
        .iter()
        .filter(|t| t.status == TestStatus::Failed)
        .count();
    let mut skipped = 0;
    if needs_job_case(result) {
        tests += 1;
        match result.status {
            JobStatus::Skipped => skipped += 1,
            JobStatus::Succeeded => {}
            _ => failures += 1,
        }
    }
    (tests, failures, skipped)
}

fn job_case(xml: &mut String, result: &JobResult) {
    xml.push_str(&format!(
        "    <testcase name=\"job\" classname=\"{}\" time=\"{:.3}\"",
        escape(result.job_id.as_str()),
        result.duration_seconds
    ));
    let reason = escape(result.error.as_deref().unwrap_or("no reason recorded"));
    match result.status {
        JobStatus::Succeeded => xml.push_str(" />\n"),
        JobStatus::Skipped => {
            xml.push_str(">\n");
            xml.push_str(&format!("      <skipped message=\"{}\" />\n", reason));
            xml.push_str("    </testcase>\n");
        }
        status => {
            xml.push_str(">\n");
            xml.push_str(&format!(
                "      <failure message=\"{}\" type=\"{}\">",
                reason, status
            ));
            if let Some(log) = &result.log_path {
                xml.push_str(&format!("log: {}", escape(&log.display().to_string())));
            }
            xml.push_str("</failure>\n");
            xml.push_str("    </testcase>\n");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fixtures::sample_report;

    #[test]
    fn test_junit_xml_output() {
        let xml = to_junit_xml(&sample_report());

        assert!(xml.starts_with("<?xml version=\"1.0\""));
        // linux: 2 tests; alpine: job case failed; freebsd: job case skipped.
        assert!(xml.contains("tests=\"4\" failures=\"1\" errors=\"0\" skipped=\"1\""));
        assert!(xml.contains("<testsuite name=\"linux-amd64\" tests=\"2\" failures=\"0\""));
        assert!(xml.contains("classname=\"linux-amd64.basic\""));
        assert!(xml.contains("<system-out>optional test failed: exit code 1</system-out>"));
        assert!(xml.contains("<skipped message=\"unsupported combination freebsd/arm64\" />"));
    }

    #[test]
    fn test_failure_message_is_escaped() {
        let xml = to_junit_xml(&sample_report());
        assert!(xml.contains(
            "<failure message=\"build failed: &lt;missing&gt; &amp; broken\" type=\"failed\">log: out/alpine-amd64/job.log</failure>"
        ));
    }

    #[test]
    fn test_failed_test_replaces_job_case() {
        let mut report = sample_report();
        let linux = report
            .results
            .values_mut()
            .find(|r| r.job_id.as_str() == "linux-amd64")
            .unwrap();
        linux.status = JobStatus::Failed;
        linux.tests[0].status = TestStatus::Failed;
        linux.tests[0].message = Some("exit code 2".to_string());

        let xml = to_junit_xml(&report);
        assert!(xml.contains("<testsuite name=\"linux-amd64\" tests=\"2\" failures=\"1\""));
        assert!(xml.contains("<failure message=\"exit code 2\" />"));
    }
}
