//! Run report and the aggregation point that builds it.

use crate::error::{Error, Result};
use crate::ids::{JobId, RunId};
use crate::job::{JobResult, JobStatus, TestStatus};
use crate::policy::PolicySettings;
use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct Totals {
    pub total: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub skipped: usize,
}

impl Totals {
    fn count(&mut self, status: JobStatus) {
        self.total += 1;
        match status {
            JobStatus::Succeeded => self.succeeded += 1,
            JobStatus::Failed | JobStatus::TimedOut => self.failed += 1,
            JobStatus::Skipped => self.skipped += 1,
            // Non-terminal results are never merged.
            JobStatus::Pending | JobStatus::Running => {}
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum WarningKind {
    ResourceLeak,
    ResourceKept,
    Extraction,
    TargetFallback,
}

impl fmt::Display for WarningKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            WarningKind::ResourceLeak => "resource_leak",
            WarningKind::ResourceKept => "resource_kept",
            WarningKind::Extraction => "extraction",
            WarningKind::TargetFallback => "target_fallback",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ReportWarning {
    pub kind: WarningKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub job_id: Option<JobId>,
    pub message: String,
}

impl ReportWarning {
    pub fn new(kind: WarningKind, job_id: Option<JobId>, message: impl Into<String>) -> Self {
        Self {
            kind,
            job_id,
            message: message.into(),
        }
    }
}

/// A required test that failed in more than one job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct CommonFailure {
    pub suite: String,
    pub test: String,
    pub jobs: Vec<JobId>,
}

/// Cross-job view of required test failures.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct FailureAnalysis {
    /// Failed required tests across all jobs.
    pub total_failures: usize,
    /// Ordered by suite, then test name.
    pub common_failures: Vec<CommonFailure>,
}

impl FailureAnalysis {
    pub fn from_results<'a>(results: impl IntoIterator<Item = &'a JobResult>) -> Self {
        let mut total_failures = 0;
        let mut by_test: BTreeMap<(&str, &str), Vec<JobId>> = BTreeMap::new();
        for result in results {
            for test in result.tests.iter().filter(|t| t.status == TestStatus::Failed) {
                total_failures += 1;
                let jobs = by_test
                    .entry((test.suite.as_str(), test.name.as_str()))
                    .or_default();
                if !jobs.contains(&result.job_id) {
                    jobs.push(result.job_id.clone());
                }
            }
        }

        let common_failures = by_test
            .into_iter()
            .filter(|(_, jobs)| jobs.len() > 1)
            .map(|((suite, test), jobs)| CommonFailure {
                suite: suite.to_string(),
                test: test.to_string(),
                jobs,
            })
            .collect();

        Self {
            total_failures,
            common_failures,
        }
    }
}

/// The run's final output document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct Report {
    pub run_id: RunId,
    pub timestamp: DateTime<Utc>,
    pub policy: PolicySettings,
    pub totals: Totals,
    pub results: BTreeMap<JobId, JobResult>,
    #[serde(default)]
    pub warnings: Vec<ReportWarning>,
    #[serde(default)]
    pub failure_analysis: FailureAnalysis,
    #[serde(default)]
    pub interrupted: bool,
}

impl Report {
    /// Whether the run counts as successful for the process exit status.
    ///
    /// Continue-on-error runs need at least one success. Stop-on-error runs
    /// need at least one scheduled job and no failures. Interrupted runs
    /// never succeed.
    pub fn is_success(&self) -> bool {
        if self.interrupted {
            return false;
        }
        if self.policy.continue_on_error {
            self.totals.succeeded > 0
        } else {
            self.totals.total > 0 && self.totals.failed == 0
        }
    }

    pub fn failures(&self) -> impl Iterator<Item = &JobResult> {
        self.results.values().filter(|r| r.status.is_failure())
    }
}

/// Single writer of the run's results.
///
/// The scheduler owns one aggregator and feeds every job result through
/// [`merge`](Self::merge); totals are only ever derived from merged results.
#[derive(Debug)]
pub struct ReportAggregator {
    run_id: RunId,
    started_at: DateTime<Utc>,
    policy: PolicySettings,
    totals: Totals,
    results: BTreeMap<JobId, JobResult>,
    warnings: Vec<ReportWarning>,
}

impl ReportAggregator {
    pub fn new(run_id: RunId, policy: PolicySettings) -> Self {
        Self {
            run_id,
            started_at: Utc::now(),
            policy,
            totals: Totals::default(),
            results: BTreeMap::new(),
            warnings: Vec::new(),
        }
    }

    pub fn merge(&mut self, result: JobResult) -> Result<()> {
        if !result.status.is_terminal() {
            return Err(Error::Aggregation(format!(
                "job {} merged while {}",
                result.job_id, result.status
            )));
        }
        if self.results.contains_key(&result.job_id) {
            return Err(Error::Aggregation(format!(
                "duplicate result for job {}",
                result.job_id
            )));
        }
        self.totals.count(result.status);
        self.results.insert(result.job_id.clone(), result);
        Ok(())
    }

    pub fn warn(&mut self, warning: ReportWarning) {
        self.warnings.push(warning);
    }

    pub fn extend_warnings(&mut self, warnings: impl IntoIterator<Item = ReportWarning>) {
        self.warnings.extend(warnings);
    }

    pub fn contains(&self, job_id: &JobId) -> bool {
        self.results.contains_key(job_id)
    }

    pub fn totals(&self) -> Totals {
        self.totals
    }

    pub fn finish(self, interrupted: bool) -> Report {
        let failure_analysis = FailureAnalysis::from_results(self.results.values());
        Report {
            run_id: self.run_id,
            timestamp: self.started_at,
            policy: self.policy,
            totals: self.totals,
            results: self.results,
            warnings: self.warnings,
            failure_analysis,
            interrupted,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::TestCaseResult;
    use crate::matrix::{Architecture, Platform};

    fn result(id: &str, status: JobStatus) -> JobResult {
        JobResult {
            job_id: JobId::from(id),
            platform: Platform::Linux,
            architecture: Architecture::Amd64,
            status,
            duration_seconds: 0.0,
            exit_code: None,
            artifact_paths: Vec::new(),
            artifact_bytes: 0,
            log_path: None,
            error: None,
            tests: Vec::new(),
        }
    }

    #[test]
    fn test_timed_out_counts_as_failed() {
        let mut agg = ReportAggregator::new(RunId::new(), PolicySettings::default());
        agg.merge(result("a", JobStatus::Succeeded)).unwrap();
        agg.merge(result("b", JobStatus::TimedOut)).unwrap();
        agg.merge(result("c", JobStatus::Skipped)).unwrap();

        let totals = agg.totals();
        assert_eq!(totals.total, 3);
        assert_eq!(totals.succeeded, 1);
        assert_eq!(totals.failed, 1);
        assert_eq!(totals.skipped, 1);
    }

    #[test]
    fn test_duplicate_merge_rejected() {
        let mut agg = ReportAggregator::new(RunId::new(), PolicySettings::default());
        agg.merge(result("a", JobStatus::Succeeded)).unwrap();
        let err = agg.merge(result("a", JobStatus::Failed)).unwrap_err();
        assert!(matches!(err, Error::Aggregation(_)));
        assert_eq!(agg.totals().total, 1);
    }

    #[test]
    fn test_non_terminal_merge_rejected() {
        let mut agg = ReportAggregator::new(RunId::new(), PolicySettings::default());
        assert!(agg.merge(result("a", JobStatus::Running)).is_err());
    }

    fn failing(id: &str, tests: &[&str]) -> JobResult {
        let mut r = result(id, JobStatus::Failed);
        r.tests = tests
            .iter()
            .map(|name| TestCaseResult {
                name: name.to_string(),
                suite: "basic".to_string(),
                status: TestStatus::Failed,
                optional: false,
                exit_code: Some(1),
                duration_seconds: 0.1,
                message: Some("exited with code 1".to_string()),
            })
            .collect();
        r
    }

    #[test]
    fn test_failure_analysis_finds_shared_failures() {
        let mut agg = ReportAggregator::new(RunId::new(), PolicySettings::default());
        agg.merge(failing("linux-amd64", &["version", "listen"])).unwrap();
        agg.merge(failing("alpine-amd64", &["listen"])).unwrap();
        agg.merge(failing("netbsd-amd64", &["listen", "version"])).unwrap();
        agg.merge(failing("linux-arm64", &["ipv6"])).unwrap();

        let analysis = agg.finish(false).failure_analysis;
        assert_eq!(analysis.total_failures, 6);
        let shared: Vec<(&str, usize)> = analysis
            .common_failures
            .iter()
            .map(|c| (c.test.as_str(), c.jobs.len()))
            .collect();
        assert_eq!(shared, vec![("listen", 3), ("version", 2)]);
        assert_eq!(
            analysis.common_failures[1].jobs,
            vec![JobId::from("linux-amd64"), JobId::from("netbsd-amd64")]
        );
    }

    #[test]
    fn test_exit_rule() {
        let mut agg = ReportAggregator::new(RunId::new(), PolicySettings::default());
        agg.merge(result("a", JobStatus::Failed)).unwrap();
        agg.merge(result("b", JobStatus::Succeeded)).unwrap();
        assert!(agg.finish(false).is_success());

        let stop = PolicySettings::default().with_continue_on_error(false);
        let mut agg = ReportAggregator::new(RunId::new(), stop.clone());
        agg.merge(result("a", JobStatus::Failed)).unwrap();
        agg.merge(result("b", JobStatus::Succeeded)).unwrap();
        assert!(!agg.finish(false).is_success());

        let empty = ReportAggregator::new(RunId::new(), stop);
        assert!(!empty.finish(false).is_success());

        let mut agg = ReportAggregator::new(RunId::new(), PolicySettings::default());
        agg.merge(result("a", JobStatus::Succeeded)).unwrap();
        assert!(!agg.finish(true).is_success());
    }
}
