//! Matrix scheduler: turns entries into jobs, runs them, builds the report.

use chrono::{DateTime, Utc};
use crossmatrix_core::ids::{JobId, RunId};
use crossmatrix_core::job::{Job, JobResult, JobStatus};
use crossmatrix_core::matrix::MatrixEntry;
use crossmatrix_core::policy::PolicySettings;
use crossmatrix_core::ports::EnvironmentPreparer;
use crossmatrix_core::report::{Report, ReportAggregator, ReportWarning, WarningKind};
use crossmatrix_core::targets::{BuildParameters, TargetResolver};
use crossmatrix_core::{Error, Result};
use crossmatrix_runner::{JobRunner, ResourceLifecycle, deadline_after};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::PathBuf;
use std::sync::{Arc, Mutex, OnceLock, PoisonError};
use std::time::Duration;
use tokio::sync::{Semaphore, mpsc};
use tokio::task::JoinSet;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

const STOP_ON_ERROR: &str = "not started: stop-on-error";
const NOT_STARTED_INTERRUPTED: &str = "not started: interrupted";

/// Run-wide cancellation plus the grace period that starts when it is first
/// observed. `abort` cuts the grace period short.
struct Interrupt {
    token: CancellationToken,
    abort: CancellationToken,
    observed_at: OnceLock<Instant>,
    grace: Duration,
}

impl Interrupt {
    fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    fn is_aborted(&self) -> bool {
        self.abort.is_cancelled()
    }

    fn deadline(&self) -> Instant {
        deadline_after(*self.observed_at.get_or_init(Instant::now), self.grace)
    }

    /// Resolves once the run is cancelled and the grace period has passed
    /// or been abandoned.
    async fn grace_elapsed(&self) {
        self.token.cancelled().await;
        tokio::select! {
            _ = tokio::time::sleep_until(self.deadline()) => {}
            _ = self.abort.cancelled() => {
                warn!("Abandoning in-flight jobs");
            }
        }
    }

    fn remaining(&self) -> Duration {
        if self.is_aborted() {
            return Duration::ZERO;
        }
        self.deadline().saturating_duration_since(Instant::now())
    }
}

/// Start times of jobs that got a worker, for results synthesized after an
/// interrupt.
#[derive(Default)]
struct StartTimes(Mutex<HashMap<JobId, DateTime<Utc>>>);

impl StartTimes {
    fn mark(&self, job: &JobId) {
        self.0
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(job.clone(), Utc::now());
    }

    fn get(&self, job: &JobId) -> Option<DateTime<Utc>> {
        self.0
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(job)
            .copied()
    }
}

pub struct MatrixScheduler {
    run_id: RunId,
    runner: Arc<JobRunner>,
    lifecycle: Arc<ResourceLifecycle>,
    resolver: TargetResolver,
    policy: Arc<PolicySettings>,
    preparer: Option<Arc<dyn EnvironmentPreparer>>,
    cancel: CancellationToken,
    abort: CancellationToken,
}

impl MatrixScheduler {
    pub fn new(
        run_id: RunId,
        runner: Arc<JobRunner>,
        lifecycle: Arc<ResourceLifecycle>,
        policy: Arc<PolicySettings>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            run_id,
            runner,
            lifecycle,
            resolver: TargetResolver::new(),
            policy,
            preparer: None,
            cancel,
            abort: CancellationToken::new(),
        }
    }

    pub fn with_resolver(mut self, resolver: TargetResolver) -> Self {
        self.resolver = resolver;
        self
    }

    /// Token that, once the run is cancelled, stops waiting for in-flight
    /// jobs. Teardown is then bounded by the shorter of the teardown timeout
    /// and the grace period.
    pub fn with_abort(mut self, abort: CancellationToken) -> Self {
        self.abort = abort;
        self
    }

    pub fn with_preparer(mut self, preparer: Arc<dyn EnvironmentPreparer>) -> Self {
        self.preparer = Some(preparer);
        self
    }

    /// Number of workers used in parallel mode.
    pub fn worker_count(&self, runnable: &[(Job, BuildParameters)]) -> usize {
        let pairs: HashSet<_> = runnable.iter().map(|(job, _)| job.entry.pair()).collect();
        self.policy.max_parallel.unwrap_or(pairs.len()).max(1)
    }

    /// Run every entry and return the final report.
    ///
    /// Job failures never surface as errors here; only environment
    /// preparation failures and duplicate entry ids do.
    pub async fn execute(&self, entries: Vec<MatrixEntry>) -> Result<Report> {
        let mut seen = HashSet::new();
        for entry in &entries {
            if !seen.insert(entry.id.clone()) {
                return Err(Error::Aggregation(format!("duplicate job id {}", entry.id)));
            }
        }

        let run_cancel = self.cancel.child_token();
        let interrupt = Interrupt {
            token: run_cancel.clone(),
            abort: self.abort.clone(),
            observed_at: OnceLock::new(),
            grace: self.policy.grace_period,
        };
        let global_timer = self.policy.timeouts.global.map(|limit| {
            let token = run_cancel.clone();
            tokio::spawn(async move {
                tokio::time::sleep(limit).await;
                if !token.is_cancelled() {
                    warn!(limit_secs = limit.as_secs(), "Global timeout reached, cancelling run");
                    token.cancel();
                }
            })
        });

        let mut aggregator = ReportAggregator::new(self.run_id, (*self.policy).clone());
        let runnable = self.plan(entries, &mut aggregator);

        info!(
            run = %self.run_id,
            jobs = runnable.len(),
            skipped = aggregator.totals().skipped,
            parallel = self.policy.parallel,
            "Starting matrix run"
        );

        let mut run_scope = self.lifecycle.scope(None);
        if let Some(preparer) = &self.preparer {
            match preparer.prepare().await {
                Ok(Some(handle)) => {
                    run_scope.acquire(handle);
                }
                Ok(None) => {}
                Err(e) => {
                    error!(error = %e, "Environment preparation failed");
                    run_scope.close(false).await;
                    if let Some(timer) = &global_timer {
                        timer.abort();
                    }
                    return Err(e);
                }
            }
        }

        if self.policy.parallel {
            self.run_parallel(runnable, &mut aggregator, &interrupt).await;
        } else {
            self.run_sequential(runnable, &mut aggregator, &interrupt).await;
        }

        let interrupted = interrupt.is_cancelled();
        if let Some(timer) = &global_timer {
            timer.abort();
        }

        if interrupted {
            let budget = if interrupt.is_aborted() {
                self.policy.timeouts.teardown.min(self.policy.grace_period)
            } else {
                interrupt.remaining()
            };
            warn!(
                budget_secs = budget.as_secs(),
                "Run interrupted, tearing down remaining resources"
            );
            self.lifecycle.force_teardown_all(budget).await;
            run_scope.close(false).await;
        } else {
            run_scope.close(false).await;
            self.lifecycle
                .force_teardown_all(self.policy.grace_period)
                .await;
        }

        aggregator.extend_warnings(self.lifecycle.take_warnings());
        let report = aggregator.finish(interrupted);

        info!(
            run = %self.run_id,
            total = report.totals.total,
            succeeded = report.totals.succeeded,
            failed = report.totals.failed,
            skipped = report.totals.skipped,
            interrupted,
            "Matrix run finished"
        );
        Ok(report)
    }

    /// Resolve every entry; unsupported pairs are merged as Skipped here.
    fn plan(
        &self,
        entries: Vec<MatrixEntry>,
        aggregator: &mut ReportAggregator,
    ) -> Vec<(Job, BuildParameters)> {
        let mut runnable = Vec::new();
        for entry in entries {
            let mut job = Job::new(entry);
            match self.resolver.resolve_entry(&job.entry) {
                Ok(params) => {
                    if let Some((platform, arch)) = params.fallback_from {
                        aggregator.warn(ReportWarning::new(
                            WarningKind::TargetFallback,
                            Some(job.id().clone()),
                            format!(
                                "{}/{} is unsupported, built as {}",
                                platform, arch, params.target_id
                            ),
                        ));
                    }
                    runnable.push((job, params));
                }
                Err(e) => {
                    info!(job = %job.id(), reason = %e, "Skipping job");
                    if let Err(e) = job.skip(e.to_string()) {
                        error!(error = %e, "Cannot skip job");
                    }
                    merge(aggregator, job.to_result());
                }
            }
        }
        runnable
    }

    async fn run_sequential(
        &self,
        runnable: Vec<(Job, BuildParameters)>,
        aggregator: &mut ReportAggregator,
        interrupt: &Interrupt,
    ) {
        let mut halted = false;

        for (job, params) in runnable {
            if interrupt.is_cancelled() {
                merge(aggregator, skipped(job, NOT_STARTED_INTERRUPTED));
                continue;
            }
            if halted {
                merge(aggregator, skipped(job, STOP_ON_ERROR));
                continue;
            }

            let entry = job.entry.clone();
            let started_at = Utc::now();
            let run = self
                .runner
                .run(job, &params, &self.policy, interrupt.token.child_token());

            let result = tokio::select! {
                result = run => result,
                _ = interrupt.grace_elapsed() => {
                    warn!(job = %entry.id, "Job did not stop within the grace period");
                    let log_path = self.runner.log_path(&entry.id);
                    interrupted(entry, started_at, log_path)
                }
            };

            let failed = result.status.is_failure();
            merge(aggregator, result);

            if failed && !self.policy.continue_on_error {
                info!("Stopping after failure (stop-on-error)");
                halted = true;
            }
        }
    }

    async fn run_parallel(
        &self,
        runnable: Vec<(Job, BuildParameters)>,
        aggregator: &mut ReportAggregator,
        interrupt: &Interrupt,
    ) {
        if runnable.is_empty() {
            return;
        }

        let workers = self.worker_count(&runnable);
        info!(workers, "Running jobs in parallel");

        let semaphore = Arc::new(Semaphore::new(workers));
        let (tx, mut rx) = mpsc::channel::<JobResult>(runnable.len());
        let mut join_set = JoinSet::new();
        let mut outstanding: BTreeMap<JobId, MatrixEntry> = BTreeMap::new();
        let started = Arc::new(StartTimes::default());

        for (job, params) in runnable {
            outstanding.insert(job.id().clone(), job.entry.clone());

            let semaphore = Arc::clone(&semaphore);
            let runner = Arc::clone(&self.runner);
            let policy = Arc::clone(&self.policy);
            let cancel = interrupt.token.clone();
            let tx = tx.clone();
            let started = Arc::clone(&started);

            join_set.spawn(async move {
                let permit = tokio::select! {
                    biased;
                    _ = cancel.cancelled() => None,
                    permit = semaphore.acquire_owned() => permit.ok(),
                };
                let result = match permit {
                    Some(_permit) => {
                        started.mark(job.id());
                        runner.run(job, &params, &policy, cancel.child_token()).await
                    }
                    None => skipped(job, NOT_STARTED_INTERRUPTED),
                };
                let _ = tx.send(result).await;
            });
        }
        drop(tx);

        let mut timed_out = false;
        loop {
            tokio::select! {
                received = rx.recv() => match received {
                    Some(result) => {
                        outstanding.remove(&result.job_id);
                        merge(aggregator, result);
                    }
                    None => break,
                },
                _ = interrupt.grace_elapsed() => {
                    timed_out = true;
                    break;
                }
            }
        }

        if timed_out {
            warn!(
                in_flight = outstanding.len(),
                "Jobs did not stop within the grace period"
            );
            join_set.abort_all();
            while let Ok(result) = rx.try_recv() {
                outstanding.remove(&result.job_id);
                merge(aggregator, result);
            }
        }

        // Whatever never reported was in flight or still waiting for a worker.
        for (id, entry) in outstanding {
            let result = match started.get(&id) {
                Some(started_at) => {
                    let mut result = interrupted(entry, started_at, self.runner.log_path(&id));
                    if !timed_out {
                        result.error = Some("job task ended without a result".to_string());
                    }
                    result
                }
                None => skipped(Job::new(entry), NOT_STARTED_INTERRUPTED),
            };
            merge(aggregator, result);
        }

        while let Some(joined) = join_set.join_next().await {
            if let Err(e) = joined
                && e.is_panic()
            {
                error!(error = %e, "Job task panicked");
            }
        }
    }
}

fn merge(aggregator: &mut ReportAggregator, result: JobResult) {
    if let Err(e) = aggregator.merge(result) {
        error!(error = %e, "Dropping job result");
    }
}

fn skipped(mut job: Job, reason: &str) -> JobResult {
    if let Err(e) = job.skip(reason) {
        error!(job = %job.id(), error = %e, "Cannot skip job");
    }
    job.to_result()
}

/// Result for a job that was running when the run was cut short.
fn interrupted(entry: MatrixEntry, started_at: DateTime<Utc>, log_path: PathBuf) -> JobResult {
    let mut job = Job::new(entry);
    if let Err(e) = job.start().and_then(|()| job.finish(JobStatus::Failed)) {
        error!(job = %job.id(), error = %e, "Cannot mark job interrupted");
    }
    job.started_at = Some(started_at);
    job.log_path = Some(log_path);
    job.append_error("interrupted");
    job.to_result()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crossmatrix_core::matrix::{Architecture, Platform};

    #[test]
    fn test_interrupted_result_keeps_start_and_log() {
        let started_at = Utc::now() - chrono::Duration::seconds(30);
        let log_path = PathBuf::from("/out/linux-amd64/job.log");
        let result = interrupted(
            MatrixEntry::new(Platform::Linux, Architecture::Amd64),
            started_at,
            log_path.clone(),
        );
        assert_eq!(result.status, JobStatus::Failed);
        assert_eq!(result.error.as_deref(), Some("interrupted"));
        assert_eq!(result.log_path, Some(log_path));
        assert!(result.duration_seconds >= 30.0);
    }

    #[tokio::test]
    async fn test_abort_ends_grace_period_early() {
        let interrupt = Interrupt {
            token: CancellationToken::new(),
            abort: CancellationToken::new(),
            observed_at: OnceLock::new(),
            grace: Duration::MAX,
        };
        interrupt.token.cancel();
        assert!(interrupt.remaining() > Duration::from_secs(3600));

        interrupt.abort.cancel();
        tokio::time::timeout(Duration::from_secs(1), interrupt.grace_elapsed())
            .await
            .unwrap();
        assert_eq!(interrupt.remaining(), Duration::ZERO);
    }

    #[test]
    fn test_skipped_result_keeps_reason() {
        let job = Job::new(MatrixEntry::new(Platform::Alpine, Architecture::Arm64));
        let result = skipped(job, STOP_ON_ERROR);
        assert_eq!(result.status, JobStatus::Skipped);
        assert_eq!(result.error.as_deref(), Some(STOP_ON_ERROR));
    }
}
