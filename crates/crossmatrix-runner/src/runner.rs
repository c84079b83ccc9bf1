//! Job runner: build, run, exec, extract, teardown for one matrix job.

use crate::joblog::JobLog;
use crate::lifecycle::{ResourceLifecycle, ResourceScope, deadline_after};
use crossmatrix_core::config::{MatrixDocument, TestCommand};
use crossmatrix_core::error::Operation;
use crossmatrix_core::ids::{JobId, RunId};
use crossmatrix_core::job::{Job, JobResult, JobStatus, TestCaseResult, TestStatus};
use crossmatrix_core::matrix::Platform;
use crossmatrix_core::policy::PolicySettings;
use crossmatrix_core::ports::{ContainerHandle, ExecCommand, ExecutionBackend, ImageSpec, RunSpec};
use crossmatrix_core::report::{ReportWarning, WarningKind};
use crossmatrix_core::targets::BuildParameters;
use crossmatrix_core::{Error, Result};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Dockerfile and base image for one platform.
#[derive(Debug, Clone)]
pub struct PlatformImage {
    pub dockerfile: String,
    pub base_image: String,
}

#[derive(Debug, Clone)]
pub struct SuitePlan {
    pub name: String,
    pub timeout: Duration,
    pub tests: Vec<TestCommand>,
}

/// Run-wide inputs shared by every job.
#[derive(Debug, Clone)]
pub struct RunnerSettings {
    pub run_id: RunId,
    pub output_dir: PathBuf,
    pub context_dir: PathBuf,
    pub build_args: BTreeMap<String, String>,
    pub images: BTreeMap<Platform, PlatformImage>,
    pub suites: Vec<SuitePlan>,
    pub artifact_paths: Vec<String>,
    pub network: Option<String>,
}

impl RunnerSettings {
    pub fn from_document(run_id: RunId, doc: &MatrixDocument, output_dir: PathBuf) -> Self {
        let images = doc
            .platforms
            .iter()
            .map(|p| {
                (
                    p.name,
                    PlatformImage {
                        dockerfile: p.dockerfile.clone(),
                        base_image: p.base_image.clone(),
                    },
                )
            })
            .collect();

        let suites = doc
            .enabled_suites()
            .map(|(name, suite)| SuitePlan {
                name: name.clone(),
                timeout: Duration::from_secs(suite.timeout),
                tests: suite.tests.clone(),
            })
            .collect();

        Self {
            run_id,
            output_dir,
            context_dir: doc.context_dir(),
            build_args: doc.build.args.clone(),
            images,
            suites,
            artifact_paths: doc.artifacts.paths.clone(),
            network: doc.network.clone(),
        }
    }

    pub fn job_dir(&self, job: &JobId) -> PathBuf {
        self.output_dir.join(job.as_str())
    }

    pub fn log_path(&self, job: &JobId) -> PathBuf {
        self.job_dir(job).join("job.log")
    }

    fn image_tag(&self, job: &JobId) -> String {
        format!(
            "crossmatrix-{}:{}",
            job.as_str().to_lowercase(),
            self.run_id.short()
        )
    }

    fn container_name(&self, job: &JobId) -> String {
        format!("crossmatrix-{}-{}", self.run_id.short(), job.as_str())
    }

    fn build_args(&self, params: &BuildParameters, image: Option<&PlatformImage>) -> BTreeMap<String, String> {
        let mut args = self.build_args.clone();
        args.insert("TARGET".to_string(), params.target_id.clone());
        args.insert("BUILD_OPTIONS".to_string(), params.build_options.join(" "));
        args.insert("PLATFORM".to_string(), params.platform.to_string());
        args.insert("ARCH".to_string(), params.architecture.to_string());
        if let Some(image) = image {
            args.insert("BASE_IMAGE".to_string(), image.base_image.clone());
        }
        args
    }
}

/// Mutable state filled in by the steps; survives the step future being dropped.
#[derive(Default)]
struct StepState {
    tests: Vec<TestCaseResult>,
    exit_code: Option<i32>,
    artifacts: Vec<PathBuf>,
    artifact_bytes: u64,
    extraction_errors: Vec<String>,
}

impl StepState {
    fn failed_required(&self) -> Vec<&TestCaseResult> {
        self.tests
            .iter()
            .filter(|t| t.status == TestStatus::Failed)
            .collect()
    }
}

/// Inputs every step of one job reads.
struct JobContext<'a> {
    job_id: &'a JobId,
    params: &'a BuildParameters,
    policy: &'a PolicySettings,
    deadline: Instant,
}

impl JobContext<'_> {
    fn remaining(&self) -> Duration {
        self.deadline.saturating_duration_since(Instant::now())
    }
}

enum Outcome {
    Finished(Result<()>),
    TimedOut,
    Interrupted,
}

pub struct JobRunner {
    backend: Arc<dyn ExecutionBackend>,
    lifecycle: Arc<ResourceLifecycle>,
    settings: Arc<RunnerSettings>,
}

impl JobRunner {
    pub fn new(
        backend: Arc<dyn ExecutionBackend>,
        lifecycle: Arc<ResourceLifecycle>,
        settings: Arc<RunnerSettings>,
    ) -> Self {
        Self {
            backend,
            lifecycle,
            settings,
        }
    }

    /// Where the job's log lives, whether or not the job got far enough to write it.
    pub fn log_path(&self, job: &JobId) -> PathBuf {
        self.settings.log_path(job)
    }

    /// Execute one job to a terminal status. Never fails: every error ends
    /// up in the returned result.
    pub async fn run(
        &self,
        mut job: Job,
        params: &BuildParameters,
        policy: &PolicySettings,
        cancel: CancellationToken,
    ) -> JobResult {
        let job_id = job.id().clone();
        if let Err(e) = job.start() {
            error!(job = %job_id, error = %e, "Job cannot start");
            return job.to_result();
        }

        let job_dir = self.settings.job_dir(&job_id);
        let mut log = match JobLog::create(&job_dir).await {
            Ok(log) => log,
            Err(e) => {
                warn!(job = %job_id, error = %e, "Cannot create job log");
                JobLog::disabled(self.settings.log_path(&job_id))
            }
        };
        job.log_path = Some(log.path().to_path_buf());

        info!(job = %job_id, target = %params.target_id, "Starting job");

        let mut scope = self.lifecycle.scope(Some(job_id.clone()));
        let mut state = StepState::default();
        let limit = policy.per_job_timeout;
        let deadline = deadline_after(Instant::now(), limit);
        let ctx = JobContext {
            job_id: &job_id,
            params,
            policy,
            deadline,
        };

        let outcome = {
            let steps = self.steps(&ctx, &mut scope, &mut log, &mut state);
            tokio::select! {
                biased;
                _ = cancel.cancelled() => Outcome::Interrupted,
                result = tokio::time::timeout_at(deadline, steps) => match result {
                    Ok(result) => Outcome::Finished(result),
                    Err(_) => Outcome::TimedOut,
                },
            }
        };

        let (status, detail) = match outcome {
            Outcome::Interrupted => (JobStatus::Failed, Some("interrupted".to_string())),
            Outcome::TimedOut => (
                JobStatus::TimedOut,
                Some(format!("timed out after {}s", limit.as_secs())),
            ),
            Outcome::Finished(Err(e)) if e.is_timeout() => (JobStatus::TimedOut, Some(e.to_string())),
            Outcome::Finished(Err(e)) => (JobStatus::Failed, Some(e.to_string())),
            Outcome::Finished(Ok(())) => {
                let failed = state.failed_required();
                if failed.is_empty() {
                    (JobStatus::Succeeded, None)
                } else {
                    let names: Vec<&str> = failed.iter().map(|t| t.name.as_str()).collect();
                    (
                        JobStatus::Failed,
                        Some(format!("required tests failed: {}", names.join(", "))),
                    )
                }
            }
        };

        log.section(&format!("job {}", status)).await;

        if let Err(e) = job.finish(status) {
            error!(job = %job_id, error = %e, "Invalid status transition");
        }
        if let Some(detail) = detail {
            job.append_error(detail);
        }
        for message in &state.extraction_errors {
            job.append_error(message);
        }
        job.exit_code = state.exit_code;
        job.tests = std::mem::take(&mut state.tests);
        job.artifact_paths = std::mem::take(&mut state.artifacts);
        job.artifact_bytes = state.artifact_bytes;

        let keep = policy.keep_resources_on_failure
            && status.is_failure()
            && !cancel.is_cancelled();
        log.section(if keep { "keeping resources" } else { "teardown" }).await;
        scope.close(keep).await;
        log.flush().await;

        let result = job.to_result();
        match status {
            JobStatus::Succeeded => info!(
                job = %job_id,
                duration_secs = result.duration_seconds,
                "Job succeeded"
            ),
            _ => warn!(
                job = %job_id,
                status = %status,
                error = result.error.as_deref().unwrap_or(""),
                log = %log.path().display(),
                "Job did not succeed"
            ),
        }
        result
    }

    async fn steps(
        &self,
        ctx: &JobContext<'_>,
        scope: &mut ResourceScope,
        log: &mut JobLog,
        state: &mut StepState,
    ) -> Result<()> {
        let JobContext {
            job_id,
            params,
            policy,
            ..
        } = *ctx;
        let settings = &self.settings;
        let platform_image = settings.images.get(&params.platform);

        // 1. Build
        let spec = ImageSpec {
            tag: settings.image_tag(job_id),
            context_dir: settings.context_dir.clone(),
            dockerfile: platform_image
                .map(|i| i.dockerfile.clone())
                .unwrap_or_else(|| "Dockerfile".to_string()),
            docker_platform: params.docker_platform.clone(),
            build_args: settings.build_args(params, platform_image),
            owner: job_id.clone(),
        };
        log.section(&format!("build {} ({})", spec.tag, params.target_id)).await;
        let build_limit = policy.timeouts.build.min(ctx.remaining());
        let image = self.backend.build(&spec, build_limit).await?;
        scope.acquire(image.handle());
        debug!(job = %job_id, image = %image.id, "Image built");

        // 2. Run
        let run_spec = RunSpec {
            name: settings.container_name(job_id),
            docker_platform: params.docker_platform.clone(),
            network: settings.network.clone(),
            env: vec![
                ("CROSSMATRIX_JOB".to_string(), job_id.to_string()),
                ("CROSSMATRIX_TARGET".to_string(), params.target_id.clone()),
            ],
            owner: job_id.clone(),
        };
        log.section(&format!("run {}", run_spec.name)).await;
        let run_limit = policy.timeouts.run.min(ctx.remaining());
        let container = match tokio::time::timeout(run_limit, self.backend.run(&image, &run_spec)).await {
            Ok(Ok(container)) => container,
            Ok(Err(e)) => {
                if matches!(e, Error::ResourceLeak { .. }) {
                    error!(job = %job_id, error = %e, "Container leaked while starting");
                    self.lifecycle.record(ReportWarning::new(
                        WarningKind::ResourceLeak,
                        Some(job_id.clone()),
                        e.to_string(),
                    ));
                }
                return Err(e);
            }
            Err(_) => return Err(Error::timeout(Operation::Run, run_limit)),
        };
        scope.acquire(container.handle());

        // 3. Exec
        for suite in &settings.suites {
            for test in &suite.tests {
                self.exec_test(ctx, &container, suite, test, log, state).await?;
            }
        }

        // 4. Extract
        if !settings.artifact_paths.is_empty() {
            let dest = settings.job_dir(job_id).join("artifacts");
            for source in &settings.artifact_paths {
                log.section(&format!("copy-out {}", source)).await;
                match self.backend.copy_out(&container, source, &dest).await {
                    Ok(files) => {
                        for file in &files {
                            match tokio::fs::metadata(file).await {
                                Ok(meta) => state.artifact_bytes += meta.len(),
                                Err(e) => {
                                    debug!(job = %job_id, file = %file.display(), error = %e, "Cannot size artifact")
                                }
                            }
                        }
                        state.artifacts.extend(files);
                    }
                    Err(e) => {
                        warn!(job = %job_id, source = %source, error = %e, "Artifact extraction failed");
                        let message = format!("extraction of {} failed: {}", source, e);
                        self.lifecycle.record(ReportWarning::new(
                            WarningKind::Extraction,
                            Some(job_id.clone()),
                            message.clone(),
                        ));
                        state.extraction_errors.push(message);
                    }
                }
            }
        }

        Ok(())
    }

    async fn exec_test(
        &self,
        ctx: &JobContext<'_>,
        container: &ContainerHandle,
        suite: &SuitePlan,
        test: &TestCommand,
        log: &mut JobLog,
        state: &mut StepState,
    ) -> Result<()> {
        let job_id = ctx.job_id;
        let suite_limit = if suite.timeout.is_zero() {
            ctx.policy.timeouts.exec
        } else {
            suite.timeout
        };
        let limit = suite_limit.min(ctx.remaining());

        let command = ExecCommand::new(&test.name, &test.command);
        log.section(&format!("exec {}/{}: {}", suite.name, test.name, test.command))
            .await;

        let started = Instant::now();
        let result = self.backend.exec(container, &command, limit).await;
        let duration_seconds = started.elapsed().as_secs_f64();

        let (status, exit_code, message) = match result {
            Ok(output) => {
                log.exec_output(&output).await;
                let code = i32::try_from(output.exit_code).unwrap_or(i32::MAX);
                if output.success() {
                    (TestStatus::Passed, Some(code), None)
                } else {
                    (
                        TestStatus::Failed,
                        Some(code),
                        Some(format!("exited with code {}", code)),
                    )
                }
            }
            // Running out of the job budget ends the job; a suite timeout only fails the test.
            Err(e) if e.is_timeout() && Instant::now() >= ctx.deadline => return Err(e),
            Err(e) if e.is_timeout() => {
                log.section(&format!("{} timed out", test.name)).await;
                (TestStatus::Failed, None, Some(e.to_string()))
            }
            Err(e) => {
                log.section(&format!("{} failed: {}", test.name, e)).await;
                (TestStatus::Failed, None, Some(e.to_string()))
            }
        };

        let status = match status {
            TestStatus::Failed if test.optional => {
                debug!(job = %job_id, test = %test.name, "Optional test failed");
                TestStatus::Informational
            }
            other => other,
        };

        // First required failure wins; otherwise the job reports the passing code.
        match status {
            TestStatus::Failed if matches!(state.exit_code, None | Some(0)) => {
                state.exit_code = exit_code.or(state.exit_code);
            }
            TestStatus::Passed if state.exit_code.is_none() => state.exit_code = exit_code,
            _ => {}
        }

        state.tests.push(TestCaseResult {
            name: test.name.clone(),
            suite: suite.name.clone(),
            status,
            optional: test.optional,
            exit_code,
            duration_seconds,
            message,
        });

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crossmatrix_core::matrix::Architecture;

    fn settings() -> RunnerSettings {
        RunnerSettings {
            run_id: RunId::new(),
            output_dir: PathBuf::from("/tmp/out"),
            context_dir: PathBuf::from("."),
            build_args: BTreeMap::from([("VERSION".to_string(), "1.2".to_string())]),
            images: BTreeMap::new(),
            suites: Vec::new(),
            artifact_paths: Vec::new(),
            network: None,
        }
    }

    #[test]
    fn test_build_args_carry_target_and_options() {
        let params = BuildParameters {
            platform: Platform::Alpine,
            architecture: Architecture::Arm64,
            target_id: "aarch64-linux-musl".into(),
            docker_platform: "linux/arm64".into(),
            build_options: vec!["-Dstatic=true".into(), "-Dtls=false".into()],
            fallback_from: None,
        };
        let image = PlatformImage {
            dockerfile: "Dockerfile.alpine".into(),
            base_image: "alpine:3.19".into(),
        };
        let args = settings().build_args(&params, Some(&image));

        assert_eq!(args["TARGET"], "aarch64-linux-musl");
        assert_eq!(args["BUILD_OPTIONS"], "-Dstatic=true -Dtls=false");
        assert_eq!(args["BASE_IMAGE"], "alpine:3.19");
        assert_eq!(args["VERSION"], "1.2");
    }

    #[test]
    fn test_resource_names_include_run() {
        let settings = settings();
        let job = JobId::from("Linux-AMD64");
        let short = settings.run_id.short();
        assert_eq!(settings.image_tag(&job), format!("crossmatrix-linux-amd64:{short}"));
        assert!(settings.container_name(&job).contains(&short));
    }

    #[test]
    fn test_log_path_under_job_dir() {
        let settings = settings();
        let job = JobId::from("linux-amd64");
        assert_eq!(settings.log_path(&job), PathBuf::from("/tmp/out/linux-amd64/job.log"));
    }
}
