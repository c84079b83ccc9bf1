//! Test fixtures for assembling a scheduler around the fake backend.

use crate::backend::FakeBackend;
use crossmatrix_core::config::TestCommand;
use crossmatrix_core::ids::RunId;
use crossmatrix_core::matrix::{Architecture, MatrixEntry, Platform};
use crossmatrix_core::policy::PolicySettings;
use crossmatrix_core::ports::ExecutionBackend;
use crossmatrix_runner::{
    JobRunner, PlatformImage, ResourceLifecycle, RunnerSettings, SuitePlan, TeardownConfig,
};
use crossmatrix_scheduler::MatrixScheduler;
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

pub fn entry(platform: Platform, architecture: Architecture) -> MatrixEntry {
    MatrixEntry::new(platform, architecture)
}

/// One suite with a single required `version` test.
pub fn basic_suite() -> SuitePlan {
    SuitePlan {
        name: "basic".to_string(),
        timeout: Duration::from_secs(60),
        tests: vec![test_command("version", "./app --version", false)],
    }
}

pub fn test_command(name: &str, command: &str, optional: bool) -> TestCommand {
    TestCommand {
        name: name.to_string(),
        command: command.to_string(),
        optional,
    }
}

pub fn settings(output_dir: &Path, suites: Vec<SuitePlan>) -> RunnerSettings {
    let images = Platform::ALL
        .into_iter()
        .map(|platform| {
            (
                platform,
                PlatformImage {
                    dockerfile: format!("Dockerfile.{platform}"),
                    base_image: "ubuntu:22.04".to_string(),
                },
            )
        })
        .collect();

    RunnerSettings {
        run_id: RunId::new(),
        output_dir: output_dir.to_path_buf(),
        context_dir: output_dir.to_path_buf(),
        build_args: BTreeMap::new(),
        images,
        suites,
        artifact_paths: Vec::new(),
        network: None,
    }
}

/// Teardown settings with short retry delays.
pub fn fast_teardown() -> TeardownConfig {
    TeardownConfig {
        attempts: 3,
        attempt_timeout: Duration::from_secs(5),
        retry_delay: Duration::from_millis(10),
    }
}

/// Everything a scheduler needs, wired around one fake backend.
pub struct Harness {
    pub backend: Arc<FakeBackend>,
    pub lifecycle: Arc<ResourceLifecycle>,
    pub runner: Arc<JobRunner>,
    pub policy: PolicySettings,
}

impl Harness {
    pub fn new(backend: FakeBackend, policy: PolicySettings, settings: RunnerSettings) -> Self {
        let backend = Arc::new(backend);
        let dyn_backend: Arc<dyn ExecutionBackend> = backend.clone();
        let lifecycle = ResourceLifecycle::new(Arc::clone(&dyn_backend), fast_teardown());
        let runner = Arc::new(JobRunner::new(
            dyn_backend,
            Arc::clone(&lifecycle),
            Arc::new(settings),
        ));
        Self {
            backend,
            lifecycle,
            runner,
            policy,
        }
    }

    pub fn scheduler(&self, cancel: CancellationToken) -> MatrixScheduler {
        MatrixScheduler::new(
            RunId::new(),
            Arc::clone(&self.runner),
            Arc::clone(&self.lifecycle),
            Arc::new(self.policy.clone()),
            cancel,
        )
    }
}
