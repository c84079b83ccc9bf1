//! Integration test infrastructure for crossmatrix.
//!
//! Provides a scripted [`FakeBackend`] and fixtures that wire it into a
//! [`JobRunner`](crossmatrix_runner::JobRunner) and
//! [`MatrixScheduler`](crossmatrix_scheduler::MatrixScheduler), so the whole
//! engine can be exercised without a container runtime.
//!
//! ```ignore
//! use crossmatrix_tests::{FakeBackend, Harness, JobScript};
//!
//! let backend = FakeBackend::new().script("linux-amd64", JobScript::build_fails());
//! let harness = Harness::new(backend, policy, settings(dir.path(), vec![basic_suite()]));
//! let report = harness.scheduler(CancellationToken::new()).execute(entries).await?;
//! ```

pub mod backend;
pub mod fixtures;

pub use backend::{Call, FakeBackend, JobScript};
pub use fixtures::*;

/// Initialize test logging (call once per test binary).
pub fn init_test_logging() {
    use tracing_subscriber::{EnvFilter, fmt};

    let _ = fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("warn,crossmatrix=debug")),
        )
        .with_test_writer()
        .try_init();
}
