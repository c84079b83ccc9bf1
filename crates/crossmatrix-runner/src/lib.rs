//! Job execution for crossmatrix.
//!
//! The [`JobRunner`] drives one job through build, run, exec and extraction
//! against an [`ExecutionBackend`](crossmatrix_core::ports::ExecutionBackend).
//! Every backend resource it creates is registered with the
//! [`ResourceLifecycle`], which guarantees an attempted teardown on every exit
//! path.

pub mod archive;
pub mod container;
pub mod environments;
pub mod joblog;
pub mod lifecycle;
pub mod runner;

pub use container::{DockerBackend, DockerConfig};
pub use environments::{NetworkPreparer, NoopPreparer};
pub use joblog::{JobLog, OutputLine, OutputStream};
pub use lifecycle::{deadline_after, ResourceKey, ResourceLifecycle, ResourceScope, TeardownConfig};
pub use runner::{JobRunner, PlatformImage, RunnerSettings, SuitePlan};
