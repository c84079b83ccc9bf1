//! Port traits between the engine and its external collaborators.
//!
//! The execution backend builds images and runs sandboxed commands; the
//! environment preparer sets up shared state (a network) once per run.

use crate::ids::JobId;
use crate::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResourceKind {
    Image,
    Container,
    Network,
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ResourceKind::Image => "image",
            ResourceKind::Container => "container",
            ResourceKind::Network => "network",
        };
        f.write_str(s)
    }
}

/// A backend-owned resource that needs explicit teardown.
///
/// `owner` is the job that created it, or `None` for run-wide resources such
/// as the shared network.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ResourceHandle {
    pub kind: ResourceKind,
    pub id: String,
    pub owner: Option<JobId>,
}

impl ResourceHandle {
    pub fn new(kind: ResourceKind, id: impl Into<String>, owner: Option<JobId>) -> Self {
        Self {
            kind,
            id: id.into(),
            owner,
        }
    }
}

impl fmt::Display for ResourceHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.kind, self.id)
    }
}

/// What to build for one job.
#[derive(Debug, Clone)]
pub struct ImageSpec {
    pub tag: String,
    pub context_dir: PathBuf,
    pub dockerfile: String,
    /// Docker platform string, e.g. `linux/arm64`.
    pub docker_platform: String,
    pub build_args: BTreeMap<String, String>,
    pub owner: JobId,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageRef {
    pub id: String,
    pub owner: JobId,
}

impl ImageRef {
    pub fn handle(&self) -> ResourceHandle {
        ResourceHandle::new(ResourceKind::Image, &self.id, Some(self.owner.clone()))
    }
}

#[derive(Debug, Clone)]
pub struct RunSpec {
    pub name: String,
    pub docker_platform: String,
    pub network: Option<String>,
    pub env: Vec<(String, String)>,
    pub owner: JobId,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerHandle {
    pub id: String,
    pub owner: JobId,
}

impl ContainerHandle {
    pub fn handle(&self) -> ResourceHandle {
        ResourceHandle::new(ResourceKind::Container, &self.id, Some(self.owner.clone()))
    }
}

/// A shell command run inside a job's container.
#[derive(Debug, Clone)]
pub struct ExecCommand {
    pub name: String,
    pub command: String,
    pub workdir: Option<String>,
}

impl ExecCommand {
    pub fn new(name: impl Into<String>, command: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            command: command.into(),
            workdir: None,
        }
    }

    /// Argument vector handed to the backend.
    pub fn argv(&self) -> Vec<String> {
        vec!["sh".to_string(), "-c".to_string(), self.command.clone()]
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExecOutput {
    pub exit_code: i64,
    pub stdout: String,
    pub stderr: String,
}

impl ExecOutput {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

/// Containerized execution backend.
///
/// Every call that takes a `Duration` must give up once it elapses and
/// return `Error::Timeout`. Callers additionally bound calls by dropping the
/// future, so implementations must tolerate cancellation at any await point.
#[async_trait]
pub trait ExecutionBackend: Send + Sync {
    /// Build an image for one job.
    async fn build(&self, spec: &ImageSpec, timeout: Duration) -> Result<ImageRef>;

    /// Start a long-lived container from a built image.
    async fn run(&self, image: &ImageRef, spec: &RunSpec) -> Result<ContainerHandle>;

    /// Run a command inside the container.
    async fn exec(
        &self,
        container: &ContainerHandle,
        command: &ExecCommand,
        timeout: Duration,
    ) -> Result<ExecOutput>;

    /// Copy a path out of the container into `dest`, returning written files.
    async fn copy_out(
        &self,
        container: &ContainerHandle,
        source: &str,
        dest: &Path,
    ) -> Result<Vec<PathBuf>>;

    /// Remove a resource. Removing something that no longer exists succeeds.
    async fn destroy(&self, handle: &ResourceHandle, timeout: Duration) -> Result<()>;
}

/// One-time environment setup run before any job.
#[async_trait]
pub trait EnvironmentPreparer: Send + Sync {
    /// Idempotent. Returns the created resource when there is one to tear down.
    async fn prepare(&self) -> Result<Option<ResourceHandle>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exec_argv_wraps_in_shell() {
        let cmd = ExecCommand::new("version", "./app --version");
        assert_eq!(cmd.argv(), vec!["sh", "-c", "./app --version"]);
    }

    #[test]
    fn test_handles_carry_owner() {
        let image = ImageRef {
            id: "sha256:abc".into(),
            owner: JobId::from("linux-amd64"),
        };
        let handle = image.handle();
        assert_eq!(handle.kind, ResourceKind::Image);
        assert_eq!(handle.owner, Some(JobId::from("linux-amd64")));
        assert_eq!(handle.to_string(), "image sha256:abc");
    }
}
