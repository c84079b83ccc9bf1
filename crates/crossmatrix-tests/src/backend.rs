//! Scripted in-memory execution backend.
//!
//! Behaviour is configured per job id; every call is recorded so tests can
//! check which resources were created and destroyed, and how often.

use async_trait::async_trait;
use crossmatrix_core::error::Operation;
use crossmatrix_core::ids::JobId;
use crossmatrix_core::ports::{
    ContainerHandle, ExecCommand, ExecOutput, ExecutionBackend, ImageRef, ImageSpec,
    ResourceHandle, ResourceKind, RunSpec,
};
use crossmatrix_core::{Error, Result};
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

/// How the backend behaves for one job.
#[derive(Debug, Clone, Default)]
pub struct JobScript {
    pub build_fails: bool,
    pub build_delay: Duration,
    pub run_fails: bool,
    pub run_delay: Duration,
    /// `run` reports a container it could neither start nor remove.
    pub run_leaks: bool,
    pub exec_delay: Duration,
    /// Exit code for every command unless overridden by name.
    pub exit_code: i64,
    pub exit_codes: HashMap<String, i64>,
    pub copy_fails: bool,
}

impl JobScript {
    pub fn build_fails() -> Self {
        Self {
            build_fails: true,
            ..Self::default()
        }
    }

    pub fn build_hangs() -> Self {
        Self {
            build_delay: Duration::from_secs(3600),
            ..Self::default()
        }
    }

    pub fn run_hangs() -> Self {
        Self {
            run_delay: Duration::from_secs(3600),
            ..Self::default()
        }
    }

    pub fn run_leaks() -> Self {
        Self {
            run_leaks: true,
            ..Self::default()
        }
    }

    pub fn exec_takes(delay: Duration) -> Self {
        Self {
            exec_delay: delay,
            ..Self::default()
        }
    }

    pub fn exit_code(code: i64) -> Self {
        Self {
            exit_code: code,
            ..Self::default()
        }
    }

    pub fn with_exit_code_for(mut self, command: &str, code: i64) -> Self {
        self.exit_codes.insert(command.to_string(), code);
        self
    }

    pub fn with_copy_failure(mut self) -> Self {
        self.copy_fails = true;
        self
    }
}

/// One recorded backend call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Call {
    Build(JobId),
    Run(JobId),
    Exec(JobId, String),
    CopyOut(JobId, String),
    Destroy(ResourceHandle),
}

#[derive(Default)]
pub struct FakeBackend {
    scripts: Mutex<HashMap<JobId, JobScript>>,
    /// Remaining failing destroy attempts per resource id.
    destroy_failures: Mutex<HashMap<String, u32>>,
    /// Resource ids whose destroy never completes.
    hanging_destroys: Mutex<HashSet<String>>,
    calls: Mutex<Vec<Call>>,
    created: Mutex<Vec<ResourceHandle>>,
    running_execs: AtomicUsize,
    peak_execs: AtomicUsize,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl FakeBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn script(self, job: &str, script: JobScript) -> Self {
        lock(&self.scripts).insert(JobId::from(job), script);
        self
    }

    /// Make the first `attempts` destroy calls for `resource_id` fail.
    pub fn fail_destroy(self, resource_id: &str, attempts: u32) -> Self {
        lock(&self.destroy_failures).insert(resource_id.to_string(), attempts);
        self
    }

    /// Make every destroy call for `resource_id` hang.
    pub fn hang_destroy(self, resource_id: &str) -> Self {
        lock(&self.hanging_destroys).insert(resource_id.to_string());
        self
    }

    pub fn image_id(job: &str) -> String {
        format!("img-{job}")
    }

    pub fn container_id(job: &str) -> String {
        format!("ctr-{job}")
    }

    pub fn calls(&self) -> Vec<Call> {
        lock(&self.calls).clone()
    }

    /// Jobs that reached `build`, in call order.
    pub fn builds(&self) -> Vec<JobId> {
        self.calls()
            .into_iter()
            .filter_map(|c| match c {
                Call::Build(job) => Some(job),
                _ => None,
            })
            .collect()
    }

    pub fn created(&self) -> Vec<ResourceHandle> {
        lock(&self.created).clone()
    }

    pub fn destroyed(&self) -> Vec<ResourceHandle> {
        self.calls()
            .into_iter()
            .filter_map(|c| match c {
                Call::Destroy(handle) => Some(handle),
                _ => None,
            })
            .collect()
    }

    /// Number of destroy calls made for `handle`.
    pub fn destroy_count(&self, handle: &ResourceHandle) -> usize {
        self.destroyed().iter().filter(|h| *h == handle).count()
    }

    /// Highest number of execs observed in flight at once.
    pub fn peak_concurrent_execs(&self) -> usize {
        self.peak_execs.load(Ordering::SeqCst)
    }

    fn script_for(&self, job: &JobId) -> JobScript {
        lock(&self.scripts).get(job).cloned().unwrap_or_default()
    }

    fn record(&self, call: Call) {
        lock(&self.calls).push(call);
    }

    /// Sleep for `delay`, or fail with a timeout once `limit` is reached.
    async fn wait(operation: Operation, delay: Duration, limit: Duration) -> Result<()> {
        if delay > limit {
            tokio::time::sleep(limit).await;
            return Err(Error::timeout(operation, limit));
        }
        tokio::time::sleep(delay).await;
        Ok(())
    }
}

/// Decrements the in-flight exec counter when the exec ends or is dropped.
struct ExecGuard<'a>(&'a AtomicUsize);

impl Drop for ExecGuard<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl ExecutionBackend for FakeBackend {
    async fn build(&self, spec: &ImageSpec, timeout: Duration) -> Result<ImageRef> {
        self.record(Call::Build(spec.owner.clone()));
        let script = self.script_for(&spec.owner);

        Self::wait(Operation::Build, script.build_delay, timeout).await?;
        if script.build_fails {
            return Err(Error::backend(Operation::Build, "build step exited with code 1"));
        }

        let image = ImageRef {
            id: Self::image_id(spec.owner.as_str()),
            owner: spec.owner.clone(),
        };
        lock(&self.created).push(image.handle());
        Ok(image)
    }

    async fn run(&self, image: &ImageRef, spec: &RunSpec) -> Result<ContainerHandle> {
        self.record(Call::Run(spec.owner.clone()));
        let script = self.script_for(&spec.owner);
        tokio::time::sleep(script.run_delay).await;
        if script.run_leaks {
            return Err(Error::ResourceLeak {
                resource: format!("container {}", Self::container_id(spec.owner.as_str())),
                attempts: 1,
                message: "start failed: exec format error; removal failed: daemon gone".to_string(),
            });
        }
        if script.run_fails {
            return Err(Error::backend(
                Operation::Run,
                format!("cannot start container from {}", image.id),
            ));
        }

        let container = ContainerHandle {
            id: Self::container_id(spec.owner.as_str()),
            owner: spec.owner.clone(),
        };
        lock(&self.created).push(container.handle());
        Ok(container)
    }

    async fn exec(
        &self,
        container: &ContainerHandle,
        command: &ExecCommand,
        timeout: Duration,
    ) -> Result<ExecOutput> {
        self.record(Call::Exec(container.owner.clone(), command.name.clone()));
        let script = self.script_for(&container.owner);

        let running = self.running_execs.fetch_add(1, Ordering::SeqCst) + 1;
        let _guard = ExecGuard(&self.running_execs);
        self.peak_execs.fetch_max(running, Ordering::SeqCst);

        Self::wait(Operation::Exec, script.exec_delay, timeout).await?;

        let exit_code = script
            .exit_codes
            .get(&command.name)
            .copied()
            .unwrap_or(script.exit_code);
        Ok(ExecOutput {
            exit_code,
            stdout: format!("{}\n", command.command),
            stderr: String::new(),
        })
    }

    async fn copy_out(
        &self,
        container: &ContainerHandle,
        source: &str,
        dest: &Path,
    ) -> Result<Vec<PathBuf>> {
        self.record(Call::CopyOut(container.owner.clone(), source.to_string()));
        if self.script_for(&container.owner).copy_fails {
            return Err(Error::backend(
                Operation::CopyOut,
                format!("{} not found in {}", source, container.id),
            ));
        }

        let name = Path::new(source)
            .file_name()
            .map(|n| n.to_os_string())
            .unwrap_or_else(|| "artifact".into());
        tokio::fs::create_dir_all(dest).await?;
        let path = dest.join(name);
        tokio::fs::write(&path, container.owner.as_str()).await?;
        Ok(vec![path])
    }

    async fn destroy(&self, handle: &ResourceHandle, _timeout: Duration) -> Result<()> {
        self.record(Call::Destroy(handle.clone()));

        let hangs = lock(&self.hanging_destroys).contains(&handle.id);
        if hangs {
            std::future::pending::<()>().await;
        }

        let mut failures = lock(&self.destroy_failures);
        if let Some(remaining) = failures.get_mut(&handle.id)
            && *remaining > 0
        {
            *remaining -= 1;
            return Err(Error::backend(
                Operation::Destroy,
                format!("{} is busy", handle),
            ));
        }
        Ok(())
    }
}

/// Handle for a resource the fake backend creates for `job`.
pub fn handle(kind: ResourceKind, job: &str) -> ResourceHandle {
    let id = match kind {
        ResourceKind::Image => FakeBackend::image_id(job),
        ResourceKind::Container => FakeBackend::container_id(job),
        ResourceKind::Network => format!("net-{job}"),
    };
    ResourceHandle::new(kind, id, Some(JobId::from(job)))
}
