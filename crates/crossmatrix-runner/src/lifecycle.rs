//! Resource lifecycle management.
//!
//! Every backend resource (image, container, network) is registered here as
//! soon as it exists. A registered handle is either `Live` or `TearingDown`;
//! whoever moves it to `TearingDown` owns the teardown, so each handle gets
//! exactly one teardown sequence no matter how many paths race to clean up
//! (job completion, a dropped scope, run-wide interruption).

use crossmatrix_core::error::Operation;
use crossmatrix_core::ids::JobId;
use crossmatrix_core::policy::PolicySettings;
use crossmatrix_core::ports::{ExecutionBackend, ResourceHandle};
use crossmatrix_core::report::{ReportWarning, WarningKind};
use crossmatrix_core::{Error, Result};
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

/// `start + limit`, saturating to a far-future instant instead of overflowing.
pub fn deadline_after(start: Instant, limit: Duration) -> Instant {
    const FAR_FUTURE: Duration = Duration::from_secs(86400 * 365 * 30);
    start
        .checked_add(limit)
        .or_else(|| start.checked_add(FAR_FUTURE))
        .unwrap_or(start)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ResourceKey(u64);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ResourceState {
    Live,
    TearingDown,
}

#[derive(Debug)]
struct Entry {
    handle: ResourceHandle,
    state: ResourceState,
}

#[derive(Debug, Default)]
struct Registry {
    next: u64,
    entries: BTreeMap<ResourceKey, Entry>,
}

/// Teardown settings.
#[derive(Debug, Clone)]
pub struct TeardownConfig {
    pub attempts: u32,
    pub attempt_timeout: Duration,
    pub retry_delay: Duration,
}

impl Default for TeardownConfig {
    fn default() -> Self {
        Self {
            attempts: 3,
            attempt_timeout: Duration::from_secs(60),
            retry_delay: Duration::from_millis(500),
        }
    }
}

impl From<&PolicySettings> for TeardownConfig {
    fn from(policy: &PolicySettings) -> Self {
        Self {
            attempts: policy.teardown_attempts.max(1),
            attempt_timeout: policy.timeouts.teardown,
            ..Self::default()
        }
    }
}

pub struct ResourceLifecycle {
    backend: Arc<dyn ExecutionBackend>,
    config: TeardownConfig,
    registry: Mutex<Registry>,
    warnings: Mutex<Vec<ReportWarning>>,
}

impl ResourceLifecycle {
    pub fn new(backend: Arc<dyn ExecutionBackend>, config: TeardownConfig) -> Arc<Self> {
        Arc::new(Self {
            backend,
            config,
            registry: Mutex::new(Registry::default()),
            warnings: Mutex::new(Vec::new()),
        })
    }

    /// Open a scope whose resources belong to `owner` (`None` for the run).
    pub fn scope(self: &Arc<Self>, owner: Option<JobId>) -> ResourceScope {
        ResourceScope {
            lifecycle: Arc::clone(self),
            owner,
            keys: Vec::new(),
            closed: false,
        }
    }

    /// Number of handles not yet fully torn down.
    pub fn live_count(&self) -> usize {
        self.registry().entries.len()
    }

    pub fn take_warnings(&self) -> Vec<ReportWarning> {
        std::mem::take(&mut *self.warnings())
    }

    fn registry(&self) -> MutexGuard<'_, Registry> {
        self.registry.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn warnings(&self) -> MutexGuard<'_, Vec<ReportWarning>> {
        self.warnings.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn register(&self, handle: ResourceHandle) -> ResourceKey {
        let mut registry = self.registry();
        let key = ResourceKey(registry.next);
        registry.next += 1;
        debug!(resource = %handle, "Registered resource");
        registry.entries.insert(
            key,
            Entry {
                handle,
                state: ResourceState::Live,
            },
        );
        key
    }

    /// Move a Live handle to TearingDown. Only the caller that wins gets it.
    fn claim(&self, key: ResourceKey) -> Option<ResourceHandle> {
        let mut registry = self.registry();
        let entry = registry.entries.get_mut(&key)?;
        if entry.state != ResourceState::Live {
            return None;
        }
        entry.state = ResourceState::TearingDown;
        Some(entry.handle.clone())
    }

    fn remove(&self, key: ResourceKey) {
        self.registry().entries.remove(&key);
    }

    /// Add a run-wide warning to the report.
    pub fn record(&self, warning: ReportWarning) {
        self.warnings().push(warning);
    }

    /// Tear down one handle if nobody else has claimed it.
    async fn teardown(&self, key: ResourceKey) {
        let Some(handle) = self.claim(key) else {
            return;
        };

        match self.destroy_with_retry(&handle).await {
            Ok(()) => {
                debug!(resource = %handle, "Resource torn down");
            }
            Err(e) => {
                error!(resource = %handle, error = %e, "Resource leaked");
                self.record(ReportWarning::new(
                    WarningKind::ResourceLeak,
                    handle.owner.clone(),
                    e.to_string(),
                ));
            }
        }
        self.remove(key);
    }

    async fn destroy_with_retry(&self, handle: &ResourceHandle) -> Result<()> {
        let attempts = self.config.attempts.max(1);
        let limit = self.config.attempt_timeout;
        let mut last_error = None;

        for attempt in 1..=attempts {
            if attempt > 1 {
                tokio::time::sleep(self.config.retry_delay).await;
            }

            let outcome = match tokio::time::timeout(limit, self.backend.destroy(handle, limit)).await
            {
                Ok(result) => result,
                Err(_) => Err(Error::timeout(Operation::Destroy, limit)),
            };

            match outcome {
                Ok(()) => return Ok(()),
                Err(e) => {
                    warn!(resource = %handle, attempt, error = %e, "Teardown attempt failed");
                    last_error = Some(e);
                }
            }
        }

        Err(Error::ResourceLeak {
            resource: handle.to_string(),
            attempts,
            message: last_error
                .map(|e| e.to_string())
                .unwrap_or_else(|| "unknown error".to_string()),
        })
    }

    /// Release a handle without destroying it.
    fn retain(&self, key: ResourceKey) {
        let removed = self.registry().entries.remove(&key);
        if let Some(entry) = removed {
            info!(resource = %entry.handle, "Keeping resource for inspection");
            self.record(ReportWarning::new(
                WarningKind::ResourceKept,
                entry.handle.owner.clone(),
                format!("{} kept for inspection", entry.handle),
            ));
        }
    }

    /// Tear down every Live handle, bounded by `grace`.
    ///
    /// Job-owned handles go first and concurrently, run-owned ones (the
    /// shared network) after them. Whatever is still registered when the
    /// grace period ends is reported as leaked.
    pub async fn force_teardown_all(&self, grace: Duration) {
        let (job_keys, run_keys): (Vec<_>, Vec<_>) = self
            .registry()
            .entries
            .iter()
            .filter(|(_, e)| e.state == ResourceState::Live)
            .map(|(k, e)| (*k, e.handle.owner.is_some()))
            .partition(|(_, job_owned)| *job_owned);

        let count = job_keys.len() + run_keys.len();
        if count > 0 {
            info!(count, "Forcing teardown of remaining resources");
        }

        let deadline = deadline_after(Instant::now(), grace);
        for keys in [job_keys, run_keys] {
            let all = futures::future::join_all(keys.into_iter().map(|(k, _)| self.teardown(k)));
            if tokio::time::timeout_at(deadline, all).await.is_err() {
                warn!(grace_secs = grace.as_secs(), "Teardown did not finish within grace period");
                break;
            }
        }

        // Handles claimed by other callers may still be finishing.
        while self.live_count() > 0 && Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }

        let stranded: Vec<Entry> = {
            let mut registry = self.registry();
            std::mem::take(&mut registry.entries).into_values().collect()
        };
        for entry in stranded {
            self.record(ReportWarning::new(
                WarningKind::ResourceLeak,
                entry.handle.owner.clone(),
                format!("{} not torn down within the grace period", entry.handle),
            ));
        }
    }
}

/// Resources acquired on behalf of one owner.
///
/// Close explicitly with [`close`](Self::close). A scope dropped while still
/// open (a cancelled task, a panic) schedules its teardown on the runtime.
pub struct ResourceScope {
    lifecycle: Arc<ResourceLifecycle>,
    owner: Option<JobId>,
    keys: Vec<ResourceKey>,
    closed: bool,
}

impl ResourceScope {
    pub fn owner(&self) -> Option<&JobId> {
        self.owner.as_ref()
    }

    pub fn acquire(&mut self, handle: ResourceHandle) -> ResourceKey {
        let key = self.lifecycle.register(handle);
        self.keys.push(key);
        key
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    /// Tear down in reverse acquisition order, or release with `keep`.
    pub async fn close(mut self, keep: bool) {
        self.closed = true;
        let keys = std::mem::take(&mut self.keys);
        for key in keys.into_iter().rev() {
            if keep {
                self.lifecycle.retain(key);
            } else {
                self.lifecycle.teardown(key).await;
            }
        }
    }
}

impl Drop for ResourceScope {
    fn drop(&mut self) {
        if self.closed || self.keys.is_empty() {
            return;
        }
        let keys = std::mem::take(&mut self.keys);
        let lifecycle = Arc::clone(&self.lifecycle);
        match tokio::runtime::Handle::try_current() {
            Ok(rt) => {
                rt.spawn(async move {
                    for key in keys.into_iter().rev() {
                        lifecycle.teardown(key).await;
                    }
                });
            }
            Err(_) => {
                // Left registered; force_teardown_all or the leak report picks them up.
                warn!(count = keys.len(), "Resource scope dropped outside a runtime");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use crossmatrix_core::ports::*;
    use std::path::{Path, PathBuf};
    use std::sync::atomic::{AtomicU32, Ordering};

    #[derive(Default)]
    struct CountingBackend {
        destroys: Mutex<Vec<String>>,
        failures_left: AtomicU32,
    }

    #[async_trait]
    impl ExecutionBackend for CountingBackend {
        async fn build(&self, _: &ImageSpec, _: Duration) -> Result<ImageRef> {
            unreachable!()
        }
        async fn run(&self, _: &ImageRef, _: &RunSpec) -> Result<ContainerHandle> {
            unreachable!()
        }
        async fn exec(&self, _: &ContainerHandle, _: &ExecCommand, _: Duration) -> Result<ExecOutput> {
            unreachable!()
        }
        async fn copy_out(&self, _: &ContainerHandle, _: &str, _: &Path) -> Result<Vec<PathBuf>> {
            unreachable!()
        }
        async fn destroy(&self, handle: &ResourceHandle, _: Duration) -> Result<()> {
            self.destroys.lock().unwrap().push(handle.id.clone());
            if self.failures_left.load(Ordering::SeqCst) > 0 {
                self.failures_left.fetch_sub(1, Ordering::SeqCst);
                return Err(Error::backend(Operation::Destroy, "daemon busy"));
            }
            Ok(())
        }
    }

    fn config() -> TeardownConfig {
        TeardownConfig {
            attempts: 3,
            attempt_timeout: Duration::from_secs(1),
            retry_delay: Duration::ZERO,
        }
    }

    fn handle(kind: ResourceKind, id: &str) -> ResourceHandle {
        ResourceHandle::new(kind, id, Some(JobId::from("linux-amd64")))
    }

    #[test]
    fn test_deadline_after_saturates() {
        let now = Instant::now();
        assert_eq!(deadline_after(now, Duration::from_secs(5)), now + Duration::from_secs(5));
        assert!(deadline_after(now, Duration::MAX) > now + Duration::from_secs(86400));
    }

    #[tokio::test]
    async fn test_close_tears_down_in_reverse_order() {
        let backend = Arc::new(CountingBackend::default());
        let lifecycle = ResourceLifecycle::new(backend.clone(), config());

        let mut scope = lifecycle.scope(Some(JobId::from("linux-amd64")));
        scope.acquire(handle(ResourceKind::Image, "img"));
        scope.acquire(handle(ResourceKind::Container, "ctr"));
        scope.close(false).await;

        assert_eq!(*backend.destroys.lock().unwrap(), vec!["ctr", "img"]);
        assert_eq!(lifecycle.live_count(), 0);
        assert!(lifecycle.take_warnings().is_empty());
    }

    #[tokio::test]
    async fn test_retries_then_records_leak() {
        let backend = Arc::new(CountingBackend::default());
        backend.failures_left.store(5, Ordering::SeqCst);
        let lifecycle = ResourceLifecycle::new(backend.clone(), config());

        let mut scope = lifecycle.scope(None);
        scope.acquire(handle(ResourceKind::Image, "img"));
        scope.close(false).await;

        assert_eq!(backend.destroys.lock().unwrap().len(), 3);
        let warnings = lifecycle.take_warnings();
        assert_eq!(warnings.len(), 1);
        assert_eq!(warnings[0].kind, WarningKind::ResourceLeak);
        assert_eq!(lifecycle.live_count(), 0);
    }

    #[tokio::test]
    async fn test_keep_records_resource_kept() {
        let backend = Arc::new(CountingBackend::default());
        let lifecycle = ResourceLifecycle::new(backend.clone(), config());

        let mut scope = lifecycle.scope(None);
        scope.acquire(handle(ResourceKind::Container, "ctr"));
        scope.close(true).await;

        assert!(backend.destroys.lock().unwrap().is_empty());
        let warnings = lifecycle.take_warnings();
        assert_eq!(warnings[0].kind, WarningKind::ResourceKept);
    }

    #[tokio::test]
    async fn test_claimed_handle_torn_down_once() {
        let backend = Arc::new(CountingBackend::default());
        let lifecycle = ResourceLifecycle::new(backend.clone(), config());

        let mut scope = lifecycle.scope(None);
        scope.acquire(handle(ResourceKind::Image, "img"));
        lifecycle.force_teardown_all(Duration::from_secs(1)).await;
        scope.close(false).await;

        assert_eq!(*backend.destroys.lock().unwrap(), vec!["img"]);
    }

    #[tokio::test]
    async fn test_dropped_scope_schedules_teardown() {
        let backend = Arc::new(CountingBackend::default());
        let lifecycle = ResourceLifecycle::new(backend.clone(), config());

        {
            let mut scope = lifecycle.scope(None);
            scope.acquire(handle(ResourceKind::Image, "img"));
        }
        for _ in 0..50 {
            if lifecycle.live_count() == 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        assert_eq!(lifecycle.live_count(), 0);
        assert_eq!(*backend.destroys.lock().unwrap(), vec!["img"]);
    }
}
