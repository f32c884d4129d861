//! Lifecycle manager: the only owner of environments.
//!
//! Every environment that is successfully created is matched with exactly one
//! successful backend `remove` call. Teardown is funnelled through a
//! per-environment `OnceCell` that only remembers success: concurrent
//! releases collapse into one backend call, and a failed removal is retried
//! by the next release.

use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::FutureExt;
use tokio::sync::OnceCell;
use tracing::{debug, info, instrument, warn};

use crate::backend::SandboxBackend;
use crate::environment::{
    EnvironmentId, EnvironmentRole, EnvironmentSpec, EnvironmentState, EnvironmentStatus,
    ExecOutput, ExecRequest, FileWrite, NetworkConfig, NetworkInfo,
};
use crate::error::{Result, SandboxError};

/// Timeouts applied to backend calls that must never hang a caller.
#[derive(Debug, Clone, PartialEq)]
pub struct ManagerConfig {
    pub ping_timeout: Duration,
    pub status_timeout: Duration,
    /// Removed environments kept in the registry so repeated teardown stays a
    /// no-op. Older entries are pruned.
    pub retain_removed: usize,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            ping_timeout: Duration::from_secs(5),
            status_timeout: Duration::from_secs(10),
            retain_removed: 256,
        }
    }
}

type TeardownCell = Arc<OnceCell<()>>;

struct ManagedEnvironment {
    owner: String,
    role: EnvironmentRole,
    work_dir: String,
    state: EnvironmentState,
    started_at: Option<DateTime<Utc>>,
    teardown: TeardownCell,
}

/// Snapshot of a managed environment for callers and reports.
#[derive(Debug, Clone, PartialEq)]
pub struct EnvironmentSummary {
    pub id: EnvironmentId,
    pub owner: String,
    pub role: EnvironmentRole,
    pub state: EnvironmentState,
}

/// Result of [`LifecycleManager::with_environment`].
#[derive(Debug, Clone, PartialEq)]
pub enum ScopedOutcome<T> {
    Completed(T),
    TimedOut { limit: Duration },
}

/// Stateless front over a shared backend handle plus the environment registry.
///
/// Cheap to clone; clones share the backend connection and registry.
#[derive(Clone)]
pub struct LifecycleManager {
    backend: Arc<dyn SandboxBackend>,
    registry: Arc<Mutex<HashMap<EnvironmentId, ManagedEnvironment>>>,
    removed: Arc<Mutex<VecDeque<EnvironmentId>>>,
    config: ManagerConfig,
}

impl LifecycleManager {
    pub fn new(backend: Arc<dyn SandboxBackend>) -> Self {
        Self::with_config(backend, ManagerConfig::default())
    }

    pub fn with_config(backend: Arc<dyn SandboxBackend>, config: ManagerConfig) -> Self {
        Self {
            backend,
            registry: Arc::new(Mutex::new(HashMap::new())),
            removed: Arc::new(Mutex::new(VecDeque::new())),
            config,
        }
    }

    pub fn backend_name(&self) -> &str {
        self.backend.name()
    }

    fn registry(&self) -> std::sync::MutexGuard<'_, HashMap<EnvironmentId, ManagedEnvironment>> {
        // A poisoned registry only means a panic happened mid-update; the map
        // itself is still consistent enough to drive teardown.
        self.registry
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn set_state(&self, id: &EnvironmentId, state: EnvironmentState) {
        if let Some(entry) = self.registry().get_mut(id) {
            if entry.state != EnvironmentState::Removed {
                entry.state = state;
            }
        }
    }

    fn state_of(&self, id: &EnvironmentId) -> Option<EnvironmentState> {
        self.registry().get(id).map(|e| e.state)
    }

    /// Provision a new environment owned by `owner`.
    #[instrument(skip(self, spec), fields(image = %spec.image, role = %spec.role))]
    pub async fn create_environment(
        &self,
        spec: &EnvironmentSpec,
        owner: &str,
    ) -> Result<EnvironmentId> {
        spec.validate()
            .map_err(|e| SandboxError::Provisioning(e.to_string()))?;

        let id = match self.backend.create(spec).await {
            Ok(id) => id,
            Err(SandboxError::Provisioning(reason)) => {
                return Err(SandboxError::Provisioning(reason))
            }
            Err(e) => return Err(SandboxError::Provisioning(e.to_string())),
        };

        self.registry().insert(
            id.clone(),
            ManagedEnvironment {
                owner: owner.to_string(),
                role: spec.role.clone(),
                work_dir: spec.work_dir().to_string(),
                state: EnvironmentState::Created,
                started_at: None,
                teardown: Arc::new(OnceCell::new()),
            },
        );
        info!(env_id = %id, owner = %owner, backend = %self.backend.name(), "environment created");
        Ok(id)
    }

    /// Start an environment. Starting a running environment is a no-op.
    pub async fn start_environment(&self, id: &EnvironmentId) -> Result<()> {
        match self.state_of(id) {
            None | Some(EnvironmentState::Removed) => {
                return Err(SandboxError::NotFound(id.to_string()))
            }
            Some(EnvironmentState::Running) => return Ok(()),
            Some(_) => {}
        }

        if let Err(e) = self.backend.start(id).await {
            self.set_state(id, EnvironmentState::Error);
            return Err(e);
        }
        if let Some(entry) = self.registry().get_mut(id) {
            if entry.state != EnvironmentState::Removed {
                entry.state = EnvironmentState::Running;
                entry.started_at = Some(Utc::now());
            }
        }
        debug!(env_id = %id, "environment started");
        Ok(())
    }

    /// Stop an environment. Stopping a stopped or removed environment is a no-op.
    pub async fn stop_environment(&self, id: &EnvironmentId) -> Result<()> {
        match self.state_of(id) {
            None => return Err(SandboxError::NotFound(id.to_string())),
            Some(EnvironmentState::Stopped) | Some(EnvironmentState::Removed) => return Ok(()),
            Some(_) => {}
        }
        self.backend.stop(id).await?;
        self.set_state(id, EnvironmentState::Stopped);
        debug!(env_id = %id, "environment stopped");
        Ok(())
    }

    /// Terminal release: stop (best effort) then remove.
    ///
    /// Once a removal succeeds, repeated and concurrent calls are no-ops. A
    /// failed removal leaves the environment in `Error` and the next call
    /// tries the backend again.
    pub async fn remove_environment(&self, id: &EnvironmentId) -> Result<()> {
        let cell = match self.registry().get(id) {
            Some(entry) => entry.teardown.clone(),
            None => return Err(SandboxError::NotFound(id.to_string())),
        };

        let backend = self.backend.clone();
        let should_stop = matches!(
            self.state_of(id),
            Some(EnvironmentState::Running) | Some(EnvironmentState::Created)
        );
        let outcome = cell
            .get_or_try_init(|| async {
                if should_stop {
                    if let Err(e) = backend.stop(id).await {
                        debug!(env_id = %id, error = %e, "stop before remove failed");
                    }
                }
                backend.remove(id).await
            })
            .await;

        match outcome {
            Ok(_) => {
                let newly_removed = match self.registry().get_mut(id) {
                    Some(entry) if entry.state != EnvironmentState::Removed => {
                        entry.state = EnvironmentState::Removed;
                        info!(env_id = %id, owner = %entry.owner, "environment removed");
                        true
                    }
                    _ => false,
                };
                if newly_removed {
                    self.prune_removed(id);
                }
                Ok(())
            }
            Err(e) => {
                self.set_state(id, EnvironmentState::Error);
                warn!(env_id = %id, error = %e, "environment removal failed; will retry on next release");
                Err(SandboxError::Teardown {
                    id: id.to_string(),
                    reason: e.to_string(),
                })
            }
        }
    }

    /// Remember `id` as removed and drop the oldest removed entries beyond
    /// `retain_removed`.
    fn prune_removed(&self, id: &EnvironmentId) {
        let evicted: Vec<EnvironmentId> = {
            let mut removed = self
                .removed
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            removed.push_back(id.clone());
            let excess = removed.len().saturating_sub(self.config.retain_removed);
            removed.drain(..excess).collect()
        };
        if evicted.is_empty() {
            return;
        }
        let mut registry = self.registry();
        for id in &evicted {
            registry.remove(id);
        }
        debug!(pruned = evicted.len(), tracked = registry.len(), "pruned removed environments");
    }

    /// Current status. Never fails: an unobservable backend yields
    /// `state = Unknown` with `healthy = false`.
    pub async fn get_status(&self, id: &EnvironmentId) -> EnvironmentStatus {
        let (known_state, started_at) = match self.registry().get(id) {
            Some(entry) => (Some(entry.state), entry.started_at),
            None => (None, None),
        };
        if known_state == Some(EnvironmentState::Removed) {
            let mut status = EnvironmentStatus::observed(EnvironmentState::Removed);
            status.started_at = started_at;
            return status;
        }

        match tokio::time::timeout(self.config.status_timeout, self.backend.inspect(id)).await {
            Ok(Ok(mut status)) => {
                if status.started_at.is_none() {
                    status.started_at = started_at;
                }
                status.healthy = true;
                self.set_state(id, status.state);
                status
            }
            Ok(Err(SandboxError::NotFound(_))) => {
                let mut status = EnvironmentStatus::observed(EnvironmentState::Removed);
                status.started_at = started_at;
                status
            }
            Ok(Err(e)) => {
                warn!(env_id = %id, error = %e, "environment status unavailable");
                EnvironmentStatus::unknown(e.to_string())
            }
            Err(_) => {
                warn!(env_id = %id, "environment status timed out");
                EnvironmentStatus::unknown(format!(
                    "status query exceeded {}ms",
                    self.config.status_timeout.as_millis()
                ))
            }
        }
    }

    /// Liveness of the backend service. Always answers.
    pub async fn ping(&self) -> bool {
        match tokio::time::timeout(self.config.ping_timeout, self.backend.ping()).await {
            Ok(Ok(())) => true,
            Ok(Err(e)) => {
                debug!(backend = %self.backend.name(), error = %e, "backend ping failed");
                false
            }
            Err(_) => {
                debug!(backend = %self.backend.name(), "backend ping timed out");
                false
            }
        }
    }

    pub async fn create_network(&self, config: &NetworkConfig) -> Result<String> {
        let id = self.backend.create_network(config).await?;
        info!(network = %config.name, network_id = %id, "network created");
        Ok(id)
    }

    pub async fn list_networks(&self) -> Result<Vec<NetworkInfo>> {
        self.backend.list_networks().await
    }

    pub async fn exec(&self, id: &EnvironmentId, request: &ExecRequest) -> Result<ExecOutput> {
        self.ensure_live(id)?;
        debug!(env_id = %id, command = %request.display(), "exec");
        self.backend.exec(id, request).await
    }

    pub async fn write_files(&self, id: &EnvironmentId, files: &[FileWrite]) -> Result<()> {
        self.ensure_live(id)?;
        self.backend.write_files(id, files).await
    }

    fn ensure_live(&self, id: &EnvironmentId) -> Result<()> {
        match self.state_of(id) {
            None | Some(EnvironmentState::Removed) => Err(SandboxError::NotFound(id.to_string())),
            Some(_) => Ok(()),
        }
    }

    /// Create and start an environment, returning a lease that guarantees release.
    ///
    /// If start fails the environment is removed before the error is returned.
    pub async fn acquire(&self, spec: &EnvironmentSpec, owner: &str) -> Result<EnvironmentLease> {
        let id = self.create_environment(spec, owner).await?;
        if let Err(e) = self.start_environment(&id).await {
            if let Err(cleanup) = self.remove_environment(&id).await {
                warn!(env_id = %id, error = %cleanup, "cleanup after failed start");
            }
            return Err(SandboxError::Provisioning(e.to_string()));
        }
        Ok(EnvironmentLease {
            manager: self.clone(),
            work_dir: spec.work_dir().to_string(),
            id,
            released: false,
        })
    }

    /// Scoped acquisition: run `work` inside a fresh environment and release it
    /// afterwards whether `work` finished, hit `time_limit`, or panicked.
    ///
    /// A panic inside `work` is resumed after the environment is released.
    pub async fn with_environment<T, F, Fut>(
        &self,
        spec: &EnvironmentSpec,
        owner: &str,
        time_limit: Duration,
        work: F,
    ) -> Result<ScopedOutcome<T>>
    where
        F: FnOnce(EnvironmentHandle) -> Fut,
        Fut: Future<Output = T>,
    {
        let lease = self.acquire(spec, owner).await?;
        let handle = lease.handle();

        let outcome = AssertUnwindSafe(tokio::time::timeout(time_limit, work(handle)))
            .catch_unwind()
            .await;

        let env_id = lease.id().clone();
        if let Err(e) = lease.release().await {
            warn!(env_id = %env_id, error = %e, "environment release failed");
        }

        match outcome {
            Ok(Ok(value)) => Ok(ScopedOutcome::Completed(value)),
            Ok(Err(_elapsed)) => {
                warn!(env_id = %env_id, limit_ms = time_limit.as_millis() as u64, "scoped work timed out");
                Ok(ScopedOutcome::TimedOut { limit: time_limit })
            }
            Err(panic) => std::panic::resume_unwind(panic),
        }
    }

    /// Release every live environment owned by `owner`. Returns how many were
    /// torn down by this call or concurrently with it.
    pub async fn release_owner(&self, owner: &str) -> usize {
        let ids: Vec<EnvironmentId> = self
            .registry()
            .iter()
            .filter(|(_, e)| e.owner == owner && e.state != EnvironmentState::Removed)
            .map(|(id, _)| id.clone())
            .collect();

        let mut released = 0;
        for id in ids {
            match self.remove_environment(&id).await {
                Ok(()) => released += 1,
                Err(e) => warn!(env_id = %id, owner = %owner, error = %e, "forced release failed"),
            }
        }
        if released > 0 {
            info!(owner = %owner, released = released, "released owner environments");
        }
        released
    }

    /// Environments the registry still tracks, removed ones included.
    pub fn tracked_count(&self) -> usize {
        self.registry().len()
    }

    /// Environments that have not been removed yet.
    pub fn active_count(&self) -> usize {
        self.registry()
            .values()
            .filter(|e| e.state != EnvironmentState::Removed)
            .count()
    }

    pub fn environments_for(&self, owner: &str) -> Vec<EnvironmentSummary> {
        let mut out: Vec<EnvironmentSummary> = self
            .registry()
            .iter()
            .filter(|(_, e)| e.owner == owner)
            .map(|(id, e)| EnvironmentSummary {
                id: id.clone(),
                owner: e.owner.clone(),
                role: e.role.clone(),
                state: e.state,
            })
            .collect();
        out.sort_by(|a, b| a.id.cmp(&b.id));
        out
    }

    fn work_dir_of(&self, id: &EnvironmentId) -> Option<String> {
        self.registry().get(id).map(|e| e.work_dir.clone())
    }
}

/// Exclusive ownership of one running environment.
///
/// Call [`EnvironmentLease::release`] when done. Dropping an unreleased lease
/// schedules the release on the current runtime.
pub struct EnvironmentLease {
    manager: LifecycleManager,
    id: EnvironmentId,
    work_dir: String,
    released: bool,
}

impl EnvironmentLease {
    pub fn id(&self) -> &EnvironmentId {
        &self.id
    }

    pub fn handle(&self) -> EnvironmentHandle {
        EnvironmentHandle {
            manager: self.manager.clone(),
            id: self.id.clone(),
            work_dir: self.work_dir.clone(),
        }
    }

    pub async fn release(mut self) -> Result<()> {
        self.released = true;
        self.manager.remove_environment(&self.id).await
    }
}

impl Drop for EnvironmentLease {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        let manager = self.manager.clone();
        let id = self.id.clone();
        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                runtime.spawn(async move {
                    if let Err(e) = manager.remove_environment(&id).await {
                        warn!(env_id = %id, error = %e, "deferred release failed");
                    }
                });
            }
            Err(_) => {
                warn!(env_id = %self.id, "lease dropped outside a runtime; environment not released");
            }
        }
    }
}

/// Borrowed access to a leased environment for exec and file writes.
#[derive(Clone)]
pub struct EnvironmentHandle {
    manager: LifecycleManager,
    id: EnvironmentId,
    work_dir: String,
}

impl EnvironmentHandle {
    pub fn id(&self) -> &EnvironmentId {
        &self.id
    }

    pub fn work_dir(&self) -> &str {
        &self.work_dir
    }

    /// Run a command; relative to the environment work dir unless the request
    /// names its own.
    pub async fn exec(&self, request: &ExecRequest) -> Result<ExecOutput> {
        if request.work_dir.is_some() {
            return self.manager.exec(&self.id, request).await;
        }
        let request = request.clone().with_work_dir(self.work_dir.clone());
        self.manager.exec(&self.id, &request).await
    }

    /// Write files; relative paths resolve against the work dir.
    pub async fn write_files(&self, files: &[FileWrite]) -> Result<()> {
        let base = self
            .manager
            .work_dir_of(&self.id)
            .unwrap_or_else(|| self.work_dir.clone());
        let resolved: Vec<FileWrite> = files.iter().map(|f| f.resolved(&base)).collect();
        self.manager.write_files(&self.id, &resolved).await
    }

    pub async fn status(&self) -> EnvironmentStatus {
        self.manager.get_status(&self.id).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fakes::MemoryBackend;

    fn spec() -> EnvironmentSpec {
        EnvironmentSpec::new("node:20", EnvironmentRole::Coder)
    }

    #[tokio::test]
    async fn test_invalid_spec_is_provisioning_error() {
        let backend = Arc::new(MemoryBackend::new());
        let manager = LifecycleManager::new(backend.clone());
        let bad = EnvironmentSpec::new("", EnvironmentRole::Coder);
        let err = manager.create_environment(&bad, "p1").await.unwrap_err();
        assert!(matches!(err, SandboxError::Provisioning(_)));
        assert_eq!(backend.created_count(), 0);
    }

    #[tokio::test]
    async fn test_start_is_idempotent() {
        let backend = Arc::new(MemoryBackend::new());
        let manager = LifecycleManager::new(backend.clone());
        let id = manager.create_environment(&spec(), "p1").await.unwrap();
        manager.start_environment(&id).await.unwrap();
        manager.start_environment(&id).await.unwrap();
        assert_eq!(backend.start_calls(&id), 1);
    }

    #[tokio::test]
    async fn test_start_failure_removes_environment() {
        let backend = Arc::new(MemoryBackend::new());
        backend.set_fail_start(true);
        let manager = LifecycleManager::new(backend.clone());
        let err = manager.acquire(&spec(), "p1").await.err().unwrap();
        assert!(matches!(err, SandboxError::Provisioning(_)));
        assert_eq!(backend.created_count(), 1);
        assert_eq!(backend.removed_count(), 1);
        assert_eq!(manager.active_count(), 0);
    }

    #[tokio::test]
    async fn test_dropped_lease_releases_in_background() {
        let backend = Arc::new(MemoryBackend::new());
        let manager = LifecycleManager::new(backend.clone());
        let lease = manager.acquire(&spec(), "p1").await.unwrap();
        let id = lease.id().clone();
        drop(lease);
        for _ in 0..50 {
            if backend.remove_calls(&id) == 1 {
                break;
            }
            tokio::task::yield_now().await;
        }
        assert_eq!(backend.remove_calls(&id), 1);
    }

    #[tokio::test]
    async fn test_handle_resolves_relative_paths() {
        let backend = Arc::new(MemoryBackend::new());
        let manager = LifecycleManager::new(backend.clone());
        let lease = manager
            .acquire(&spec().with_work_dir("/app"), "p1")
            .await
            .unwrap();
        lease
            .handle()
            .write_files(&[FileWrite::new("src/index.ts", "export {}")])
            .await
            .unwrap();
        let files = backend.files(lease.id()).unwrap();
        assert!(files.contains_key("/app/src/index.ts"));
        lease.release().await.unwrap();
    }

    #[tokio::test]
    async fn test_exec_after_release_is_not_found() {
        let backend = Arc::new(MemoryBackend::new());
        let manager = LifecycleManager::new(backend);
        let lease = manager.acquire(&spec(), "p1").await.unwrap();
        let handle = lease.handle();
        lease.release().await.unwrap();
        let err = handle.exec(&ExecRequest::shell("true")).await.unwrap_err();
        assert!(matches!(err, SandboxError::NotFound(_)));
    }
}
