//! In-memory sandbox backend (testing only)
//!
//! `MemoryBackend` satisfies the [`SandboxBackend`] contract without a
//! container daemon and records enough bookkeeping (creations, removals,
//! peak concurrency, per-environment remove calls) to assert lifecycle
//! invariants. Exec behaviour is scripted through [`MemoryBackend::set_exec_handler`].

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::Utc;

use crate::backend::SandboxBackend;
use crate::environment::{
    EnvironmentId, EnvironmentSpec, EnvironmentState, EnvironmentStatus, ExecOutput, ExecRequest,
    FileWrite, NetworkConfig, NetworkInfo,
};
use crate::error::{Result, SandboxError};

/// What the exec handler sees for one command.
pub struct ExecContext<'a> {
    pub id: &'a EnvironmentId,
    pub spec: &'a EnvironmentSpec,
    pub request: &'a ExecRequest,
    /// Files written so far, keyed by absolute path.
    pub files: &'a BTreeMap<String, String>,
}

impl ExecContext<'_> {
    /// The command as one string, handy for matching.
    pub fn command_line(&self) -> String {
        self.request.command.join(" ")
    }
}

/// Scripted reply for an exec.
#[derive(Debug, Clone)]
pub struct ExecScript {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
    /// Simulated run time. Longer than the request timeout means a timeout.
    pub delay: Duration,
}

impl ExecScript {
    pub fn ok(stdout: impl Into<String>) -> Self {
        Self {
            exit_code: 0,
            stdout: stdout.into(),
            stderr: String::new(),
            delay: Duration::ZERO,
        }
    }

    pub fn fail(exit_code: i32, stderr: impl Into<String>) -> Self {
        Self {
            exit_code,
            stdout: String::new(),
            stderr: stderr.into(),
            delay: Duration::ZERO,
        }
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }
}

pub type ExecHandler = Arc<dyn Fn(&ExecContext<'_>) -> ExecScript + Send + Sync>;

#[derive(Debug)]
struct FakeEnvironment {
    spec: EnvironmentSpec,
    state: EnvironmentState,
    started_at: Option<chrono::DateTime<Utc>>,
    files: BTreeMap<String, String>,
    start_calls: usize,
    remove_calls: usize,
}

/// In-memory backend backed by a `HashMap<EnvironmentId, FakeEnvironment>`.
pub struct MemoryBackend {
    envs: Mutex<HashMap<EnvironmentId, FakeEnvironment>>,
    networks: Mutex<Vec<NetworkInfo>>,
    handler: Mutex<ExecHandler>,
    next_id: AtomicU64,
    created: AtomicUsize,
    removed: AtomicUsize,
    active: AtomicUsize,
    peak_active: AtomicUsize,
    healthy: AtomicBool,
    fail_create: AtomicBool,
    fail_start: AtomicBool,
    failing_removes: AtomicUsize,
}

impl Default for MemoryBackend {
    fn default() -> Self {
        let handler: ExecHandler = Arc::new(|_: &ExecContext<'_>| ExecScript::ok(""));
        Self {
            envs: Mutex::new(HashMap::new()),
            networks: Mutex::new(Vec::new()),
            handler: Mutex::new(handler),
            next_id: AtomicU64::new(1),
            created: AtomicUsize::new(0),
            removed: AtomicUsize::new(0),
            active: AtomicUsize::new(0),
            peak_active: AtomicUsize::new(0),
            healthy: AtomicBool::new(true),
            fail_create: AtomicBool::new(false),
            fail_start: AtomicBool::new(false),
            failing_removes: AtomicUsize::new(0),
        }
    }
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the exec handler. Every command returns success by default.
    pub fn set_exec_handler<F>(&self, handler: F)
    where
        F: Fn(&ExecContext<'_>) -> ExecScript + Send + Sync + 'static,
    {
        let handler: ExecHandler = Arc::new(handler);
        *self.handler.lock().unwrap() = handler;
    }

    /// When unhealthy, `ping`, `inspect` and `create` report the backend as unreachable.
    pub fn set_healthy(&self, healthy: bool) {
        self.healthy.store(healthy, Ordering::SeqCst);
    }

    pub fn set_fail_create(&self, fail: bool) {
        self.fail_create.store(fail, Ordering::SeqCst);
    }

    pub fn set_fail_start(&self, fail: bool) {
        self.fail_start.store(fail, Ordering::SeqCst);
    }

    /// The next `times` remove calls fail as if the backend were unreachable.
    pub fn fail_next_removes(&self, times: usize) {
        self.failing_removes.store(times, Ordering::SeqCst);
    }

    pub fn created_count(&self) -> usize {
        self.created.load(Ordering::SeqCst)
    }

    /// Environments removed at least once.
    pub fn removed_count(&self) -> usize {
        self.removed.load(Ordering::SeqCst)
    }

    /// Environments created and not yet removed.
    pub fn active_count(&self) -> usize {
        self.active.load(Ordering::SeqCst)
    }

    /// Highest number of simultaneously active environments observed.
    pub fn peak_active(&self) -> usize {
        self.peak_active.load(Ordering::SeqCst)
    }

    pub fn remove_calls(&self, id: &EnvironmentId) -> usize {
        self.envs
            .lock()
            .unwrap()
            .get(id)
            .map(|e| e.remove_calls)
            .unwrap_or(0)
    }

    pub fn start_calls(&self, id: &EnvironmentId) -> usize {
        self.envs
            .lock()
            .unwrap()
            .get(id)
            .map(|e| e.start_calls)
            .unwrap_or(0)
    }

    pub fn state(&self, id: &EnvironmentId) -> Option<EnvironmentState> {
        self.envs.lock().unwrap().get(id).map(|e| e.state)
    }

    pub fn files(&self, id: &EnvironmentId) -> Option<BTreeMap<String, String>> {
        self.envs.lock().unwrap().get(id).map(|e| e.files.clone())
    }

    /// Every environment ever created, in creation order.
    pub fn environment_ids(&self) -> Vec<EnvironmentId> {
        let mut ids: Vec<EnvironmentId> = self.envs.lock().unwrap().keys().cloned().collect();
        ids.sort_by_key(|id| {
            id.as_str()
                .trim_start_matches("mem-")
                .parse::<u64>()
                .unwrap_or(u64::MAX)
        });
        ids
    }

    /// Every environment that has seen exactly one remove call.
    pub fn all_removed_exactly_once(&self) -> bool {
        self.envs
            .lock()
            .unwrap()
            .values()
            .all(|e| e.remove_calls == 1)
    }

    fn ensure_healthy(&self) -> Result<()> {
        if self.healthy.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(SandboxError::Unavailable("memory backend marked unhealthy".to_string()))
        }
    }
}

#[async_trait]
impl SandboxBackend for MemoryBackend {
    fn name(&self) -> &str {
        "memory"
    }

    async fn create(&self, spec: &EnvironmentSpec) -> Result<EnvironmentId> {
        self.ensure_healthy()?;
        if self.fail_create.load(Ordering::SeqCst) {
            return Err(SandboxError::Provisioning("injected create failure".to_string()));
        }
        let id = EnvironmentId::new(format!(
            "mem-{}",
            self.next_id.fetch_add(1, Ordering::SeqCst)
        ));
        self.envs.lock().unwrap().insert(
            id.clone(),
            FakeEnvironment {
                spec: spec.clone(),
                state: EnvironmentState::Created,
                started_at: None,
                files: BTreeMap::new(),
                start_calls: 0,
                remove_calls: 0,
            },
        );
        self.created.fetch_add(1, Ordering::SeqCst);
        let active = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak_active.fetch_max(active, Ordering::SeqCst);
        Ok(id)
    }

    async fn start(&self, id: &EnvironmentId) -> Result<()> {
        let mut envs = self.envs.lock().unwrap();
        let env = envs
            .get_mut(id)
            .ok_or_else(|| SandboxError::NotFound(id.to_string()))?;
        env.start_calls += 1;
        if self.fail_start.load(Ordering::SeqCst) {
            env.state = EnvironmentState::Error;
            return Err(SandboxError::backend("start", "injected start failure"));
        }
        env.state = EnvironmentState::Running;
        env.started_at = Some(Utc::now());
        Ok(())
    }

    async fn stop(&self, id: &EnvironmentId) -> Result<()> {
        if let Some(env) = self.envs.lock().unwrap().get_mut(id) {
            if env.state != EnvironmentState::Removed {
                env.state = EnvironmentState::Stopped;
            }
        }
        Ok(())
    }

    async fn remove(&self, id: &EnvironmentId) -> Result<()> {
        let inject_failure = self
            .failing_removes
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if let Some(env) = self.envs.lock().unwrap().get_mut(id) {
            env.remove_calls += 1;
            if inject_failure {
                return Err(SandboxError::Unavailable("injected remove failure".to_string()));
            }
            if env.state != EnvironmentState::Removed {
                env.state = EnvironmentState::Removed;
                self.removed.fetch_add(1, Ordering::SeqCst);
                self.active.fetch_sub(1, Ordering::SeqCst);
            }
        }
        Ok(())
    }

    async fn inspect(&self, id: &EnvironmentId) -> Result<EnvironmentStatus> {
        self.ensure_healthy()?;
        let envs = self.envs.lock().unwrap();
        let env = envs
            .get(id)
            .ok_or_else(|| SandboxError::NotFound(id.to_string()))?;
        Ok(EnvironmentStatus {
            state: env.state,
            started_at: env.started_at,
            exit_code: None,
            error: None,
            healthy: true,
        })
    }

    async fn exec(&self, id: &EnvironmentId, request: &ExecRequest) -> Result<ExecOutput> {
        let handler = self.handler.lock().unwrap().clone();
        let script = {
            let envs = self.envs.lock().unwrap();
            let env = envs
                .get(id)
                .ok_or_else(|| SandboxError::NotFound(id.to_string()))?;
            if env.state != EnvironmentState::Running {
                return Err(SandboxError::backend(
                    "exec",
                    format!("environment {} is {}", id, env.state),
                ));
            }
            let context = ExecContext {
                id,
                spec: &env.spec,
                request,
                files: &env.files,
            };
            (*handler)(&context)
        };

        let start = Instant::now();
        let limit = request.timeout();
        if script.delay > limit {
            tokio::time::sleep(limit).await;
            return Ok(ExecOutput::timed_out(
                start.elapsed().as_millis() as u64,
                script.stdout,
                format!("command timed out after {}ms", request.timeout_ms),
            ));
        }
        if !script.delay.is_zero() {
            tokio::time::sleep(script.delay).await;
        }
        Ok(ExecOutput::completed(
            script.exit_code,
            script.stdout,
            script.stderr,
            start.elapsed().as_millis() as u64,
        ))
    }

    async fn write_files(&self, id: &EnvironmentId, files: &[FileWrite]) -> Result<()> {
        let mut envs = self.envs.lock().unwrap();
        let env = envs
            .get_mut(id)
            .ok_or_else(|| SandboxError::NotFound(id.to_string()))?;
        for file in files {
            env.files.insert(file.path.clone(), file.contents.clone());
        }
        Ok(())
    }

    async fn ping(&self) -> Result<()> {
        self.ensure_healthy()
    }

    async fn create_network(&self, config: &NetworkConfig) -> Result<String> {
        let mut networks = self.networks.lock().unwrap();
        if networks.iter().any(|n| n.name == config.name) {
            return Err(SandboxError::backend(
                "create_network",
                format!("network {} already exists", config.name),
            ));
        }
        let id = format!("net-{}", networks.len() + 1);
        networks.push(NetworkInfo {
            id: id.clone(),
            name: config.name.clone(),
            driver: config.driver.clone(),
        });
        Ok(id)
    }

    async fn list_networks(&self) -> Result<Vec<NetworkInfo>> {
        Ok(self.networks.lock().unwrap().clone())
    }
}
