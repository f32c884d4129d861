//! Environment model: specs, identifiers, states and exec payloads.

use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{Result, SandboxError};

/// Default working directory inside an environment.
pub const DEFAULT_WORK_DIR: &str = "/workspace";

/// Opaque identifier assigned by the backend.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EnvironmentId(String);

impl EnvironmentId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// First 12 characters, the way container ids are usually displayed.
    pub fn short(&self) -> &str {
        let end = self
            .0
            .char_indices()
            .nth(12)
            .map(|(i, _)| i)
            .unwrap_or(self.0.len());
        &self.0[..end]
    }
}

impl fmt::Display for EnvironmentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// What an environment is used for.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EnvironmentRole {
    Coder,
    Tester,
    Custom(String),
}

impl fmt::Display for EnvironmentRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EnvironmentRole::Coder => write!(f, "coder"),
            EnvironmentRole::Tester => write!(f, "tester"),
            EnvironmentRole::Custom(name) => write!(f, "{}", name),
        }
    }
}

/// Operations an environment is expected to support.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Capability {
    Shell,
    FileRead,
    FileWrite,
    Network,
    Custom(String),
}

impl fmt::Display for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Capability::Shell => write!(f, "shell"),
            Capability::FileRead => write!(f, "file_read"),
            Capability::FileWrite => write!(f, "file_write"),
            Capability::Network => write!(f, "network"),
            Capability::Custom(name) => write!(f, "{}", name),
        }
    }
}

/// CPU and memory caps applied at creation time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceLimits {
    pub memory_mb: u64,
    pub cpus: f64,
}

impl Default for ResourceLimits {
    fn default() -> Self {
        Self {
            memory_mb: 2048,
            cpus: 2.0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortMapping {
    pub host: u16,
    pub container: u16,
}

/// Everything a backend needs to provision one environment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnvironmentSpec {
    /// Base image or sandbox template name.
    pub image: String,
    pub role: EnvironmentRole,
    #[serde(default)]
    pub capabilities: Vec<Capability>,
    #[serde(default)]
    pub resource_limits: ResourceLimits,
    #[serde(default)]
    pub ports: Vec<PortMapping>,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
    /// Network to attach to, when environments of one project must talk.
    #[serde(default)]
    pub network: Option<String>,
    #[serde(default)]
    pub work_dir: Option<String>,
}

impl EnvironmentSpec {
    pub fn new(image: impl Into<String>, role: EnvironmentRole) -> Self {
        Self {
            image: image.into(),
            role,
            capabilities: vec![Capability::Shell, Capability::FileRead, Capability::FileWrite],
            resource_limits: ResourceLimits::default(),
            ports: Vec::new(),
            env: BTreeMap::new(),
            labels: BTreeMap::new(),
            network: None,
            work_dir: None,
        }
    }

    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    pub fn with_label(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.labels.insert(key.into(), value.into());
        self
    }

    pub fn with_port(mut self, host: u16, container: u16) -> Self {
        self.ports.push(PortMapping { host, container });
        self
    }

    pub fn with_limits(mut self, limits: ResourceLimits) -> Self {
        self.resource_limits = limits;
        self
    }

    pub fn with_network(mut self, network: impl Into<String>) -> Self {
        self.network = Some(network.into());
        self
    }

    pub fn with_work_dir(mut self, dir: impl Into<String>) -> Self {
        self.work_dir = Some(dir.into());
        self
    }

    pub fn with_capability(mut self, capability: Capability) -> Self {
        if !self.capabilities.contains(&capability) {
            self.capabilities.push(capability);
        }
        self
    }

    pub fn has_capability(&self, capability: &Capability) -> bool {
        self.capabilities.contains(capability)
    }

    pub fn work_dir(&self) -> &str {
        self.work_dir.as_deref().unwrap_or(DEFAULT_WORK_DIR)
    }

    /// Reject specs that can never be provisioned.
    pub fn validate(&self) -> Result<()> {
        if self.image.trim().is_empty() {
            return Err(SandboxError::InvalidSpec("missing image".to_string()));
        }
        if self.resource_limits.memory_mb == 0 {
            return Err(SandboxError::InvalidSpec(
                "memory limit must be positive".to_string(),
            ));
        }
        if !(self.resource_limits.cpus > 0.0) {
            return Err(SandboxError::InvalidSpec(
                "cpu limit must be positive".to_string(),
            ));
        }
        let mut seen = HashSet::new();
        for port in &self.ports {
            if !seen.insert(port.host) {
                return Err(SandboxError::InvalidSpec(format!(
                    "conflicting host port {}",
                    port.host
                )));
            }
        }
        Ok(())
    }
}

/// Observed lifecycle state of an environment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EnvironmentState {
    Created,
    Running,
    Stopped,
    Removed,
    Error,
    /// The backend could not be observed.
    Unknown,
}

impl fmt::Display for EnvironmentState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            EnvironmentState::Created => "created",
            EnvironmentState::Running => "running",
            EnvironmentState::Stopped => "stopped",
            EnvironmentState::Removed => "removed",
            EnvironmentState::Error => "error",
            EnvironmentState::Unknown => "unknown",
        };
        f.write_str(s)
    }
}

/// Status snapshot returned by `get_status`.
///
/// `healthy == false` means the backend could not be queried; `state` is then
/// `Unknown` and says nothing about the environment itself.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnvironmentStatus {
    pub state: EnvironmentState,
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub exit_code: Option<i32>,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default = "default_healthy")]
    pub healthy: bool,
}

fn default_healthy() -> bool {
    true
}

impl EnvironmentStatus {
    pub fn observed(state: EnvironmentState) -> Self {
        Self {
            state,
            started_at: None,
            exit_code: None,
            error: None,
            healthy: true,
        }
    }

    pub fn unknown(reason: impl Into<String>) -> Self {
        Self {
            state: EnvironmentState::Unknown,
            started_at: None,
            exit_code: None,
            error: Some(reason.into()),
            healthy: false,
        }
    }
}

/// A command to run inside an environment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecRequest {
    pub command: Vec<String>,
    #[serde(default)]
    pub work_dir: Option<String>,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    pub timeout_ms: u64,
}

impl ExecRequest {
    pub fn new(command: Vec<String>) -> Self {
        Self {
            command,
            work_dir: None,
            env: BTreeMap::new(),
            timeout_ms: 300_000,
        }
    }

    /// Run `script` through `sh -c`.
    pub fn shell(script: impl Into<String>) -> Self {
        Self::new(vec!["sh".to_string(), "-c".to_string(), script.into()])
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout_ms = timeout.as_millis().min(u64::MAX as u128) as u64;
        self
    }

    pub fn with_work_dir(mut self, dir: impl Into<String>) -> Self {
        self.work_dir = Some(dir.into());
        self
    }

    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    /// The command as a single display string.
    pub fn display(&self) -> String {
        self.command.join(" ")
    }
}

/// Captured result of an exec.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecOutput {
    /// `None` when the process was killed before exiting.
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
    pub duration_ms: u64,
    #[serde(default)]
    pub timed_out: bool,
}

impl ExecOutput {
    pub fn completed(exit_code: i32, stdout: String, stderr: String, duration_ms: u64) -> Self {
        Self {
            exit_code: Some(exit_code),
            stdout,
            stderr,
            duration_ms,
            timed_out: false,
        }
    }

    pub fn timed_out(duration_ms: u64, stdout: String, stderr: String) -> Self {
        Self {
            exit_code: None,
            stdout,
            stderr,
            duration_ms,
            timed_out: true,
        }
    }

    pub fn success(&self) -> bool {
        !self.timed_out && self.exit_code == Some(0)
    }

    /// stdout followed by stderr.
    pub fn combined(&self) -> String {
        match (self.stdout.is_empty(), self.stderr.is_empty()) {
            (true, _) => self.stderr.clone(),
            (_, true) => self.stdout.clone(),
            _ => format!("{}\n{}", self.stdout, self.stderr),
        }
    }
}

/// One file to place inside an environment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileWrite {
    pub path: String,
    pub contents: String,
}

impl FileWrite {
    pub fn new(path: impl Into<String>, contents: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            contents: contents.into(),
        }
    }

    /// Resolve a relative path against `base`. Absolute paths are kept.
    pub fn resolved(&self, base: &str) -> FileWrite {
        if self.path.starts_with('/') {
            return self.clone();
        }
        let rel = self.path.trim_start_matches("./");
        FileWrite {
            path: format!("{}/{}", base.trim_end_matches('/'), rel),
            contents: self.contents.clone(),
        }
    }
}

/// Request to create a network shared by several environments.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkConfig {
    pub name: String,
    #[serde(default)]
    pub driver: Option<String>,
    #[serde(default)]
    pub internal: bool,
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
}

impl NetworkConfig {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            driver: None,
            internal: false,
            labels: BTreeMap::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkInfo {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub driver: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_spec_validation_rejects_missing_image() {
        let spec = EnvironmentSpec::new("  ", EnvironmentRole::Coder);
        let err = spec.validate().unwrap_err();
        assert!(err.to_string().contains("missing image"));
    }

    #[test]
    fn test_spec_validation_rejects_conflicting_ports() {
        let spec = EnvironmentSpec::new("node:20", EnvironmentRole::Tester)
            .with_port(8080, 80)
            .with_port(8080, 81);
        let err = spec.validate().unwrap_err();
        assert!(err.to_string().contains("conflicting host port 8080"));
    }

    #[test]
    fn test_spec_validation_accepts_defaults() {
        let spec = EnvironmentSpec::new("rust:1.79", EnvironmentRole::Coder).with_port(3000, 3000);
        assert!(spec.validate().is_ok());
        assert_eq!(spec.work_dir(), DEFAULT_WORK_DIR);
        assert!(spec.has_capability(&Capability::Shell));
        assert!(!spec.has_capability(&Capability::Network));
    }

    #[test]
    fn test_file_write_resolution() {
        let rel = FileWrite::new("./src/lib.rs", "fn main() {}");
        assert_eq!(rel.resolved("/workspace/").path, "/workspace/src/lib.rs");

        let abs = FileWrite::new("/etc/hosts", "");
        assert_eq!(abs.resolved("/workspace").path, "/etc/hosts");
    }

    #[test]
    fn test_exec_output_success_requires_zero_exit() {
        let ok = ExecOutput::completed(0, "ok".into(), String::new(), 5);
        assert!(ok.success());
        assert_eq!(ok.combined(), "ok");

        let timed_out = ExecOutput::timed_out(1000, String::new(), "slow".into());
        assert!(!timed_out.success());
        assert_eq!(timed_out.exit_code, None);
    }

    #[test]
    fn test_short_id() {
        let id = EnvironmentId::new("0123456789abcdef");
        assert_eq!(id.short(), "0123456789ab");
        assert_eq!(EnvironmentId::new("abc").short(), "abc");
    }

    #[test]
    fn test_state_serde_is_snake_case() {
        let json = serde_json::to_string(&EnvironmentState::Unknown).unwrap();
        assert_eq!(json, "\"unknown\"");
        let status = EnvironmentStatus::unknown("connection refused");
        assert!(!status.healthy);
        assert_eq!(status.state, EnvironmentState::Unknown);
    }
}
