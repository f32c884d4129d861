//! Local container daemon backend driven through the `docker` CLI.

use std::process::Stdio;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::debug;

use crate::backend::SandboxBackend;
use crate::environment::{
    EnvironmentId, EnvironmentSpec, EnvironmentState, EnvironmentStatus, ExecOutput, ExecRequest,
    FileWrite, NetworkConfig, NetworkInfo,
};
use crate::error::{Result, SandboxError};

/// Label attached to every container this backend creates.
pub const MANAGED_LABEL: &str = "autocoder.managed";

const NO_SUCH_CONTAINER: &str = "No such container";

/// Docker CLI configuration
#[derive(Debug, Clone)]
pub struct DockerConfig {
    /// Path or name of the docker binary
    pub binary: String,
    /// Timeout for lifecycle commands (create/start/stop/rm/inspect)
    pub command_timeout: Duration,
    /// Grace period passed to `docker stop -t`
    pub stop_grace_secs: u32,
}

impl Default for DockerConfig {
    fn default() -> Self {
        DockerConfig {
            binary: std::env::var("AUTOCODER_DOCKER_BIN").unwrap_or_else(|_| "docker".to_string()),
            command_timeout: Duration::from_secs(60),
            stop_grace_secs: 5,
        }
    }
}

/// Backend for a local container daemon.
pub struct DockerCliBackend {
    config: DockerConfig,
}

impl DockerCliBackend {
    pub fn new(config: DockerConfig) -> Self {
        DockerCliBackend { config }
    }

    pub fn with_binary(binary: impl Into<String>) -> Self {
        Self::new(DockerConfig {
            binary: binary.into(),
            ..DockerConfig::default()
        })
    }

    async fn run(&self, operation: &str, args: &[String]) -> Result<std::process::Output> {
        debug!(operation = operation, args = ?args, "docker");
        let child = Command::new(&self.config.binary)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| self.spawn_error(e))?;

        tokio::time::timeout(self.config.command_timeout, child.wait_with_output())
            .await
            .map_err(|_| {
                SandboxError::backend(
                    operation,
                    format!(
                        "timed out after {}s",
                        self.config.command_timeout.as_secs()
                    ),
                )
            })?
            .map_err(SandboxError::from)
    }

    /// Run and require a zero exit status, returning trimmed stdout.
    async fn run_checked(&self, operation: &str, args: &[String]) -> Result<String> {
        let output = self.run(operation, args).await?;
        if output.status.success() {
            return Ok(String::from_utf8_lossy(&output.stdout).trim().to_string());
        }
        Err(classify_failure(
            operation,
            &String::from_utf8_lossy(&output.stderr),
        ))
    }

    fn spawn_error(&self, err: std::io::Error) -> SandboxError {
        if err.kind() == std::io::ErrorKind::NotFound {
            SandboxError::Unavailable(format!("{} binary not found", self.config.binary))
        } else {
            SandboxError::Io(err)
        }
    }
}

impl Default for DockerCliBackend {
    fn default() -> Self {
        Self::new(DockerConfig::default())
    }
}

fn classify_failure(operation: &str, stderr: &str) -> SandboxError {
    let stderr = stderr.trim();
    if stderr.contains(NO_SUCH_CONTAINER) {
        SandboxError::NotFound(stderr.to_string())
    } else if stderr.contains("Cannot connect to the Docker daemon") {
        SandboxError::Unavailable(stderr.to_string())
    } else {
        SandboxError::backend(operation, stderr)
    }
}

/// Arguments for `docker create`; the container idles so commands can be exec'd.
pub fn create_args(spec: &EnvironmentSpec, name: &str) -> Vec<String> {
    let mut args = vec![
        "create".to_string(),
        "--name".to_string(),
        name.to_string(),
        "--label".to_string(),
        format!("{}=true", MANAGED_LABEL),
        "--label".to_string(),
        format!("autocoder.role={}", spec.role),
    ];
    for (key, value) in &spec.labels {
        args.push("--label".to_string());
        args.push(format!("{}={}", key, value));
    }
    args.push("--memory".to_string());
    args.push(format!("{}m", spec.resource_limits.memory_mb));
    args.push("--cpus".to_string());
    args.push(format!("{}", spec.resource_limits.cpus));
    for port in &spec.ports {
        args.push("-p".to_string());
        args.push(format!("{}:{}", port.host, port.container));
    }
    for (key, value) in &spec.env {
        args.push("-e".to_string());
        args.push(format!("{}={}", key, value));
    }
    if let Some(network) = &spec.network {
        args.push("--network".to_string());
        args.push(network.clone());
    }
    args.push("-w".to_string());
    args.push(spec.work_dir().to_string());
    args.push(spec.image.clone());
    args.push("sleep".to_string());
    args.push("infinity".to_string());
    args
}

/// Arguments for `docker exec`.
pub fn exec_args(id: &EnvironmentId, request: &ExecRequest) -> Vec<String> {
    let mut args = vec!["exec".to_string()];
    if let Some(dir) = &request.work_dir {
        args.push("-w".to_string());
        args.push(dir.clone());
    }
    for (key, value) in &request.env {
        args.push("-e".to_string());
        args.push(format!("{}={}", key, value));
    }
    args.push(id.to_string());
    args.extend(request.command.iter().cloned());
    args
}

/// Arguments for streaming one file through stdin into the container.
pub fn write_file_args(id: &EnvironmentId, path: &str) -> Vec<String> {
    vec![
        "exec".to_string(),
        "-i".to_string(),
        id.to_string(),
        "sh".to_string(),
        "-c".to_string(),
        "mkdir -p \"$(dirname \"$1\")\" && cat > \"$1\"".to_string(),
        "sh".to_string(),
        path.to_string(),
    ]
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct DockerState {
    status: String,
    #[serde(default)]
    exit_code: Option<i32>,
    #[serde(default)]
    error: Option<String>,
    #[serde(default)]
    started_at: Option<String>,
}

/// Map `docker inspect --format '{{json .State}}'` output to a status.
pub fn parse_inspect_state(raw: &str) -> Result<EnvironmentStatus> {
    let state: DockerState = serde_json::from_str(raw.trim())?;
    let mapped = match state.status.as_str() {
        "created" => EnvironmentState::Created,
        "running" | "restarting" | "paused" => EnvironmentState::Running,
        "exited" => EnvironmentState::Stopped,
        "removing" => EnvironmentState::Removed,
        "dead" => EnvironmentState::Error,
        _ => EnvironmentState::Unknown,
    };
    // The daemon reports the zero time for containers that never started.
    let started_at = state
        .started_at
        .as_deref()
        .filter(|s| !s.starts_with("0001-"))
        .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
        .map(|dt| dt.with_timezone(&Utc));

    Ok(EnvironmentStatus {
        state: mapped,
        started_at,
        exit_code: state.exit_code,
        error: state.error.filter(|e| !e.is_empty()),
        healthy: true,
    })
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct DockerNetworkLine {
    #[serde(rename = "ID")]
    id: String,
    name: String,
    #[serde(default)]
    driver: Option<String>,
}

#[async_trait]
impl SandboxBackend for DockerCliBackend {
    fn name(&self) -> &str {
        "docker"
    }

    async fn create(&self, spec: &EnvironmentSpec) -> Result<EnvironmentId> {
        let name = format!("autocoder-{}", uuid::Uuid::new_v4().simple());
        let stdout = self
            .run_checked("create", &create_args(spec, &name))
            .await
            .map_err(|e| SandboxError::Provisioning(e.to_string()))?;
        if stdout.is_empty() {
            return Err(SandboxError::Provisioning(
                "docker create returned no container id".to_string(),
            ));
        }
        Ok(EnvironmentId::new(stdout))
    }

    async fn start(&self, id: &EnvironmentId) -> Result<()> {
        self.run_checked("start", &["start".to_string(), id.to_string()])
            .await
            .map(|_| ())
    }

    async fn stop(&self, id: &EnvironmentId) -> Result<()> {
        let args = vec![
            "stop".to_string(),
            "-t".to_string(),
            self.config.stop_grace_secs.to_string(),
            id.to_string(),
        ];
        match self.run_checked("stop", &args).await {
            Ok(_) | Err(SandboxError::NotFound(_)) => Ok(()),
            Err(e) => Err(e),
        }
    }

    async fn remove(&self, id: &EnvironmentId) -> Result<()> {
        let args = vec!["rm".to_string(), "-f".to_string(), id.to_string()];
        match self.run_checked("remove", &args).await {
            Ok(_) | Err(SandboxError::NotFound(_)) => Ok(()),
            Err(e) => Err(e),
        }
    }

    async fn inspect(&self, id: &EnvironmentId) -> Result<EnvironmentStatus> {
        let args = vec![
            "inspect".to_string(),
            "--format".to_string(),
            "{{json .State}}".to_string(),
            id.to_string(),
        ];
        let stdout = self.run_checked("inspect", &args).await?;
        parse_inspect_state(&stdout)
    }

    async fn exec(&self, id: &EnvironmentId, request: &ExecRequest) -> Result<ExecOutput> {
        let start = Instant::now();
        let child = Command::new(&self.config.binary)
            .args(exec_args(id, request))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| self.spawn_error(e))?;

        match tokio::time::timeout(request.timeout(), child.wait_with_output()).await {
            Ok(output) => {
                let output = output?;
                let stderr = String::from_utf8_lossy(&output.stderr).to_string();
                if output.status.code() == Some(1) && stderr.contains(NO_SUCH_CONTAINER) {
                    return Err(SandboxError::NotFound(id.to_string()));
                }
                Ok(ExecOutput {
                    exit_code: output.status.code(),
                    stdout: String::from_utf8_lossy(&output.stdout).to_string(),
                    stderr,
                    duration_ms: start.elapsed().as_millis() as u64,
                    timed_out: false,
                })
            }
            Err(_) => Ok(ExecOutput::timed_out(
                start.elapsed().as_millis() as u64,
                String::new(),
                format!("command timed out after {}ms", request.timeout_ms),
            )),
        }
    }

    async fn write_files(&self, id: &EnvironmentId, files: &[FileWrite]) -> Result<()> {
        for file in files {
            let mut child = Command::new(&self.config.binary)
                .args(write_file_args(id, &file.path))
                .stdin(Stdio::piped())
                .stdout(Stdio::null())
                .stderr(Stdio::piped())
                .kill_on_drop(true)
                .spawn()
                .map_err(|e| self.spawn_error(e))?;

            if let Some(mut stdin) = child.stdin.take() {
                stdin.write_all(file.contents.as_bytes()).await?;
                stdin.shutdown().await?;
            }
            let output = tokio::time::timeout(self.config.command_timeout, child.wait_with_output())
                .await
                .map_err(|_| SandboxError::backend("write_files", format!("timed out writing {}", file.path)))??;
            if !output.status.success() {
                return Err(classify_failure(
                    "write_files",
                    &String::from_utf8_lossy(&output.stderr),
                ));
            }
        }
        Ok(())
    }

    async fn ping(&self) -> Result<()> {
        let args = vec![
            "version".to_string(),
            "--format".to_string(),
            "{{.Server.Version}}".to_string(),
        ];
        self.run_checked("ping", &args).await.map(|_| ())
    }

    async fn create_network(&self, config: &NetworkConfig) -> Result<String> {
        let mut args = vec!["network".to_string(), "create".to_string()];
        if let Some(driver) = &config.driver {
            args.push("--driver".to_string());
            args.push(driver.clone());
        }
        if config.internal {
            args.push("--internal".to_string());
        }
        args.push("--label".to_string());
        args.push(format!("{}=true", MANAGED_LABEL));
        for (key, value) in &config.labels {
            args.push("--label".to_string());
            args.push(format!("{}={}", key, value));
        }
        args.push(config.name.clone());
        self.run_checked("create_network", &args).await
    }

    async fn list_networks(&self) -> Result<Vec<NetworkInfo>> {
        let args = vec![
            "network".to_string(),
            "ls".to_string(),
            "--format".to_string(),
            "{{json .}}".to_string(),
        ];
        let stdout = self.run_checked("list_networks", &args).await?;
        stdout
            .lines()
            .filter(|line| !line.trim().is_empty())
            .map(|line| {
                let parsed: DockerNetworkLine = serde_json::from_str(line)?;
                Ok(NetworkInfo {
                    id: parsed.id,
                    name: parsed.name,
                    driver: parsed.driver,
                })
            })
            .collect()
    }
}
