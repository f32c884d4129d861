//! Backend trait implemented by every container/sandbox provider.

use async_trait::async_trait;

use crate::environment::{
    EnvironmentId, EnvironmentSpec, EnvironmentStatus, ExecOutput, ExecRequest, FileWrite,
    NetworkConfig, NetworkInfo,
};
use crate::error::{Result, SandboxError};

/// Uniform create/start/inspect/stop/remove contract over an external
/// compute resource.
///
/// Implementations must tolerate concurrent calls. `stop` and `remove` on an
/// environment that no longer exists succeed. `inspect` on an unknown id
/// returns [`SandboxError::NotFound`].
#[async_trait]
pub trait SandboxBackend: Send + Sync {
    /// Short backend name for logs.
    fn name(&self) -> &str;

    async fn create(&self, spec: &EnvironmentSpec) -> Result<EnvironmentId>;

    async fn start(&self, id: &EnvironmentId) -> Result<()>;

    async fn stop(&self, id: &EnvironmentId) -> Result<()>;

    async fn remove(&self, id: &EnvironmentId) -> Result<()>;

    async fn inspect(&self, id: &EnvironmentId) -> Result<EnvironmentStatus>;

    /// Run a command, enforcing `request.timeout_ms`. A timeout is reported
    /// through `ExecOutput::timed_out`, not as an error.
    async fn exec(&self, id: &EnvironmentId, request: &ExecRequest) -> Result<ExecOutput>;

    /// Write files at absolute paths, creating parent directories.
    async fn write_files(&self, id: &EnvironmentId, files: &[FileWrite]) -> Result<()>;

    /// Liveness of the backend service itself.
    async fn ping(&self) -> Result<()>;

    async fn create_network(&self, _config: &NetworkConfig) -> Result<String> {
        Err(SandboxError::Unsupported("create_network".to_string()))
    }

    async fn list_networks(&self) -> Result<Vec<NetworkInfo>> {
        Err(SandboxError::Unsupported("list_networks".to_string()))
    }
}
