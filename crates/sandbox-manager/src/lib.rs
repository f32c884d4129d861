//! Sandbox Manager - isolated execution environments for generated code
//!
//! Layer 1 of the autocoder stack. Provides a uniform lifecycle contract over
//! local containers and remote ephemeral sandboxes, and owns all cleanup.
//!
//! ## Modules
//!
//! - `environment`: specs, ids, states and exec payloads
//! - `backend`: the [`SandboxBackend`] trait
//! - `manager`: [`LifecycleManager`], leases and scoped acquisition
//! - `docker`: local container daemon via the `docker` CLI
//! - `remote`: JSON-over-HTTP sandbox service
//! - `fakes`: in-memory backend for tests

pub mod backend;
pub mod docker;
pub mod environment;
pub mod error;
pub mod fakes;
pub mod manager;
pub mod remote;

pub use backend::SandboxBackend;
pub use docker::{DockerCliBackend, DockerConfig};
pub use environment::{
    Capability, EnvironmentId, EnvironmentRole, EnvironmentSpec, EnvironmentState,
    EnvironmentStatus, ExecOutput, ExecRequest, FileWrite, NetworkConfig, NetworkInfo,
    PortMapping, ResourceLimits, DEFAULT_WORK_DIR,
};
pub use error::{Result, SandboxError};
pub use manager::{
    EnvironmentHandle, EnvironmentLease, EnvironmentSummary, LifecycleManager, ManagerConfig,
    ScopedOutcome,
};
pub use remote::{RemoteConfig, RemoteSandboxBackend};
