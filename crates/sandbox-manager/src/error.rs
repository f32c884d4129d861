//! Error types for sandbox-manager

use thiserror::Error;

/// Errors that can occur while managing sandbox environments
#[derive(Error, Debug)]
pub enum SandboxError {
    /// The environment could not be provisioned (create or start failed)
    #[error("provisioning failed: {0}")]
    Provisioning(String),

    /// The environment spec was rejected before reaching the backend
    #[error("invalid environment spec: {0}")]
    InvalidSpec(String),

    /// No environment with this id is known
    #[error("environment not found: {0}")]
    NotFound(String),

    /// The backend accepted the call but reported a failure
    #[error("backend {operation} failed: {reason}")]
    Backend { operation: String, reason: String },

    /// The backend service could not be reached
    #[error("backend unavailable: {0}")]
    Unavailable(String),

    /// Optional capability the backend does not implement
    #[error("operation not supported by backend: {0}")]
    Unsupported(String),

    /// Terminal removal of an environment failed
    #[error("teardown of {id} failed: {reason}")]
    Teardown { id: String, reason: String },

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON parsing error
    #[error("JSON parsing error: {0}")]
    Json(#[from] serde_json::Error),

    /// HTTP error
    #[error("HTTP error: {0}")]
    Http(String),
}

impl SandboxError {
    pub(crate) fn backend(operation: &str, reason: impl Into<String>) -> Self {
        SandboxError::Backend {
            operation: operation.to_string(),
            reason: reason.into(),
        }
    }

    /// Whether this error means the backend itself could not be observed.
    pub fn is_unavailable(&self) -> bool {
        matches!(self, SandboxError::Unavailable(_))
    }
}

impl From<reqwest::Error> for SandboxError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_connect() || err.is_timeout() {
            SandboxError::Unavailable(err.to_string())
        } else {
            SandboxError::Http(err.to_string())
        }
    }
}

/// Result type for sandbox operations
pub type Result<T> = std::result::Result<T, SandboxError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backend_error_display() {
        let err = SandboxError::backend("start", "container exited");
        assert_eq!(err.to_string(), "backend start failed: container exited");
    }

    #[test]
    fn test_unavailable_classification() {
        assert!(SandboxError::Unavailable("refused".into()).is_unavailable());
        assert!(!SandboxError::NotFound("abc".into()).is_unavailable());
    }
}
