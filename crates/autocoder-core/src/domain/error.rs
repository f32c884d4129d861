//! Error taxonomy for autocoder.

use std::path::PathBuf;

use sandbox_manager::SandboxError;

use super::phase::Phase;

/// Autocoder domain errors.
///
/// `Provisioning`, `Compilation`, `TestFailure` and `Timeout` describe failed
/// attempts and are normally carried inside a `GenerationAttempt` rather than
/// returned. `InvalidTransition` is an invariant violation and always
/// propagates.
#[derive(Debug, thiserror::Error)]
pub enum AutocoderError {
    #[error("provisioning error: {0}")]
    Provisioning(String),

    #[error("compilation failed: {0}")]
    Compilation(String),

    #[error("tests failed: {0}")]
    TestFailure(String),

    #[error("timed out after {limit_ms}ms: {context}")]
    Timeout { context: String, limit_ms: u64 },

    #[error("healing exhausted after {attempts} healing attempts")]
    HealingExhausted { attempts: u32 },

    #[error("benchmark instance {instance_id} failed: {reason}")]
    BenchmarkInstance { instance_id: String, reason: String },

    #[error("invalid phase transition: {from} -> {to}")]
    InvalidTransition { from: Phase, to: Phase },

    #[error("invalid specification: {0}")]
    InvalidSpecification(String),

    #[error("generation error: {0}")]
    Generation(String),

    #[error("dataset error: {0}")]
    Dataset(String),

    #[error("config error: {0}")]
    Config(String),

    #[error("artifact already exists: {}", .0.display())]
    ArtifactExists(PathBuf),

    #[error("digest mismatch: expected {expected}, got {actual}")]
    DigestMismatch { expected: String, actual: String },

    #[error("sandbox error: {0}")]
    Sandbox(#[from] SandboxError),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl AutocoderError {
    /// Stable snake_case tag used in reports and logs.
    pub fn kind(&self) -> &'static str {
        match self {
            AutocoderError::Provisioning(_) | AutocoderError::Sandbox(_) => "provisioning",
            AutocoderError::Compilation(_) => "compilation",
            AutocoderError::TestFailure(_) => "test_failure",
            AutocoderError::Timeout { .. } => "timeout",
            AutocoderError::HealingExhausted { .. } => "healing_exhausted",
            AutocoderError::BenchmarkInstance { .. } => "benchmark_instance",
            AutocoderError::InvalidTransition { .. } => "invalid_transition",
            AutocoderError::InvalidSpecification(_) => "invalid_specification",
            AutocoderError::Generation(_) => "generation",
            AutocoderError::Dataset(_) => "dataset",
            AutocoderError::Config(_) => "config",
            AutocoderError::ArtifactExists(_) => "artifact_exists",
            AutocoderError::DigestMismatch { .. } => "digest_mismatch",
            AutocoderError::Serialization(_) => "serialization",
            AutocoderError::Io(_) => "io",
        }
    }
}

/// Result type for autocoder operations.
pub type Result<T> = std::result::Result<T, AutocoderError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = AutocoderError::HealingExhausted { attempts: 3 };
        assert_eq!(err.to_string(), "healing exhausted after 3 healing attempts");

        let err = AutocoderError::InvalidTransition {
            from: Phase::Complete,
            to: Phase::Developing,
        };
        assert_eq!(err.to_string(), "invalid phase transition: complete -> developing");
    }

    #[test]
    fn test_sandbox_errors_are_provisioning() {
        let err: AutocoderError = SandboxError::Unavailable("refused".into()).into();
        assert_eq!(err.kind(), "provisioning");
        assert!(err.to_string().contains("refused"));
    }
}
