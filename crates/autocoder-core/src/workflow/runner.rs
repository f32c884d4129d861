use async_trait::async_trait;

use crate::domain::{GenerationAttempt, GenerationRequest, Result};
use crate::generation::GenerationOutput;

/// Seam between the workflow machine and the generation mechanics.
///
/// `run_attempt` never fails: provisioning, generator, compile and test
/// problems all come back as a classified attempt.
#[async_trait]
pub trait AttemptRunner: Send + Sync {
    async fn run_attempt(&self, request: &GenerationRequest, owner: &str) -> GenerationAttempt;

    /// Check out, apply `patch`, build and test without calling the
    /// generator. Classified like `run_attempt`; `model` labels the attempt.
    async fn verify_patch(
        &self,
        request: &GenerationRequest,
        patch: &str,
        model: &str,
        owner: &str,
    ) -> GenerationAttempt;

    /// Generate only, without any environment.
    async fn generate_only(&self, request: &GenerationRequest) -> Result<GenerationOutput>;

    /// Force-release every environment still held for `owner`.
    async fn abandon(&self, owner: &str) -> usize;
}
