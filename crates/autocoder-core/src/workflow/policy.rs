//! Healing policy: whether a failed attempt earns another round.

use std::time::Duration;

use serde::{Deserialize, Serialize};

pub use crate::domain::GiveUpReason;
use crate::domain::{AttemptOutcome, GenerationAttempt, Project};

/// Bounded healing policy. Compile and test failures share one budget.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HealingPolicy {
    pub max_healing_attempts: u32,
    pub backoff_base_ms: u64,
    pub max_backoff_ms: u64,
    /// Treat provisioning failures as healable (they consume budget).
    pub heal_on_provisioning_error: bool,
}

impl Default for HealingPolicy {
    fn default() -> Self {
        Self {
            max_healing_attempts: 3,
            backoff_base_ms: 250,
            max_backoff_ms: 5_000,
            heal_on_provisioning_error: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HealingDecision {
    Heal { delay: Duration },
    GiveUp { reason: GiveUpReason },
}

impl HealingPolicy {
    /// Delay before healing round `round` (1-based).
    pub fn backoff(&self, round: u32) -> Duration {
        let factor = 2u64.saturating_pow(round.saturating_sub(1));
        Duration::from_millis(self.backoff_base_ms.saturating_mul(factor).min(self.max_backoff_ms))
    }

    pub fn decide(&self, project: &Project, attempt: &GenerationAttempt) -> HealingDecision {
        let unrecoverable = match attempt.outcome {
            AttemptOutcome::SetupFailed => true,
            AttemptOutcome::ProvisioningFailed => !self.heal_on_provisioning_error,
            _ => false,
        };
        if unrecoverable {
            return HealingDecision::GiveUp {
                reason: GiveUpReason::Unrecoverable,
            };
        }
        if !project.can_heal() {
            return HealingDecision::GiveUp {
                reason: GiveUpReason::BudgetExhausted,
            };
        }
        HealingDecision::Heal {
            delay: self.backoff(project.healing_attempts() + 1),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{
        AttemptCost, ComponentSpecification, FileSet, GenerationRequest, StepResult, TargetType,
    };
    use chrono::Utc;

    fn attempt(outcome: AttemptOutcome) -> GenerationAttempt {
        let spec = ComponentSpecification::new("f", "f", TargetType::Function, "rust");
        GenerationAttempt {
            attempt_number: 1,
            input: GenerationRequest::initial(spec, None),
            produced_files: FileSet::new(),
            files_digest: String::new(),
            model: None,
            compile_result: StepResult::skipped(),
            test_result: None,
            patch: None,
            cost: AttemptCost::default(),
            outcome,
            environment_id: None,
            started_at: Utc::now(),
            finished_at: Utc::now(),
        }
    }

    fn project(max: u32) -> Project {
        Project::new(
            ComponentSpecification::new("f", "f", TargetType::Function, "rust"),
            max,
        )
    }

    #[test]
    fn test_backoff_is_capped() {
        let policy = HealingPolicy::default();
        assert_eq!(policy.backoff(1), Duration::from_millis(250));
        assert_eq!(policy.backoff(2), Duration::from_millis(500));
        assert_eq!(policy.backoff(10), Duration::from_millis(5_000));
    }

    #[test]
    fn test_heals_while_budget_remains() {
        let policy = HealingPolicy::default();
        let decision = policy.decide(&project(3), &attempt(AttemptOutcome::TestFailed));
        assert!(matches!(decision, HealingDecision::Heal { .. }));
    }

    #[test]
    fn test_gives_up_without_budget() {
        let policy = HealingPolicy::default();
        let decision = policy.decide(&project(0), &attempt(AttemptOutcome::CompileFailed));
        assert_eq!(
            decision,
            HealingDecision::GiveUp {
                reason: GiveUpReason::BudgetExhausted
            }
        );
    }

    #[test]
    fn test_setup_failure_is_never_healed() {
        let policy = HealingPolicy::default();
        let decision = policy.decide(&project(3), &attempt(AttemptOutcome::SetupFailed));
        assert_eq!(
            decision,
            HealingDecision::GiveUp {
                reason: GiveUpReason::Unrecoverable
            }
        );
    }

    #[test]
    fn test_provisioning_can_be_unrecoverable() {
        let policy = HealingPolicy {
            heal_on_provisioning_error: false,
            ..HealingPolicy::default()
        };
        let decision = policy.decide(&project(3), &attempt(AttemptOutcome::ProvisioningFailed));
        assert_eq!(
            decision,
            HealingDecision::GiveUp {
                reason: GiveUpReason::Unrecoverable
            }
        );
    }
}
