//! Projects: one unit of work from specification to terminal outcome.
//!
//! Fields are private. Only the workflow machine mutates a project, through
//! the crate-internal methods below, and nothing mutates it once it is
//! `complete` or `failed`.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::attempt::{AttemptCost, FileSet, GenerationAttempt};
use super::diagnostic::Diagnostic;
use super::error::{AutocoderError, Result};
use super::phase::{validate_transition, Phase};
use super::spec::ComponentSpecification;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ProjectId(Uuid);

impl ProjectId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl Default for ProjectId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ProjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PhaseTransition {
    pub from: Phase,
    pub to: Phase,
    pub at: DateTime<Utc>,
    pub reason: String,
}

/// Why a project ended in `failed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GiveUpReason {
    BudgetExhausted,
    /// Another round cannot help: the environment or repository setup failed.
    Unrecoverable,
    /// The wall-clock deadline expired while the project was live.
    DeadlineExceeded,
    /// A supplied patch failed verification. Supplied patches are not healed.
    Rejected,
}

impl GiveUpReason {
    pub fn as_str(self) -> &'static str {
        match self {
            GiveUpReason::BudgetExhausted => "budget_exhausted",
            GiveUpReason::Unrecoverable => "unrecoverable",
            GiveUpReason::DeadlineExceeded => "deadline_exceeded",
            GiveUpReason::Rejected => "rejected",
        }
    }
}

/// Final status, files and logs of a project.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProjectResult {
    /// Terminal phase, set when the result is sealed.
    pub status: Option<Phase>,
    /// Set together with `error` when the project failed.
    #[serde(default)]
    pub failure: Option<GiveUpReason>,
    pub files: FileSet,
    pub patch: Option<String>,
    pub logs: Vec<String>,
    pub error: Option<String>,
    /// Diagnostics of the last attempt, surfaced to interactive callers.
    pub final_diagnostics: Vec<Diagnostic>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Project {
    id: ProjectId,
    name: String,
    description: String,
    specification: ComponentSpecification,
    phase: Phase,
    healing_attempts: u32,
    max_healing_attempts: u32,
    research_context: Option<String>,
    history: Vec<GenerationAttempt>,
    transitions: Vec<PhaseTransition>,
    result: ProjectResult,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl Project {
    pub fn new(specification: ComponentSpecification, max_healing_attempts: u32) -> Self {
        let now = Utc::now();
        Self {
            id: ProjectId::new(),
            name: specification.name.clone(),
            description: specification.description.clone(),
            specification,
            phase: Phase::Idle,
            healing_attempts: 0,
            max_healing_attempts,
            research_context: None,
            history: Vec::new(),
            transitions: Vec::new(),
            result: ProjectResult::default(),
            created_at: now,
            updated_at: now,
        }
    }

    pub fn id(&self) -> ProjectId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn description(&self) -> &str {
        &self.description
    }

    pub fn specification(&self) -> &ComponentSpecification {
        &self.specification
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn healing_attempts(&self) -> u32 {
        self.healing_attempts
    }

    pub fn max_healing_attempts(&self) -> u32 {
        self.max_healing_attempts
    }

    pub fn research_context(&self) -> Option<&str> {
        self.research_context.as_deref()
    }

    pub fn history(&self) -> &[GenerationAttempt] {
        &self.history
    }

    pub fn transitions(&self) -> &[PhaseTransition] {
        &self.transitions
    }

    pub fn result(&self) -> &ProjectResult {
        &self.result
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn updated_at(&self) -> DateTime<Utc> {
        self.updated_at
    }

    pub fn is_terminal(&self) -> bool {
        self.phase.is_terminal()
    }

    pub fn last_attempt(&self) -> Option<&GenerationAttempt> {
        self.history.last()
    }

    pub fn can_heal(&self) -> bool {
        self.healing_attempts < self.max_healing_attempts
    }

    /// Summed cost of every attempt.
    pub fn total_cost(&self) -> AttemptCost {
        let mut total = AttemptCost::default();
        for attempt in &self.history {
            total += attempt.cost;
        }
        total
    }

    /// Whether any attempt compiled.
    pub fn ever_compiled(&self) -> bool {
        self.history.iter().any(GenerationAttempt::compiled)
    }

    fn ensure_mutable(&self) -> Result<()> {
        if self.is_terminal() {
            return Err(AutocoderError::InvalidTransition {
                from: self.phase,
                to: self.phase,
            });
        }
        Ok(())
    }

    pub(crate) fn transition(&mut self, to: Phase, reason: impl Into<String>) -> Result<Phase> {
        let from = self.phase;
        validate_transition(from, to)?;
        let now = Utc::now();
        self.transitions.push(PhaseTransition {
            from,
            to,
            at: now,
            reason: reason.into(),
        });
        self.phase = to;
        self.updated_at = now;
        Ok(from)
    }

    pub(crate) fn record_attempt(&mut self, attempt: GenerationAttempt) -> Result<()> {
        self.ensure_mutable()?;
        self.result.logs.push(format!(
            "attempt {}: {}",
            attempt.attempt_number, attempt.outcome
        ));
        self.history.push(attempt);
        self.updated_at = Utc::now();
        Ok(())
    }

    pub(crate) fn begin_healing(&mut self) -> Result<u32> {
        self.ensure_mutable()?;
        if !self.can_heal() {
            return Err(AutocoderError::HealingExhausted {
                attempts: self.healing_attempts,
            });
        }
        self.healing_attempts += 1;
        Ok(self.healing_attempts)
    }

    pub(crate) fn set_research_context(&mut self, context: Option<String>) -> Result<()> {
        self.ensure_mutable()?;
        self.research_context = context;
        Ok(())
    }

    pub(crate) fn log(&mut self, line: impl Into<String>) {
        if !self.is_terminal() {
            self.result.logs.push(line.into());
        }
    }

    /// Capture the final files, patch and diagnostics before the terminal
    /// transition.
    pub(crate) fn seal_result(
        &mut self,
        status: Phase,
        failure: Option<(GiveUpReason, String)>,
    ) -> Result<()> {
        self.ensure_mutable()?;
        self.result.status = Some(status);
        if let Some(last) = self.history.last() {
            self.result.files = last.produced_files.clone();
            self.result.patch = last.patch.clone();
            self.result.final_diagnostics = last.diagnostics();
        }
        match failure {
            Some((reason, error)) => {
                self.result.failure = Some(reason);
                self.result.error = Some(error);
            }
            None => {
                self.result.failure = None;
                self.result.error = None;
            }
        }
        Ok(())
    }

    /// Seal the result as failed and move to `failed` from any live phase.
    /// Returns the phase left behind.
    pub(crate) fn fail(&mut self, reason: GiveUpReason, error: impl Into<String>) -> Result<Phase> {
        self.seal_result(Phase::Failed, Some((reason, error.into())))?;
        self.transition(Phase::Failed, reason.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::spec::TargetType;

    fn project(max: u32) -> Project {
        let spec = ComponentSpecification::new("add", "add two numbers", TargetType::Function, "rust");
        Project::new(spec, max)
    }

    #[test]
    fn test_new_project_is_idle() {
        let p = project(3);
        assert_eq!(p.phase(), Phase::Idle);
        assert_eq!(p.healing_attempts(), 0);
        assert!(p.history().is_empty());
        assert_eq!(p.name(), "add");
    }

    #[test]
    fn test_transition_is_logged() {
        let mut p = project(3);
        let from = p.transition(Phase::Researching, "submitted").unwrap();
        assert_eq!(from, Phase::Idle);
        assert_eq!(p.transitions().len(), 1);
        assert_eq!(p.transitions()[0].to, Phase::Researching);
    }

    #[test]
    fn test_illegal_transition_leaves_phase_unchanged() {
        let mut p = project(3);
        assert!(p.transition(Phase::Testing, "skip").is_err());
        assert_eq!(p.phase(), Phase::Idle);
        assert!(p.transitions().is_empty());
    }

    #[test]
    fn test_healing_never_exceeds_maximum() {
        let mut p = project(2);
        assert_eq!(p.begin_healing().unwrap(), 1);
        assert_eq!(p.begin_healing().unwrap(), 2);
        assert!(matches!(
            p.begin_healing(),
            Err(AutocoderError::HealingExhausted { attempts: 2 })
        ));
        assert_eq!(p.healing_attempts(), 2);
    }

    #[test]
    fn test_fail_from_a_live_phase_seals_the_reason() {
        let mut p = project(3);
        p.transition(Phase::Researching, "submitted").unwrap();
        p.transition(Phase::Developing, "context gathered").unwrap();

        let from = p.fail(GiveUpReason::DeadlineExceeded, "timed out after 10ms: instance").unwrap();

        assert_eq!(from, Phase::Developing);
        assert_eq!(p.phase(), Phase::Failed);
        assert_eq!(p.result().status, Some(Phase::Failed));
        assert_eq!(p.result().failure, Some(GiveUpReason::DeadlineExceeded));
        assert!(p.result().error.as_deref().unwrap().starts_with("timed out"));
        assert!(p.fail(GiveUpReason::Unrecoverable, "again").is_err());
        assert_eq!(p.result().failure, Some(GiveUpReason::DeadlineExceeded));
    }

    #[test]
    fn test_terminal_project_is_immutable() {
        let mut p = project(3);
        p.transition(Phase::Failed, "cancelled").unwrap();
        assert!(p.set_research_context(Some("ctx".into())).is_err());
        assert!(p.begin_healing().is_err());
        assert!(p.transition(Phase::Researching, "again").is_err());
    }
}
