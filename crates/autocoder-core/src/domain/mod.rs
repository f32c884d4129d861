//! Domain types: specifications, projects, attempts and the error taxonomy.

pub mod attempt;
pub mod diagnostic;
pub mod error;
pub mod phase;
pub mod project;
pub mod request;
pub mod spec;

pub use attempt::{
    AttemptCost, AttemptOutcome, FileSet, GenerationAttempt, StepResult, StepStatus,
};
pub use diagnostic::{Diagnostic, DiagnosticSource, Severity};
pub use error::{AutocoderError, Result};
pub use phase::{allowed_transitions, validate_transition, Phase};
pub use project::{GiveUpReason, PhaseTransition, Project, ProjectId, ProjectResult};
pub use request::GenerationRequest;
pub use spec::{ComponentSpecification, RepositoryRef, TargetType, TestScenario};
