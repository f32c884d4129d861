//! Autocoder Core Library
//!
//! Generates code from a component specification, builds and tests it inside
//! an isolated environment, and feeds failures back into bounded healing
//! rounds. The same loop replays repair-task datasets in benchmark mode.
//!
//! Layering: `generation` runs one attempt and classifies it; `workflow`
//! decides whether to heal or stop; `benchmark` runs many projects under a
//! concurrency bound. Environments come from the `sandbox-manager` crate.

pub mod artifacts;
pub mod benchmark;
pub mod config;
pub mod domain;
pub mod generation;
pub mod obs;
pub mod telemetry;
pub mod workflow;

pub use artifacts::ArtifactStore;

pub use benchmark::{
    load_dataset, load_predictions, parse_dataset, parse_predictions, BenchmarkInstanceResult,
    BenchmarkOptions, BenchmarkReport, BenchmarkRunner, BenchmarkTask, DatasetFilter,
    InstanceError, InstanceErrorKind, Prediction,
};

pub use config::{AutocoderConfig, SandboxBackendKind};

pub use telemetry::init_tracing;

pub use domain::{
    AttemptCost, AttemptOutcome, AutocoderError, ComponentSpecification, Diagnostic,
    DiagnosticSource, FileSet, GenerationAttempt, GenerationRequest, GiveUpReason, Phase, Project,
    ProjectId,
    ProjectResult, RepositoryRef, Result, TargetType, TestScenario,
};

pub use generation::{
    CodeGenerator, EngineConfig, GenerationEngine, GenerationOutput, HttpCodeGenerator,
    ToolchainProfile,
};

pub use workflow::{
    AttemptRunner, ContextResearcher, HealingDecision, HealingPolicy, NoopResearcher,
    WorkflowMachine,
};
