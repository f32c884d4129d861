//! Project workflow: phases, healing policy and the driving state machine.

pub mod machine;
pub mod policy;
pub mod research;
pub mod runner;

pub use machine::WorkflowMachine;
pub use policy::{GiveUpReason, HealingDecision, HealingPolicy};
pub use research::{ContextResearcher, NoopResearcher, StaticResearcher};
pub use runner::AttemptRunner;
