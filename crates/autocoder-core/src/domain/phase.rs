//! Project phases and the legal transitions between them.

use std::fmt;

use serde::{Deserialize, Serialize};

use super::error::{AutocoderError, Result};

/// Workflow phase of a project. `Complete` and `Failed` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Idle,
    Researching,
    Developing,
    Testing,
    Healing,
    Complete,
    Failed,
}

impl Phase {
    pub fn is_terminal(self) -> bool {
        matches!(self, Phase::Complete | Phase::Failed)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Phase::Idle => "idle",
            Phase::Researching => "researching",
            Phase::Developing => "developing",
            Phase::Testing => "testing",
            Phase::Healing => "healing",
            Phase::Complete => "complete",
            Phase::Failed => "failed",
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

pub fn allowed_transitions(from: Phase) -> Vec<Phase> {
    use Phase::*;
    match from {
        Idle => vec![Researching, Failed],
        Researching => vec![Developing, Failed],
        Developing => vec![Testing, Healing, Failed],
        Testing => vec![Complete, Healing, Failed],
        Healing => vec![Developing, Failed],
        Complete => vec![],
        Failed => vec![],
    }
}

pub fn validate_transition(from: Phase, to: Phase) -> Result<()> {
    if allowed_transitions(from).contains(&to) {
        Ok(())
    } else {
        Err(AutocoderError::InvalidTransition { from, to })
    }
}
