//! Generation requests: what the generator is asked for on each attempt.

use serde::{Deserialize, Serialize};

use super::attempt::FileSet;
use super::diagnostic::Diagnostic;
use super::spec::ComponentSpecification;

/// Input to one generation call.
///
/// Retries carry the previous attempt's diagnostics and files so the model
/// can target the actual defect.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenerationRequest {
    pub specification: ComponentSpecification,
    pub attempt_number: u32,
    #[serde(default)]
    pub research_context: Option<String>,
    #[serde(default)]
    pub prior_diagnostics: Vec<Diagnostic>,
    #[serde(default)]
    pub prior_files: Option<FileSet>,
}

impl GenerationRequest {
    pub fn initial(specification: ComponentSpecification, research_context: Option<String>) -> Self {
        Self {
            specification,
            attempt_number: 1,
            research_context,
            prior_diagnostics: Vec::new(),
            prior_files: None,
        }
    }

    pub fn repair(
        specification: ComponentSpecification,
        research_context: Option<String>,
        attempt_number: u32,
        prior_diagnostics: Vec<Diagnostic>,
        prior_files: FileSet,
    ) -> Self {
        Self {
            specification,
            attempt_number,
            research_context,
            prior_diagnostics,
            prior_files: if prior_files.is_empty() {
                None
            } else {
                Some(prior_files)
            },
        }
    }

    pub fn is_repair(&self) -> bool {
        self.attempt_number > 1
    }
}
