//! Scripted code generator for tests.

use std::sync::{Arc, Mutex};

use async_trait::async_trait;

use super::provider::{CodeGenerator, GenerationError, GenerationOutput, TokenUsage};
use crate::domain::{FileSet, GenerationRequest};

type Script = Arc<dyn Fn(&GenerationRequest) -> Result<FileSet, GenerationError> + Send + Sync>;

/// Generator that answers from a script and records every request it saw.
pub struct ScriptedGenerator {
    script: Script,
    requests: Mutex<Vec<GenerationRequest>>,
    usage: TokenUsage,
}

impl ScriptedGenerator {
    pub fn from_fn<F>(script: F) -> Self
    where
        F: Fn(&GenerationRequest) -> Result<FileSet, GenerationError> + Send + Sync + 'static,
    {
        Self {
            script: Arc::new(script),
            requests: Mutex::new(Vec::new()),
            usage: TokenUsage {
                prompt_tokens: 1_000,
                completion_tokens: 500,
            },
        }
    }

    /// Attempt N gets the Nth file set; the last one repeats.
    pub fn sequence(sets: Vec<FileSet>) -> Self {
        Self::from_fn(move |request| {
            let index = (request.attempt_number as usize).saturating_sub(1);
            sets.get(index)
                .or_else(|| sets.last())
                .cloned()
                .ok_or(GenerationError::EmptyResponse)
        })
    }

    pub fn always(files: FileSet) -> Self {
        Self::sequence(vec![files])
    }

    pub fn failing(message: &str) -> Self {
        let message = message.to_string();
        Self::from_fn(move |_| {
            Err(GenerationError::Status {
                status: 529,
                body: message.clone(),
            })
        })
    }

    pub fn with_usage(mut self, usage: TokenUsage) -> Self {
        self.usage = usage;
        self
    }

    pub fn requests(&self) -> Vec<GenerationRequest> {
        self.requests.lock().unwrap().clone()
    }

    pub fn call_count(&self) -> usize {
        self.requests.lock().unwrap().len()
    }
}

#[async_trait]
impl CodeGenerator for ScriptedGenerator {
    fn name(&self) -> &str {
        "scripted"
    }

    async fn generate(&self, request: &GenerationRequest) -> Result<GenerationOutput, GenerationError> {
        self.requests.lock().unwrap().push(request.clone());
        let files = (*self.script)(request)?;
        Ok(GenerationOutput {
            files,
            usage: self.usage,
            model: "scripted".to_string(),
        })
    }
}
