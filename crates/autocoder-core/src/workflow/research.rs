//! The `researching` phase: gather context before the first attempt.

use async_trait::async_trait;

use crate::domain::{ComponentSpecification, Result};

/// Resolves a specification's context references into prompt context.
#[async_trait]
pub trait ContextResearcher: Send + Sync {
    async fn research(&self, spec: &ComponentSpecification) -> Result<Option<String>>;
}

/// Researcher that finds nothing.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopResearcher;

#[async_trait]
impl ContextResearcher for NoopResearcher {
    async fn research(&self, _spec: &ComponentSpecification) -> Result<Option<String>> {
        Ok(None)
    }
}

/// Researcher that answers with fixed notes per reference.
#[derive(Debug, Clone, Default)]
pub struct StaticResearcher {
    notes: Vec<(String, String)>,
}

impl StaticResearcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_note(mut self, reference: impl Into<String>, note: impl Into<String>) -> Self {
        self.notes.push((reference.into(), note.into()));
        self
    }
}

#[async_trait]
impl ContextResearcher for StaticResearcher {
    async fn research(&self, spec: &ComponentSpecification) -> Result<Option<String>> {
        let lines: Vec<String> = spec
            .context_refs
            .iter()
            .filter_map(|r| {
                self.notes
                    .iter()
                    .find(|(reference, _)| reference == r)
                    .map(|(reference, note)| format!("{}: {}", reference, note))
            })
            .collect();
        Ok(if lines.is_empty() {
            None
        } else {
            Some(lines.join("\n"))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::TargetType;

    #[tokio::test]
    async fn test_static_researcher_matches_refs() {
        let mut spec = ComponentSpecification::new("f", "f", TargetType::Module, "typescript");
        spec.context_refs = vec!["lodash".into(), "unknown".into()];
        let researcher = StaticResearcher::new().with_note("lodash", "use lodash/fp");
        let ctx = researcher.research(&spec).await.unwrap();
        assert_eq!(ctx.as_deref(), Some("lodash: use lodash/fp"));
    }
}
