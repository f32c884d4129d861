//! Component specifications: the structured requirements a project starts from.

use std::fmt;

use serde::{Deserialize, Serialize};

use super::error::{AutocoderError, Result};

/// Kind of artifact the generator is asked to produce.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TargetType {
    Function,
    Module,
    Service,
    Plugin,
    /// A change against an existing repository checkout.
    Patch,
}

impl fmt::Display for TargetType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TargetType::Function => "function",
            TargetType::Module => "module",
            TargetType::Service => "service",
            TargetType::Plugin => "plugin",
            TargetType::Patch => "patch",
        };
        f.write_str(s)
    }
}

/// A behaviour the generated code must demonstrate under test.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TestScenario {
    pub name: String,
    pub description: String,
    #[serde(default)]
    pub expected: Option<String>,
}

impl TestScenario {
    pub fn new(name: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            expected: None,
        }
    }
}

/// Repository the candidate files are applied to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RepositoryRef {
    pub url: String,
    #[serde(default)]
    pub base_commit: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ComponentSpecification {
    pub name: String,
    pub description: String,
    pub target_type: TargetType,
    /// Lowercase language name, used to pick a toolchain profile.
    pub language: String,
    #[serde(default)]
    pub required_capabilities: Vec<String>,
    #[serde(default)]
    pub test_scenarios: Vec<TestScenario>,
    /// Symbols or dependencies to resolve while researching.
    #[serde(default)]
    pub context_refs: Vec<String>,
    #[serde(default)]
    pub repository: Option<RepositoryRef>,
    /// Patch applied after checkout that adds the tests judging the change.
    #[serde(default)]
    pub test_patch: Option<String>,
    #[serde(default)]
    pub build_command: Option<String>,
    #[serde(default)]
    pub test_command: Option<String>,
}

impl ComponentSpecification {
    pub fn new(
        name: impl Into<String>,
        description: impl Into<String>,
        target_type: TargetType,
        language: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            target_type,
            language: language.into().to_lowercase(),
            required_capabilities: Vec::new(),
            test_scenarios: Vec::new(),
            context_refs: Vec::new(),
            repository: None,
            test_patch: None,
            build_command: None,
            test_command: None,
        }
    }

    pub fn with_scenario(mut self, scenario: TestScenario) -> Self {
        self.test_scenarios.push(scenario);
        self
    }

    pub fn with_capability(mut self, capability: impl Into<String>) -> Self {
        self.required_capabilities.push(capability.into());
        self
    }

    pub fn with_repository(mut self, url: impl Into<String>, base_commit: Option<String>) -> Self {
        self.repository = Some(RepositoryRef {
            url: url.into(),
            base_commit,
        });
        self
    }

    pub fn with_test_patch(mut self, patch: impl Into<String>) -> Self {
        self.test_patch = Some(patch.into());
        self
    }

    pub fn with_commands(mut self, build: Option<String>, test: Option<String>) -> Self {
        self.build_command = build;
        self.test_command = test;
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.name.trim().is_empty() {
            return Err(AutocoderError::InvalidSpecification(
                "name must not be empty".to_string(),
            ));
        }
        if self.description.trim().is_empty() {
            return Err(AutocoderError::InvalidSpecification(
                "description must not be empty".to_string(),
            ));
        }
        if self.target_type == TargetType::Patch && self.repository.is_none() {
            return Err(AutocoderError::InvalidSpecification(
                "patch targets require a repository".to_string(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_patch_requires_repository() {
        let spec = ComponentSpecification::new("fix", "fix the bug", TargetType::Patch, "go");
        assert!(spec.validate().is_err());
        let spec = spec.with_repository("https://github.com/o/r", Some("abc".into()));
        assert!(spec.validate().is_ok());
    }

    #[test]
    fn test_language_is_normalized() {
        let spec = ComponentSpecification::new("f", "d", TargetType::Function, "TypeScript");
        assert_eq!(spec.language, "typescript");
    }

    #[test]
    fn test_deserialize_minimal() {
        let json = r#"{
            "name": "slugify",
            "description": "Convert a title into a URL slug",
            "target_type": "function",
            "language": "typescript",
            "test_scenarios": [{"name": "spaces", "description": "spaces become dashes"}]
        }"#;
        let spec: ComponentSpecification = serde_json::from_str(json).unwrap();
        assert_eq!(spec.target_type, TargetType::Function);
        assert_eq!(spec.test_scenarios.len(), 1);
        assert!(spec.repository.is_none());
    }
}
