//! Toolchain profiles: which image to run in and which commands build and test.

use std::time::Duration;

use sandbox_manager::{EnvironmentRole, EnvironmentSpec, ResourceLimits, DEFAULT_WORK_DIR};
use serde::{Deserialize, Serialize};

use crate::domain::ComponentSpecification;

/// Label carrying the owning project on every environment.
pub const OWNER_LABEL: &str = "autocoder.project";

/// How to build and test code for one language.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ToolchainProfile {
    /// Base image or sandbox template.
    pub image: String,

    pub work_dir: String,

    /// Commands run once after the files are written (dependency install).
    pub setup_commands: Vec<String>,

    pub build_command: String,

    pub test_command: String,

    /// Command whose stdout is captured as the attempt's patch.
    pub patch_command: Option<String>,

    /// Timeout per build or test step, in seconds.
    pub step_timeout_secs: u64,

    pub memory_mb: u64,

    pub cpus: f64,
}

impl Default for ToolchainProfile {
    fn default() -> Self {
        Self::typescript()
    }
}

impl ToolchainProfile {
    fn base(image: &str, build: &str, test: &str) -> Self {
        Self {
            image: image.to_string(),
            work_dir: DEFAULT_WORK_DIR.to_string(),
            setup_commands: Vec::new(),
            build_command: build.to_string(),
            test_command: test.to_string(),
            patch_command: None,
            step_timeout_secs: 300,
            memory_mb: ResourceLimits::default().memory_mb,
            cpus: ResourceLimits::default().cpus,
        }
    }

    pub fn typescript() -> Self {
        let mut profile = Self::base(
            "node:20-bookworm",
            "npx --yes tsc --noEmit -p . || npm run build --if-present",
            "npm test --silent",
        );
        profile.setup_commands = vec!["npm install --no-audit --no-fund".to_string()];
        profile
    }

    pub fn rust() -> Self {
        Self::base("rust:1.83", "cargo build --all-targets --quiet", "cargo test --quiet")
    }

    pub fn python() -> Self {
        let mut profile = Self::base("python:3.12", "python -m compileall -q .", "python -m pytest -q");
        profile.setup_commands =
            vec!["if [ -f requirements.txt ]; then pip install -q -r requirements.txt; fi".to_string()];
        profile
    }

    pub fn go() -> Self {
        Self::base("golang:1.22", "go build ./...", "go test ./...")
    }

    /// Built-in profile for a language name; unknown languages get the
    /// TypeScript profile.
    pub fn for_language(language: &str) -> Self {
        match language.to_ascii_lowercase().as_str() {
            "rust" | "rs" => Self::rust(),
            "python" | "py" => Self::python(),
            "go" | "golang" => Self::go(),
            _ => Self::typescript(),
        }
    }

    /// Apply specification-level overrides: explicit commands, and a
    /// `git diff` patch capture for repository-backed work.
    pub fn resolve_for(mut self, spec: &ComponentSpecification) -> Self {
        if let Some(build) = &spec.build_command {
            self.build_command = build.clone();
        }
        if let Some(test) = &spec.test_command {
            self.test_command = test.clone();
        }
        if spec.repository.is_some() && self.patch_command.is_none() {
            self.patch_command = Some("git diff --no-color".to_string());
        }
        self
    }

    pub fn step_timeout(&self) -> Duration {
        Duration::from_secs(self.step_timeout_secs)
    }

    /// Environment spec for one attempt owned by `owner`.
    pub fn environment_spec(&self, owner: &str) -> EnvironmentSpec {
        EnvironmentSpec::new(self.image.clone(), EnvironmentRole::Coder)
            .with_limits(ResourceLimits {
                memory_mb: self.memory_mb,
                cpus: self.cpus,
            })
            .with_work_dir(self.work_dir.clone())
            .with_label(OWNER_LABEL, owner)
            .with_env("CI", "true")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::TargetType;

    #[test]
    fn test_language_presets() {
        assert!(ToolchainProfile::for_language("Rust").test_command.starts_with("cargo test"));
        assert!(ToolchainProfile::for_language("go").build_command.starts_with("go build"));
        assert_eq!(ToolchainProfile::for_language("cobol").image, "node:20-bookworm");
    }

    #[test]
    fn test_spec_overrides_commands_and_enables_patch_capture() {
        let spec = ComponentSpecification::new("fix", "fix bug", TargetType::Patch, "typescript")
            .with_repository("https://github.com/acme/widgets", Some("abc123".into()))
            .with_commands(None, Some("npx jest".into()));
        let profile = ToolchainProfile::for_language(&spec.language).resolve_for(&spec);
        assert_eq!(profile.test_command, "npx jest");
        assert!(profile.build_command.contains("tsc"));
        assert_eq!(profile.patch_command.as_deref(), Some("git diff --no-color"));
    }

    #[test]
    fn test_environment_spec_is_labelled_with_owner() {
        let spec = ToolchainProfile::rust().environment_spec("project-1");
        assert_eq!(spec.labels.get(OWNER_LABEL).map(String::as_str), Some("project-1"));
        assert_eq!(spec.work_dir(), DEFAULT_WORK_DIR);
        assert!(spec.validate().is_ok());
    }
}
