//! Autocoder configuration.
//!
//! Loaded from `autocoder.toml` (or `.autocoder/config.toml`) with every
//! section optional, then overlaid with `AUTOCODER_*` environment variables.
//! Secrets are never stored in the file: it names the environment variable
//! that holds each API key.
//!
//! ```toml
//! [sandbox]
//! backend = "remote"
//! remote_url = "http://sandbox.internal:8790"
//!
//! [generator]
//! model = "claude-3-5-sonnet-latest"
//!
//! [healing]
//! max_healing_attempts = 2
//!
//! [toolchain.languages.typescript]
//! test_command = "npx vitest run"
//! ```

use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use sandbox_manager::fakes::MemoryBackend;
use sandbox_manager::{
    DockerCliBackend, DockerConfig, LifecycleManager, RemoteConfig, RemoteSandboxBackend,
    SandboxBackend,
};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::artifacts::ArtifactStore;
use crate::benchmark::BenchmarkOptions;
use crate::domain::{AutocoderError, Result};
use crate::generation::{
    CodeGenerator, EngineConfig, GenerationEngine, HttpCodeGenerator, HttpGeneratorConfig,
    RetryConfig, TokenPricing, ToolchainProfile,
};
use crate::workflow::{HealingPolicy, WorkflowMachine};

/// Files checked, in order, when no explicit path is given.
pub const DEFAULT_CONFIG_PATHS: [&str; 2] = ["autocoder.toml", ".autocoder/config.toml"];

/// Languages that always get a resolved toolchain entry.
const BUILTIN_LANGUAGES: [&str; 4] = ["typescript", "rust", "python", "go"];

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AutocoderConfig {
    pub sandbox: SandboxSection,
    pub generator: GeneratorSection,
    pub toolchain: ToolchainSection,
    pub engine: EngineSection,
    pub healing: HealingPolicy,
    pub benchmark: BenchmarkSection,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SandboxBackendKind {
    #[default]
    Docker,
    Remote,
    /// In-process backend with no isolation; for smoke tests and dry runs.
    Memory,
}

impl fmt::Display for SandboxBackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SandboxBackendKind::Docker => "docker",
            SandboxBackendKind::Remote => "remote",
            SandboxBackendKind::Memory => "memory",
        };
        f.write_str(name)
    }
}

impl FromStr for SandboxBackendKind {
    type Err = AutocoderError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "docker" => Ok(SandboxBackendKind::Docker),
            "remote" => Ok(SandboxBackendKind::Remote),
            "memory" => Ok(SandboxBackendKind::Memory),
            other => Err(AutocoderError::Config(format!(
                "unknown sandbox backend '{}' (expected docker, remote or memory)",
                other
            ))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SandboxSection {
    pub backend: SandboxBackendKind,
    /// Replaces the image of every toolchain profile when set.
    pub image: Option<String>,
    pub memory_mb: Option<u64>,
    pub cpus: Option<f64>,
    pub docker_binary: String,
    pub remote_url: String,
    /// Name of the variable holding the remote service token.
    pub api_key_env: String,
    pub request_timeout_secs: u64,
}

impl Default for SandboxSection {
    fn default() -> Self {
        Self {
            backend: SandboxBackendKind::Docker,
            image: None,
            memory_mb: None,
            cpus: None,
            docker_binary: "docker".to_string(),
            remote_url: "http://127.0.0.1:8790".to_string(),
            api_key_env: "AUTOCODER_SANDBOX_API_KEY".to_string(),
            request_timeout_secs: 30,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GeneratorSection {
    pub endpoint: String,
    pub model: String,
    pub api_version: String,
    pub max_tokens: u32,
    pub request_timeout_secs: u64,
    /// Name of the variable holding the provider API key.
    pub api_key_env: String,
    pub retry: RetryConfig,
    pub pricing: TokenPricing,
}

impl Default for GeneratorSection {
    fn default() -> Self {
        let http = HttpGeneratorConfig::default();
        Self {
            endpoint: http.endpoint,
            model: http.model,
            api_version: http.api_version,
            max_tokens: http.max_tokens,
            request_timeout_secs: http.request_timeout.as_secs(),
            api_key_env: "ANTHROPIC_API_KEY".to_string(),
            retry: http.retry,
            pricing: TokenPricing::default(),
        }
    }
}

/// Overrides applied on top of the built-in language presets.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ToolchainSection {
    pub work_dir: Option<String>,
    pub build_command: Option<String>,
    pub test_command: Option<String>,
    pub patch_command: Option<String>,
    pub step_timeout_secs: Option<u64>,
    /// Full per-language profiles; unset fields take the TypeScript preset.
    pub languages: HashMap<String, ToolchainProfile>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineSection {
    pub attempt_timeout_secs: u64,
    pub max_diagnostics: usize,
}

impl Default for EngineSection {
    fn default() -> Self {
        let engine = EngineConfig::default();
        Self {
            attempt_timeout_secs: engine.attempt_time_limit.as_secs(),
            max_diagnostics: engine.max_diagnostics,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BenchmarkSection {
    pub max_parallel_instances: usize,
    pub instance_timeout_secs: u64,
    pub artifacts_dir: PathBuf,
    pub retain_artifacts: bool,
}

impl Default for BenchmarkSection {
    fn default() -> Self {
        Self {
            max_parallel_instances: 4,
            instance_timeout_secs: 1_800,
            artifacts_dir: PathBuf::from("autocoder-runs"),
            retain_artifacts: true,
        }
    }
}

impl AutocoderConfig {
    /// Parse configuration from a TOML string.
    pub fn parse(content: &str) -> Result<Self> {
        toml::from_str(content).map_err(|e| AutocoderError::Config(format!("invalid TOML: {}", e)))
    }

    /// Load a configuration file and apply environment overrides.
    ///
    /// With `None`, the first existing file in [`DEFAULT_CONFIG_PATHS`] is
    /// used, or defaults if there is none. An explicit path must exist.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let found = match path {
            Some(p) => Some(p.to_path_buf()),
            None => DEFAULT_CONFIG_PATHS
                .iter()
                .map(PathBuf::from)
                .find(|p| p.is_file()),
        };
        let mut config = match found {
            Some(p) => {
                let content = std::fs::read_to_string(&p).map_err(|e| {
                    AutocoderError::Config(format!("cannot read {}: {}", p.display(), e))
                })?;
                debug!(path = %p.display(), "loaded config");
                Self::parse(&content)?
            }
            None => Self::default(),
        };
        config.apply_overrides(|key| std::env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    /// Overlay `AUTOCODER_*` values from `lookup`.
    pub fn apply_overrides<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(v) = lookup("AUTOCODER_SANDBOX_BACKEND") {
            self.sandbox.backend = v.parse()?;
        }
        if let Some(v) = lookup("AUTOCODER_SANDBOX_URL") {
            self.sandbox.remote_url = v;
        }
        if let Some(v) = lookup("AUTOCODER_IMAGE") {
            self.sandbox.image = Some(v);
        }
        if let Some(v) = lookup("AUTOCODER_MODEL") {
            self.generator.model = v;
        }
        if let Some(v) = lookup("AUTOCODER_MAX_HEALING") {
            self.healing.max_healing_attempts = parse_number("AUTOCODER_MAX_HEALING", &v)?;
        }
        if let Some(v) = lookup("AUTOCODER_MAX_PARALLEL") {
            self.benchmark.max_parallel_instances = parse_number("AUTOCODER_MAX_PARALLEL", &v)?;
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if self.benchmark.max_parallel_instances == 0 {
            return Err(AutocoderError::Config(
                "benchmark.max_parallel_instances must be at least 1".to_string(),
            ));
        }
        if self.benchmark.instance_timeout_secs == 0 || self.engine.attempt_timeout_secs == 0 {
            return Err(AutocoderError::Config("timeouts must be positive".to_string()));
        }
        if matches!(self.toolchain.step_timeout_secs, Some(0)) {
            return Err(AutocoderError::Config(
                "toolchain.step_timeout_secs must be positive".to_string(),
            ));
        }
        Ok(())
    }

    /// The sandbox backend named by `sandbox.backend`.
    pub fn build_backend(&self) -> Result<Arc<dyn SandboxBackend>> {
        let backend: Arc<dyn SandboxBackend> = match self.sandbox.backend {
            SandboxBackendKind::Docker => Arc::new(DockerCliBackend::new(DockerConfig {
                binary: self.sandbox.docker_binary.clone(),
                ..DockerConfig::default()
            })),
            SandboxBackendKind::Remote => {
                let mut remote = RemoteConfig::new(&self.sandbox.remote_url)
                    .with_request_timeout(Duration::from_secs(self.sandbox.request_timeout_secs));
                if let Ok(key) = std::env::var(&self.sandbox.api_key_env) {
                    remote = remote.with_api_key(&key);
                }
                Arc::new(RemoteSandboxBackend::new(remote)?)
            }
            SandboxBackendKind::Memory => Arc::new(MemoryBackend::new()),
        };
        Ok(backend)
    }

    pub fn build_lifecycle(&self) -> Result<LifecycleManager> {
        Ok(LifecycleManager::new(self.build_backend()?))
    }

    pub fn generator_config(&self) -> HttpGeneratorConfig {
        let g = &self.generator;
        HttpGeneratorConfig {
            endpoint: g.endpoint.clone(),
            model: g.model.clone(),
            api_key: std::env::var(&g.api_key_env).ok(),
            api_version: g.api_version.clone(),
            max_tokens: g.max_tokens,
            request_timeout: Duration::from_secs(g.request_timeout_secs),
            retry: g.retry.clone(),
        }
    }

    /// The HTTP model provider. Fails if its API key variable is unset.
    pub fn build_generator(&self) -> Result<Arc<dyn CodeGenerator>> {
        let generator = HttpCodeGenerator::new(self.generator_config()).map_err(|e| {
            AutocoderError::Config(format!("{} (set {})", e, self.generator.api_key_env))
        })?;
        Ok(Arc::new(generator))
    }

    /// Built-in presets plus configured languages, with the generic
    /// sandbox and toolchain overrides applied to each.
    pub fn toolchains(&self) -> HashMap<String, ToolchainProfile> {
        let mut profiles: HashMap<String, ToolchainProfile> = BUILTIN_LANGUAGES
            .iter()
            .map(|l| (l.to_string(), ToolchainProfile::for_language(l)))
            .collect();
        for (language, profile) in &self.toolchain.languages {
            profiles.insert(language.to_ascii_lowercase(), profile.clone());
        }

        let t = &self.toolchain;
        for profile in profiles.values_mut() {
            if let Some(image) = &self.sandbox.image {
                profile.image = image.clone();
            }
            if let Some(memory) = self.sandbox.memory_mb {
                profile.memory_mb = memory;
            }
            if let Some(cpus) = self.sandbox.cpus {
                profile.cpus = cpus;
            }
            if let Some(dir) = &t.work_dir {
                profile.work_dir = dir.clone();
            }
            if let Some(cmd) = &t.build_command {
                profile.build_command = cmd.clone();
            }
            if let Some(cmd) = &t.test_command {
                profile.test_command = cmd.clone();
            }
            if let Some(cmd) = &t.patch_command {
                profile.patch_command = Some(cmd.clone());
            }
            if let Some(secs) = t.step_timeout_secs {
                profile.step_timeout_secs = secs;
            }
        }
        profiles
    }

    pub fn engine_config(&self) -> EngineConfig {
        EngineConfig {
            attempt_time_limit: Duration::from_secs(self.engine.attempt_timeout_secs),
            max_diagnostics: self.engine.max_diagnostics,
            toolchains: self.toolchains(),
            pricing: self.generator.pricing,
        }
    }

    pub fn build_engine(
        &self,
        generator: Arc<dyn CodeGenerator>,
        lifecycle: LifecycleManager,
    ) -> GenerationEngine {
        GenerationEngine::with_config(generator, lifecycle, self.engine_config())
    }

    /// Full stack: backend, provider, engine and workflow machine.
    pub fn build_machine(&self) -> Result<WorkflowMachine> {
        let engine = self.build_engine(self.build_generator()?, self.build_lifecycle()?);
        Ok(WorkflowMachine::new(Arc::new(engine), self.healing.clone()))
    }

    pub fn benchmark_options(&self) -> BenchmarkOptions {
        BenchmarkOptions {
            max_parallel_instances: self.benchmark.max_parallel_instances,
            instance_timeout: Duration::from_secs(self.benchmark.instance_timeout_secs),
            retain_artifacts: self.benchmark.retain_artifacts,
            ..BenchmarkOptions::default()
        }
    }

    pub fn artifact_store(&self) -> ArtifactStore {
        ArtifactStore::new(self.benchmark.artifacts_dir.clone())
    }
}

fn parse_number<T: FromStr>(key: &str, value: &str) -> Result<T> {
    value
        .trim()
        .parse()
        .map_err(|_| AutocoderError::Config(format!("{} must be a number, got '{}'", key, value)))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_empty_file_yields_defaults() {
        let config = AutocoderConfig::parse("").unwrap();
        assert_eq!(config, AutocoderConfig::default());
        assert_eq!(config.sandbox.backend, SandboxBackendKind::Docker);
        assert_eq!(config.healing.max_healing_attempts, 3);
        assert_eq!(config.benchmark.max_parallel_instances, 4);
    }

    #[test]
    fn test_partial_sections_keep_defaults() {
        let config = AutocoderConfig::parse(
            r#"
[sandbox]
backend = "remote"
remote_url = "http://sandbox:8790"

[generator.retry]
max_retries = 1

[healing]
max_healing_attempts = 5

[toolchain.languages.rust]
test_command = "cargo nextest run"
"#,
        )
        .unwrap();
        assert_eq!(config.sandbox.backend, SandboxBackendKind::Remote);
        assert_eq!(config.sandbox.api_key_env, "AUTOCODER_SANDBOX_API_KEY");
        assert_eq!(config.generator.retry.max_retries, 1);
        assert_eq!(config.generator.retry.breaker_threshold, 5);
        assert_eq!(config.healing.max_healing_attempts, 5);
        assert_eq!(config.healing.backoff_base_ms, HealingPolicy::default().backoff_base_ms);
        assert_eq!(
            config.toolchain.languages["rust"].test_command,
            "cargo nextest run"
        );
    }

    #[test]
    fn test_invalid_toml_is_a_config_error() {
        let err = AutocoderConfig::parse("[sandbox\nbackend = 1").unwrap_err();
        assert!(matches!(err, AutocoderError::Config(_)));

        let err = AutocoderConfig::parse("[sandbox]\nbackend = \"podman\"").unwrap_err();
        assert!(matches!(err, AutocoderError::Config(_)));
    }

    #[test]
    fn test_env_overrides_win_over_file() {
        let mut config = AutocoderConfig::parse("[benchmark]\nmax_parallel_instances = 2").unwrap();
        config
            .apply_overrides(lookup(&[
                ("AUTOCODER_SANDBOX_BACKEND", "memory"),
                ("AUTOCODER_IMAGE", "node:22"),
                ("AUTOCODER_MODEL", "test-model"),
                ("AUTOCODER_MAX_HEALING", "1"),
                ("AUTOCODER_MAX_PARALLEL", "8"),
            ]))
            .unwrap();
        assert_eq!(config.sandbox.backend, SandboxBackendKind::Memory);
        assert_eq!(config.generator.model, "test-model");
        assert_eq!(config.healing.max_healing_attempts, 1);
        assert_eq!(config.benchmark.max_parallel_instances, 8);
        assert!(config.toolchains().values().all(|p| p.image == "node:22"));
    }

    #[test]
    fn test_bad_numeric_override_is_rejected() {
        let mut config = AutocoderConfig::default();
        let err = config
            .apply_overrides(lookup(&[("AUTOCODER_MAX_PARALLEL", "many")]))
            .unwrap_err();
        assert!(err.to_string().contains("AUTOCODER_MAX_PARALLEL"));
    }

    #[test]
    fn test_generic_toolchain_overrides_apply_to_every_language() {
        let config = AutocoderConfig::parse(
            "[toolchain]\nstep_timeout_secs = 42\nwork_dir = \"/src\"\n\n[toolchain.languages.zig]\nimage = \"zig:0.13\"\nbuild_command = \"zig build\"\ntest_command = \"zig build test\"\n",
        )
        .unwrap();
        let profiles = config.toolchains();
        assert!(profiles.contains_key("typescript"));
        assert_eq!(profiles["zig"].image, "zig:0.13");
        assert!(profiles.values().all(|p| p.step_timeout_secs == 42 && p.work_dir == "/src"));

        let engine = config.engine_config();
        assert_eq!(engine.toolchains.len(), profiles.len());
        assert_eq!(engine.attempt_time_limit, Duration::from_secs(900));
    }

    #[test]
    fn test_zero_parallelism_fails_validation() {
        let config = AutocoderConfig::parse("[benchmark]\nmax_parallel_instances = 0").unwrap();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_load_explicit_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("autocoder.toml");
        std::fs::write(&path, "[benchmark]\ninstance_timeout_secs = 60\nretain_artifacts = false\n")
            .unwrap();
        let config = AutocoderConfig::load(Some(&path)).unwrap();
        let options = config.benchmark_options();
        assert_eq!(options.instance_timeout, Duration::from_secs(60));
        assert!(!options.retain_artifacts);

        let missing = dir.path().join("nope.toml");
        assert!(AutocoderConfig::load(Some(&missing)).is_err());
    }

    #[tokio::test]
    async fn test_memory_backend_builds_and_pings() {
        let mut config = AutocoderConfig::default();
        config.sandbox.backend = SandboxBackendKind::Memory;
        let lifecycle = config.build_lifecycle().unwrap();
        assert!(lifecycle.ping().await);
    }
}
