//! Generation engine: generate -> provision -> build -> test, classified.
//!
//! The engine is mechanics only. It never decides whether to retry; every
//! failure it can observe comes back as a [`GenerationAttempt`] with an
//! [`AttemptOutcome`] and structured diagnostics.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::Utc;
use sandbox_manager::{
    EnvironmentHandle, ExecRequest, FileWrite, LifecycleManager, SandboxError, ScopedOutcome,
};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{debug, info, instrument, warn};

use super::diagnostics::{classify_step, tail, StepKind};
use super::provider::{CodeGenerator, GenerationOutput, TokenUsage};
use super::toolchain::ToolchainProfile;
use crate::domain::{
    AttemptCost, AttemptOutcome, AutocoderError, ComponentSpecification, Diagnostic,
    DiagnosticSource, FileSet, GenerationAttempt, GenerationRequest, RepositoryRef, Result,
    StepResult, StepStatus, TargetType,
};
use crate::workflow::AttemptRunner;

/// Where the test patch is written inside a repository checkout.
const TEST_PATCH_PATH: &str = ".autocoder/test.patch";
/// Where a supplied candidate patch is written before it is applied.
const CANDIDATE_PATCH_PATH: &str = ".autocoder/candidate.patch";

/// USD per million tokens.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TokenPricing {
    pub prompt_usd_per_mtok: f64,
    pub completion_usd_per_mtok: f64,
}

impl Default for TokenPricing {
    fn default() -> Self {
        Self {
            prompt_usd_per_mtok: 3.0,
            completion_usd_per_mtok: 15.0,
        }
    }
}

impl TokenPricing {
    pub fn estimate(&self, usage: TokenUsage) -> f64 {
        (usage.prompt_tokens as f64 * self.prompt_usd_per_mtok
            + usage.completion_tokens as f64 * self.completion_usd_per_mtok)
            / 1_000_000.0
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Wall-clock budget for one attempt inside its environment.
    pub attempt_time_limit: Duration,
    /// Cap on diagnostics kept per step.
    pub max_diagnostics: usize,
    /// Per-language profile overrides, keyed by lowercase language.
    pub toolchains: HashMap<String, ToolchainProfile>,
    pub pricing: TokenPricing,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            attempt_time_limit: Duration::from_secs(900),
            max_diagnostics: 20,
            toolchains: HashMap::new(),
            pricing: TokenPricing::default(),
        }
    }
}

/// What the pipeline got through before it finished or was cut off.
#[derive(Debug, Default)]
struct PipelineProgress {
    environment_id: Option<String>,
    setup_failure: Option<Diagnostic>,
    compile: Option<StepResult>,
    test: Option<StepResult>,
    patch: Option<String>,
}

struct PipelinePlan {
    profile: ToolchainProfile,
    repository: Option<RepositoryRef>,
    test_patch: Option<String>,
    files: FileSet,
    /// Applied to the checkout instead of writing `files`.
    supplied_patch: Option<String>,
    /// Patch tasks only pass if the working tree actually changed.
    require_patch: bool,
    max_diagnostics: usize,
}

pub struct GenerationEngine {
    generator: Arc<dyn CodeGenerator>,
    lifecycle: LifecycleManager,
    config: EngineConfig,
}

impl GenerationEngine {
    pub fn new(generator: Arc<dyn CodeGenerator>, lifecycle: LifecycleManager) -> Self {
        Self::with_config(generator, lifecycle, EngineConfig::default())
    }

    pub fn with_config(
        generator: Arc<dyn CodeGenerator>,
        lifecycle: LifecycleManager,
        config: EngineConfig,
    ) -> Self {
        Self {
            generator,
            lifecycle,
            config,
        }
    }

    pub fn lifecycle(&self) -> &LifecycleManager {
        &self.lifecycle
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Toolchain for a specification: configured override, else the
    /// built-in preset, then specification-level command overrides.
    pub fn profile_for(&self, spec: &ComponentSpecification) -> ToolchainProfile {
        self.config
            .toolchains
            .get(&spec.language)
            .cloned()
            .unwrap_or_else(|| ToolchainProfile::for_language(&spec.language))
            .resolve_for(spec)
    }

    /// Run one full attempt. Never fails: every error is classified into the
    /// returned attempt.
    #[instrument(skip(self, request), fields(attempt = request.attempt_number, owner = %owner))]
    pub async fn run(&self, request: &GenerationRequest, owner: &str) -> GenerationAttempt {
        let started_at = Utc::now();
        let clock = Instant::now();

        let output = match self.generator.generate(request).await {
            Ok(output) => output,
            Err(e) => {
                warn!(error = %e, generator = self.generator.name(), "generation failed");
                let diag = Diagnostic::error(e.to_string(), DiagnosticSource::Generator);
                return failed_before_environment(
                    request,
                    None,
                    diag,
                    AttemptOutcome::GenerationFailed,
                    started_at,
                    clock,
                );
            }
        };
        self.execute(request, output, None, owner, started_at, clock).await
    }

    /// Verify a supplied patch: check out, apply, build and test. The
    /// generator is never called.
    #[instrument(skip(self, request, patch), fields(model = %model, owner = %owner))]
    pub async fn verify(
        &self,
        request: &GenerationRequest,
        patch: &str,
        model: &str,
        owner: &str,
    ) -> GenerationAttempt {
        let started_at = Utc::now();
        let clock = Instant::now();
        if patch.trim().is_empty() {
            let diag = Diagnostic::error("empty patch supplied", DiagnosticSource::Compiler);
            return failed_before_environment(
                request,
                Some(model.to_string()),
                diag,
                AttemptOutcome::CompileFailed,
                started_at,
                clock,
            );
        }
        let output = GenerationOutput {
            files: FileSet::new(),
            usage: TokenUsage::default(),
            model: model.to_string(),
        };
        self.execute(request, output, Some(patch.to_string()), owner, started_at, clock)
            .await
    }

    async fn execute(
        &self,
        request: &GenerationRequest,
        output: GenerationOutput,
        supplied_patch: Option<String>,
        owner: &str,
        started_at: chrono::DateTime<Utc>,
        clock: Instant,
    ) -> GenerationAttempt {
        let spec = &request.specification;
        let profile = self.profile_for(spec);
        let env_spec = profile.environment_spec(owner);
        let plan = Arc::new(PipelinePlan {
            profile,
            repository: spec.repository.clone(),
            test_patch: spec.test_patch.clone(),
            files: output.files.clone(),
            supplied_patch,
            require_patch: spec.target_type == TargetType::Patch && spec.repository.is_some(),
            max_diagnostics: self.config.max_diagnostics,
        });
        let progress = Arc::new(Mutex::new(PipelineProgress::default()));

        let time_limit = self.config.attempt_time_limit;
        let scoped = {
            let plan = plan.clone();
            let progress = progress.clone();
            self.lifecycle
                .with_environment(&env_spec, owner, time_limit, move |handle| {
                    run_pipeline(handle, plan, progress)
                })
                .await
        };

        let mut progress = std::mem::take(&mut *progress.lock().await);
        let outcome = match scoped {
            Err(e) => {
                warn!(error = %e, "environment provisioning failed");
                progress.compile = Some(StepResult::failed_with(Diagnostic::error(
                    e.to_string(),
                    DiagnosticSource::Provisioning,
                )));
                AttemptOutcome::ProvisioningFailed
            }
            Ok(ScopedOutcome::TimedOut { limit }) => {
                let limit_ms = limit.as_millis() as u64;
                match progress.compile.as_ref().map(StepResult::passed) {
                    Some(true) => progress.test = Some(StepResult::timed_out("test suite", limit_ms)),
                    _ => progress.compile = Some(StepResult::timed_out("attempt", limit_ms)),
                }
                AttemptOutcome::TimedOut
            }
            Ok(ScopedOutcome::Completed(Err(e))) => {
                warn!(error = %e, "sandbox failed mid-attempt");
                let diag = Diagnostic::error(e.to_string(), DiagnosticSource::Provisioning);
                progress.compile.get_or_insert_with(|| StepResult::failed_with(diag));
                AttemptOutcome::ProvisioningFailed
            }
            Ok(ScopedOutcome::Completed(Ok(()))) => classify_progress(&mut progress),
        };

        let attempt = GenerationAttempt {
            attempt_number: request.attempt_number,
            input: request.clone(),
            files_digest: output.files.digest(),
            produced_files: output.files,
            model: Some(output.model),
            compile_result: progress
                .compile
                .unwrap_or_else(StepResult::skipped),
            test_result: progress.test,
            patch: progress.patch,
            cost: AttemptCost {
                prompt_tokens: output.usage.prompt_tokens,
                completion_tokens: output.usage.completion_tokens,
                wall_time_ms: elapsed_ms(clock),
                estimated_usd: self.config.pricing.estimate(output.usage),
            },
            outcome,
            environment_id: progress.environment_id,
            started_at,
            finished_at: Utc::now(),
        };
        info!(
            outcome = %attempt.outcome,
            files = attempt.produced_files.len(),
            wall_time_ms = attempt.cost.wall_time_ms,
            "attempt finished"
        );
        attempt
    }

    /// Generate without acquiring an environment (benchmark dry runs).
    pub async fn generate(&self, request: &GenerationRequest) -> Result<GenerationOutput> {
        self.generator
            .generate(request)
            .await
            .map_err(|e| AutocoderError::Generation(e.to_string()))
    }
}

#[async_trait]
impl AttemptRunner for GenerationEngine {
    async fn run_attempt(&self, request: &GenerationRequest, owner: &str) -> GenerationAttempt {
        self.run(request, owner).await
    }

    async fn verify_patch(
        &self,
        request: &GenerationRequest,
        patch: &str,
        model: &str,
        owner: &str,
    ) -> GenerationAttempt {
        self.verify(request, patch, model, owner).await
    }

    async fn generate_only(&self, request: &GenerationRequest) -> Result<GenerationOutput> {
        self.generate(request).await
    }

    async fn abandon(&self, owner: &str) -> usize {
        self.lifecycle.release_owner(owner).await
    }
}

fn elapsed_ms(clock: Instant) -> u64 {
    clock.elapsed().as_millis() as u64
}

/// Attempt that ended before any environment was acquired.
fn failed_before_environment(
    request: &GenerationRequest,
    model: Option<String>,
    diagnostic: Diagnostic,
    outcome: AttemptOutcome,
    started_at: chrono::DateTime<Utc>,
    clock: Instant,
) -> GenerationAttempt {
    GenerationAttempt {
        attempt_number: request.attempt_number,
        input: request.clone(),
        produced_files: FileSet::new(),
        files_digest: FileSet::new().digest(),
        model,
        compile_result: StepResult::failed_with(diagnostic),
        test_result: None,
        patch: None,
        cost: AttemptCost {
            wall_time_ms: elapsed_ms(clock),
            ..AttemptCost::default()
        },
        outcome,
        environment_id: None,
        started_at,
        finished_at: Utc::now(),
    }
}

/// Outcome of a pipeline that ran to its end.
fn classify_progress(progress: &mut PipelineProgress) -> AttemptOutcome {
    if let Some(diag) = progress.setup_failure.take() {
        progress.compile = Some(StepResult::failed_with(diag));
        return AttemptOutcome::SetupFailed;
    }
    let compile_status = progress.compile.as_ref().map(|s| s.status);
    match compile_status {
        Some(StepStatus::Passed) => {}
        Some(StepStatus::TimedOut) => return AttemptOutcome::TimedOut,
        _ => return AttemptOutcome::CompileFailed,
    }
    match progress.test.as_ref().map(|s| s.status) {
        Some(StepStatus::Passed) => AttemptOutcome::Passed,
        Some(StepStatus::TimedOut) => AttemptOutcome::TimedOut,
        _ => AttemptOutcome::TestFailed,
    }
}

async fn run_pipeline(
    handle: EnvironmentHandle,
    plan: Arc<PipelinePlan>,
    progress: Arc<Mutex<PipelineProgress>>,
) -> std::result::Result<(), SandboxError> {
    progress.lock().await.environment_id = Some(handle.id().to_string());
    let step_timeout = plan.profile.step_timeout();
    let max = plan.max_diagnostics;

    if let Some(repo) = &plan.repository {
        if let Some(diag) = checkout(&handle, repo, plan.test_patch.as_deref(), step_timeout).await? {
            progress.lock().await.setup_failure = Some(diag);
            return Ok(());
        }
    }

    match &plan.supplied_patch {
        Some(patch) => {
            if let Some(step) = apply_supplied_patch(&handle, patch, step_timeout, max).await? {
                progress.lock().await.compile = Some(step);
                return Ok(());
            }
            progress.lock().await.patch = Some(patch.clone());
            debug!(env_id = %handle.id(), "supplied patch applied");
        }
        None => {
            handle.write_files(&plan.files.to_writes()).await?;
            debug!(env_id = %handle.id(), files = plan.files.len(), "files written");
        }
    }

    for command in &plan.profile.setup_commands {
        let output = handle
            .exec(&ExecRequest::shell(command.clone()).with_timeout(step_timeout))
            .await?;
        let step = classify_step(StepKind::Setup, &output, max);
        if !step.passed() {
            // Dependency install failures usually mean a bad manifest, which
            // the model can fix, so they are reported as build failures.
            progress.lock().await.compile = Some(step);
            return Ok(());
        }
    }

    let build = handle
        .exec(&ExecRequest::shell(plan.profile.build_command.clone()).with_timeout(step_timeout))
        .await?;
    let build = classify_step(StepKind::Build, &build, max);
    let built = build.passed();
    progress.lock().await.compile = Some(build);
    if !built {
        return Ok(());
    }

    let test = handle
        .exec(&ExecRequest::shell(plan.profile.test_command.clone()).with_timeout(step_timeout))
        .await?;
    progress.lock().await.test = Some(classify_step(StepKind::Test, &test, max));

    if plan.supplied_patch.is_none() {
        if let Some(patch_command) = &plan.profile.patch_command {
            let output = handle
                .exec(&ExecRequest::shell(patch_command.clone()).with_timeout(step_timeout))
                .await?;
            if output.success() && !output.stdout.trim().is_empty() {
                progress.lock().await.patch = Some(output.stdout);
            }
        }
    }

    let mut progress = progress.lock().await;
    if plan.require_patch && progress.patch.is_none() {
        if let Some(test) = progress.test.as_mut() {
            test.status = StepStatus::Failed;
            test.diagnostics.push(Diagnostic::error(
                "candidate left the repository unchanged (empty patch)",
                DiagnosticSource::TestRunner,
            ));
        }
    }
    Ok(())
}

/// `git apply`, falling back to `patch -p1`. `Some(step)` when neither applies.
async fn apply_supplied_patch(
    handle: &EnvironmentHandle,
    patch: &str,
    step_timeout: Duration,
    max: usize,
) -> std::result::Result<Option<StepResult>, SandboxError> {
    handle
        .write_files(&[FileWrite::new(CANDIDATE_PATCH_PATH, patch)])
        .await?;
    let script = format!(
        "git apply --ignore-whitespace --ignore-space-change {p} || patch -p1 --ignore-whitespace -i {p}",
        p = CANDIDATE_PATCH_PATH
    );
    let output = handle
        .exec(&ExecRequest::shell(script).with_timeout(step_timeout))
        .await?;
    if output.success() {
        return Ok(None);
    }
    let mut step = classify_step(StepKind::Build, &output, max);
    step.status = StepStatus::Failed;
    step.diagnostics.insert(
        0,
        Diagnostic::error("supplied patch did not apply", DiagnosticSource::Compiler)
            .with_evidence(tail(&output.combined(), 20)),
    );
    Ok(Some(step))
}

/// Clone, check out and apply the test patch. `Some(diagnostic)` when the
/// checkout fails. A test patch that does not apply is logged and skipped.
async fn checkout(
    handle: &EnvironmentHandle,
    repo: &RepositoryRef,
    test_patch: Option<&str>,
    step_timeout: Duration,
) -> std::result::Result<Option<Diagnostic>, SandboxError> {
    let mut script = format!("git clone --quiet --depth 50 {} .", shell_quote(&repo.url));
    if let Some(commit) = &repo.base_commit {
        script.push_str(&format!(
            " && (git checkout --quiet {c} || (git fetch --quiet origin {c} && git checkout --quiet {c}))",
            c = shell_quote(commit)
        ));
    }
    let output = handle
        .exec(&ExecRequest::shell(script).with_timeout(step_timeout))
        .await?;
    if !output.success() {
        return Ok(Some(setup_diagnostic("repository checkout failed", &output.combined(), output.timed_out)));
    }

    if let Some(patch) = test_patch {
        handle
            .write_files(&[FileWrite::new(TEST_PATCH_PATH, patch)])
            .await?;
        let output = handle
            .exec(
                &ExecRequest::shell(format!("git apply --ignore-whitespace {}", TEST_PATCH_PATH))
                    .with_timeout(step_timeout),
            )
            .await?;
        if !output.success() {
            warn!(
                env_id = %handle.id(),
                output = %tail(&output.combined(), 5),
                "test patch did not apply; continuing without it"
            );
        }
    }
    Ok(None)
}

fn setup_diagnostic(message: &str, output: &str, timed_out: bool) -> Diagnostic {
    let message = if timed_out {
        format!("{} (timed out)", message)
    } else {
        message.to_string()
    };
    Diagnostic::error(message, DiagnosticSource::Provisioning).with_evidence(tail(output, 20))
}

fn shell_quote(s: &str) -> String {
    format!("'{}'", s.replace('\'', r"'\''"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::TargetType;
    use crate::generation::fakes::ScriptedGenerator;
    use sandbox_manager::fakes::{ExecContext, ExecScript, MemoryBackend};

    fn spec() -> ComponentSpecification {
        ComponentSpecification::new("add", "add two numbers", TargetType::Function, "rust")
    }

    fn engine(backend: Arc<MemoryBackend>, generator: ScriptedGenerator) -> GenerationEngine {
        GenerationEngine::new(Arc::new(generator), LifecycleManager::new(backend))
    }

    fn files() -> FileSet {
        FileSet::new().with_file("src/lib.rs", "pub fn add(a: i32, b: i32) -> i32 { a + b }")
    }

    #[tokio::test]
    async fn test_passing_attempt_releases_environment() {
        let backend = Arc::new(MemoryBackend::new());
        let engine = engine(backend.clone(), ScriptedGenerator::always(files()));

        let attempt = engine.run(&GenerationRequest::initial(spec(), None), "p1").await;

        assert_eq!(attempt.outcome, AttemptOutcome::Passed);
        assert!(attempt.compiled());
        assert!(attempt.tests_passed());
        assert_eq!(attempt.files_digest, files().digest());
        assert_eq!(backend.created_count(), 1);
        assert!(backend.all_removed_exactly_once());
    }

    #[tokio::test]
    async fn test_compile_error_is_classified_with_diagnostics() {
        let backend = Arc::new(MemoryBackend::new());
        backend.set_exec_handler(|ctx: &ExecContext<'_>| {
            if ctx.command_line().contains("cargo build") {
                ExecScript::fail(
                    101,
                    "error[E0308]: mismatched types\n --> src/lib.rs:1:38\n",
                )
            } else {
                ExecScript::ok("")
            }
        });
        let engine = engine(backend.clone(), ScriptedGenerator::always(files()));

        let attempt = engine.run(&GenerationRequest::initial(spec(), None), "p1").await;

        assert_eq!(attempt.outcome, AttemptOutcome::CompileFailed);
        assert!(attempt.test_result.is_none());
        assert_eq!(attempt.compile_result.diagnostics[0].code.as_deref(), Some("E0308"));
        assert!(backend.all_removed_exactly_once());
    }

    #[tokio::test]
    async fn test_step_timeout_is_a_timed_out_attempt() {
        let backend = Arc::new(MemoryBackend::new());
        backend.set_exec_handler(|ctx: &ExecContext<'_>| {
            if ctx.command_line().contains("cargo test") {
                ExecScript::ok("").with_delay(Duration::from_secs(3600))
            } else {
                ExecScript::ok("")
            }
        });
        let mut config = EngineConfig::default();
        let mut profile = ToolchainProfile::rust();
        profile.step_timeout_secs = 1;
        config.toolchains.insert("rust".into(), profile);
        let engine = GenerationEngine::with_config(
            Arc::new(ScriptedGenerator::always(files())),
            LifecycleManager::new(backend.clone()),
            config,
        );

        let attempt = engine.run(&GenerationRequest::initial(spec(), None), "p1").await;

        assert_eq!(attempt.outcome, AttemptOutcome::TimedOut);
        assert!(attempt.compiled());
        assert!(attempt.diagnostics().iter().any(Diagnostic::is_timeout));
        assert!(backend.all_removed_exactly_once());
    }

    #[tokio::test]
    async fn test_provisioning_failure_is_classified_not_raised() {
        let backend = Arc::new(MemoryBackend::new());
        backend.set_fail_create(true);
        let engine = engine(backend.clone(), ScriptedGenerator::always(files()));

        let attempt = engine.run(&GenerationRequest::initial(spec(), None), "p1").await;

        assert_eq!(attempt.outcome, AttemptOutcome::ProvisioningFailed);
        assert_eq!(attempt.compile_result.diagnostics[0].source, DiagnosticSource::Provisioning);
        assert_eq!(backend.created_count(), 0);
    }

    #[tokio::test]
    async fn test_generator_failure_skips_environment() {
        let backend = Arc::new(MemoryBackend::new());
        let engine = engine(backend.clone(), ScriptedGenerator::failing("model overloaded"));

        let attempt = engine.run(&GenerationRequest::initial(spec(), None), "p1").await;

        assert_eq!(attempt.outcome, AttemptOutcome::GenerationFailed);
        assert_eq!(backend.created_count(), 0);
    }

    #[tokio::test]
    async fn test_repository_attempt_applies_test_patch_and_captures_diff() {
        let backend = Arc::new(MemoryBackend::new());
        backend.set_exec_handler(|ctx: &ExecContext<'_>| {
            if ctx.command_line().contains("git diff") {
                ExecScript::ok("diff --git a/src/lib.rs b/src/lib.rs\n")
            } else {
                ExecScript::ok("")
            }
        });
        let spec = ComponentSpecification::new("fix", "fix it", TargetType::Patch, "rust")
            .with_repository("https://github.com/acme/widgets", Some("abc123".into()))
            .with_test_patch("diff --git a/tests/t.rs b/tests/t.rs\n");
        let engine = engine(backend.clone(), ScriptedGenerator::always(files()));

        let attempt = engine.run(&GenerationRequest::initial(spec, None), "p1").await;

        assert_eq!(attempt.outcome, AttemptOutcome::Passed);
        assert!(attempt.patch.as_deref().unwrap().starts_with("diff --git"));
        let env_id = sandbox_manager::EnvironmentId::new(attempt.environment_id.clone().unwrap());
        let written = backend.files(&env_id).unwrap();
        assert!(written.contains_key("/workspace/.autocoder/test.patch"));
        assert!(written.contains_key("/workspace/src/lib.rs"));
    }

    fn patch_task() -> ComponentSpecification {
        ComponentSpecification::new("fix", "fix it", TargetType::Patch, "rust")
            .with_repository("https://github.com/acme/widgets", Some("abc123".into()))
            .with_test_patch("diff --git a/tests/t.rs b/tests/t.rs\n")
    }

    const CANDIDATE: &str = "diff --git a/src/lib.rs b/src/lib.rs\n--- a/src/lib.rs\n+++ b/src/lib.rs\n";

    #[tokio::test]
    async fn test_checkout_failure_is_a_setup_failure() {
        let backend = Arc::new(MemoryBackend::new());
        backend.set_exec_handler(|ctx: &ExecContext<'_>| {
            if ctx.command_line().contains("git clone") {
                ExecScript::fail(128, "fatal: repository not found")
            } else {
                ExecScript::ok("")
            }
        });
        let engine = engine(backend.clone(), ScriptedGenerator::always(files()));

        let attempt = engine.run(&GenerationRequest::initial(patch_task(), None), "p1").await;

        assert_eq!(attempt.outcome, AttemptOutcome::SetupFailed);
        assert!(attempt.compile_result.diagnostics[0].message.contains("checkout failed"));
        assert!(attempt.test_result.is_none());
        assert_eq!(backend.created_count(), 1);
        assert!(backend.all_removed_exactly_once());
    }

    #[tokio::test]
    async fn test_rejected_test_patch_does_not_stop_the_attempt() {
        let backend = Arc::new(MemoryBackend::new());
        backend.set_exec_handler(|ctx: &ExecContext<'_>| {
            let line = ctx.command_line();
            if line.contains("test.patch") {
                ExecScript::fail(1, "error: patch failed: tests/t.rs:1")
            } else if line.contains("git diff") {
                ExecScript::ok("diff --git a/src/lib.rs b/src/lib.rs\n")
            } else {
                ExecScript::ok("")
            }
        });
        let engine = engine(backend.clone(), ScriptedGenerator::always(files()));

        let attempt = engine.run(&GenerationRequest::initial(patch_task(), None), "p1").await;

        assert_eq!(attempt.outcome, AttemptOutcome::Passed);
        assert!(attempt.tests_passed());
    }

    #[tokio::test]
    async fn test_unchanged_repository_fails_a_patch_task() {
        let backend = Arc::new(MemoryBackend::new());
        let engine = engine(backend.clone(), ScriptedGenerator::always(files()));

        let attempt = engine.run(&GenerationRequest::initial(patch_task(), None), "p1").await;

        assert_eq!(attempt.outcome, AttemptOutcome::TestFailed);
        assert!(attempt.compiled());
        assert!(attempt.patch.is_none());
        let test = attempt.test_result.as_ref().unwrap();
        assert!(test.diagnostics.iter().any(|d| d.message.contains("empty patch")));
    }

    #[tokio::test]
    async fn test_function_target_needs_no_patch() {
        let backend = Arc::new(MemoryBackend::new());
        let engine = engine(backend, ScriptedGenerator::always(files()));

        let attempt = engine.run(&GenerationRequest::initial(spec(), None), "p1").await;

        assert_eq!(attempt.outcome, AttemptOutcome::Passed);
        assert!(attempt.patch.is_none());
    }

    #[tokio::test]
    async fn test_supplied_patch_is_applied_without_generating() {
        let backend = Arc::new(MemoryBackend::new());
        let commands = Arc::new(std::sync::Mutex::new(Vec::new()));
        let seen = commands.clone();
        backend.set_exec_handler(move |ctx: &ExecContext<'_>| {
            seen.lock().unwrap().push(ctx.command_line());
            ExecScript::ok("")
        });
        let generator = Arc::new(ScriptedGenerator::failing("not used"));
        let engine = GenerationEngine::new(generator.clone(), LifecycleManager::new(backend.clone()));

        let attempt = engine
            .verify(&GenerationRequest::initial(patch_task(), None), CANDIDATE, "gpt-x", "p1")
            .await;

        assert_eq!(attempt.outcome, AttemptOutcome::Passed);
        assert_eq!(attempt.patch.as_deref(), Some(CANDIDATE));
        assert_eq!(attempt.model.as_deref(), Some("gpt-x"));
        assert!(attempt.produced_files.is_empty());
        assert_eq!(generator.call_count(), 0);

        let env_id = sandbox_manager::EnvironmentId::new(attempt.environment_id.clone().unwrap());
        let written = backend.files(&env_id).unwrap();
        assert_eq!(
            written.get("/workspace/.autocoder/candidate.patch").map(String::as_str),
            Some(CANDIDATE)
        );
        let apply = commands
            .lock()
            .unwrap()
            .iter()
            .find(|c| c.contains("candidate.patch"))
            .cloned()
            .unwrap();
        assert!(apply.contains("git apply --ignore-whitespace --ignore-space-change"));
        assert!(apply.contains("|| patch -p1 --ignore-whitespace -i"));
        assert!(!commands.lock().unwrap().iter().any(|c| c.contains("git diff")));
    }

    #[tokio::test]
    async fn test_supplied_patch_that_does_not_apply_fails_the_build() {
        let backend = Arc::new(MemoryBackend::new());
        backend.set_exec_handler(|ctx: &ExecContext<'_>| {
            if ctx.command_line().contains("candidate.patch") {
                ExecScript::fail(1, "error: corrupt patch at line 3")
            } else {
                ExecScript::ok("")
            }
        });
        let engine = engine(backend.clone(), ScriptedGenerator::always(files()));

        let attempt = engine
            .verify(&GenerationRequest::initial(patch_task(), None), CANDIDATE, "gpt-x", "p1")
            .await;

        assert_eq!(attempt.outcome, AttemptOutcome::CompileFailed);
        assert_eq!(attempt.compile_result.diagnostics[0].message, "supplied patch did not apply");
        assert!(attempt.test_result.is_none());
        assert!(backend.all_removed_exactly_once());
    }

    #[tokio::test]
    async fn test_empty_supplied_patch_skips_environment() {
        let backend = Arc::new(MemoryBackend::new());
        let engine = engine(backend.clone(), ScriptedGenerator::always(files()));

        let attempt = engine
            .verify(&GenerationRequest::initial(patch_task(), None), "  \n", "gpt-x", "p1")
            .await;

        assert_eq!(attempt.outcome, AttemptOutcome::CompileFailed);
        assert!(attempt.compile_result.diagnostics[0].message.contains("empty patch"));
        assert_eq!(backend.created_count(), 0);
    }

    #[tokio::test]
    async fn test_cost_uses_pricing() {
        let pricing = TokenPricing::default();
        let usd = pricing.estimate(TokenUsage {
            prompt_tokens: 1_000_000,
            completion_tokens: 0,
        });
        assert!((usd - 3.0).abs() < 1e-9);
    }
}
