//! Project workflow state machine.
//!
//! The only place that decides retry policy. Phases run strictly in
//! sequence; each transition is validated and logged on the project.

use std::sync::Arc;

use tracing::{debug, instrument, warn, Instrument};

use super::policy::{GiveUpReason, HealingDecision, HealingPolicy};
use super::research::{ContextResearcher, NoopResearcher};
use super::runner::AttemptRunner;
use crate::domain::{
    AttemptOutcome, AutocoderError, ComponentSpecification, GenerationRequest, Phase, Project,
    Result,
};
use crate::obs;

pub struct WorkflowMachine {
    runner: Arc<dyn AttemptRunner>,
    researcher: Arc<dyn ContextResearcher>,
    policy: HealingPolicy,
}

impl WorkflowMachine {
    pub fn new(runner: Arc<dyn AttemptRunner>, policy: HealingPolicy) -> Self {
        Self {
            runner,
            researcher: Arc::new(NoopResearcher),
            policy,
        }
    }

    pub fn with_researcher(mut self, researcher: Arc<dyn ContextResearcher>) -> Self {
        self.researcher = researcher;
        self
    }

    pub fn runner(&self) -> &Arc<dyn AttemptRunner> {
        &self.runner
    }

    pub fn policy(&self) -> &HealingPolicy {
        &self.policy
    }

    /// Validate a specification and create an idle project for it.
    pub fn create_project(&self, spec: ComponentSpecification) -> Result<Project> {
        spec.validate()?;
        let project = Project::new(spec, self.policy.max_healing_attempts);
        let _span = obs::ProjectSpan::enter(project.id(), project.name());
        obs::emit_project_submitted(project.id(), project.name(), &project.specification().language);
        Ok(project)
    }

    /// Interactive entry point: specification in, terminal project out.
    #[instrument(skip(self, spec), fields(name = %spec.name))]
    pub async fn submit(&self, spec: ComponentSpecification) -> Result<Project> {
        let mut project = self.create_project(spec)?;
        self.drive(&mut project).await?;
        Ok(project)
    }

    /// Drive a project to `complete` or `failed`.
    ///
    /// Errors only on invariant violations (illegal transitions); every
    /// attempt failure is handled by the healing loop.
    pub async fn drive(&self, project: &mut Project) -> Result<()> {
        let span = obs::project_span(project.id(), project.name());
        self.drive_inner(project).instrument(span).await
    }

    async fn drive_inner(&self, project: &mut Project) -> Result<()> {
        if project.is_terminal() {
            return Ok(());
        }

        if project.phase() == Phase::Idle {
            self.transition(project, Phase::Researching, "submitted")?;
        }
        if project.phase() == Phase::Researching {
            self.research(project).await?;
            self.transition(project, Phase::Developing, "context gathered")?;
        }
        if project.phase() == Phase::Healing {
            self.transition(project, Phase::Developing, "resuming healing round")?;
        }

        let owner = project.id().to_string();
        loop {
            let request = next_request(project);
            debug!(attempt = request.attempt_number, repair = request.is_repair(), "starting attempt");
            let attempt = self.runner.run_attempt(&request, &owner).await;
            obs::emit_attempt_finished(
                project.id(),
                attempt.attempt_number,
                attempt.outcome,
                attempt.cost.wall_time_ms,
            );

            let compiled = attempt.compiled();
            let passed = attempt.outcome.is_success();
            let outcome = attempt.outcome;
            let decision = self.policy.decide(project, &attempt);
            project.record_attempt(attempt)?;

            if compiled {
                self.transition(project, Phase::Testing, "build passed")?;
            }
            if passed {
                project.seal_result(Phase::Complete, None)?;
                self.transition(project, Phase::Complete, "tests passed")?;
                break;
            }

            match decision {
                HealingDecision::Heal { delay } => {
                    self.transition(project, Phase::Healing, &format!("attempt {}", outcome))?;
                    let round = project.begin_healing()?;
                    project.log(format!("healing round {} after {}ms", round, delay.as_millis()));
                    if !delay.is_zero() {
                        tokio::time::sleep(delay).await;
                    }
                    self.transition(project, Phase::Developing, "retry with diagnostics")?;
                }
                HealingDecision::GiveUp { reason } => {
                    let error = give_up_error(project, reason);
                    self.fail(project, reason, &error)?;
                    break;
                }
            }
        }

        emit_finished(project);
        Ok(())
    }

    /// Verify a supplied patch in one attempt. There is no generation and no
    /// healing: the project ends `complete` if the patch passes, otherwise
    /// `failed`.
    pub async fn verify(&self, project: &mut Project, patch: &str, model: &str) -> Result<()> {
        let span = obs::project_span(project.id(), project.name());
        self.verify_inner(project, patch, model).instrument(span).await
    }

    async fn verify_inner(&self, project: &mut Project, patch: &str, model: &str) -> Result<()> {
        if project.is_terminal() {
            return Ok(());
        }
        if project.phase() == Phase::Idle {
            self.transition(project, Phase::Researching, "submitted")?;
        }
        if project.phase() == Phase::Researching {
            self.transition(project, Phase::Developing, "supplied patch")?;
        }

        let owner = project.id().to_string();
        let request = GenerationRequest::initial(project.specification().clone(), None);
        let attempt = self.runner.verify_patch(&request, patch, model, &owner).await;
        obs::emit_attempt_finished(
            project.id(),
            attempt.attempt_number,
            attempt.outcome,
            attempt.cost.wall_time_ms,
        );

        let compiled = attempt.compiled();
        let passed = attempt.outcome.is_success();
        let outcome = attempt.outcome;
        project.record_attempt(attempt)?;

        if compiled && project.phase() == Phase::Developing {
            self.transition(project, Phase::Testing, "build passed")?;
        }
        if passed {
            project.seal_result(Phase::Complete, None)?;
            self.transition(project, Phase::Complete, "tests passed")?;
        } else {
            let reason = match outcome {
                AttemptOutcome::SetupFailed | AttemptOutcome::ProvisioningFailed => {
                    GiveUpReason::Unrecoverable
                }
                _ => GiveUpReason::Rejected,
            };
            let error = give_up_error(project, reason);
            self.fail(project, reason, &error)?;
        }

        emit_finished(project);
        Ok(())
    }

    /// Force a live project to `failed`, for example when its deadline
    /// expired mid-attempt. Terminal projects are left as they are.
    pub fn terminate(
        &self,
        project: &mut Project,
        reason: GiveUpReason,
        error: &AutocoderError,
    ) -> Result<()> {
        if project.is_terminal() {
            return Ok(());
        }
        self.fail(project, reason, error)?;
        warn!(project_id = %project.id(), reason = reason.as_str(), error = %error, "project terminated");
        emit_finished(project);
        Ok(())
    }

    fn fail(&self, project: &mut Project, reason: GiveUpReason, error: &AutocoderError) -> Result<()> {
        let from = project.fail(reason, error.to_string())?;
        obs::emit_phase_changed(project.id(), from, Phase::Failed, error.kind());
        Ok(())
    }

    async fn research(&self, project: &mut Project) -> Result<()> {
        let spec = project.specification();
        if spec.context_refs.is_empty() {
            debug!("no context references; research skipped");
            return Ok(());
        }
        match self.researcher.research(spec).await {
            Ok(context) => project.set_research_context(context),
            Err(e) => {
                obs::emit_research_failed(project.id(), &e);
                project.log(format!("research failed: {}", e));
                Ok(())
            }
        }
    }

    fn transition(&self, project: &mut Project, to: Phase, reason: &str) -> Result<()> {
        let from = project.transition(to, reason)?;
        obs::emit_phase_changed(project.id(), from, to, reason);
        Ok(())
    }
}

fn emit_finished(project: &Project) {
    obs::emit_project_finished(
        project.id(),
        project.phase(),
        project.healing_attempts(),
        project.history().len(),
    );
}

fn give_up_error(project: &Project, reason: GiveUpReason) -> AutocoderError {
    let last = project.last_attempt();
    let headline = last.and_then(|a| a.headline());
    match reason {
        GiveUpReason::BudgetExhausted => AutocoderError::HealingExhausted {
            attempts: project.healing_attempts(),
        },
        GiveUpReason::Unrecoverable => AutocoderError::Provisioning(
            headline.unwrap_or_else(|| "environment unavailable".to_string()),
        ),
        GiveUpReason::DeadlineExceeded => AutocoderError::Timeout {
            context: headline.unwrap_or_else(|| "attempt".to_string()),
            limit_ms: last.map(|a| a.cost.wall_time_ms).unwrap_or(0),
        },
        GiveUpReason::Rejected => AutocoderError::TestFailure(
            headline.unwrap_or_else(|| "supplied patch failed verification".to_string()),
        ),
    }
}

/// The first attempt gets the bare specification; later attempts carry the
/// previous attempt's diagnostics and files.
fn next_request(project: &Project) -> GenerationRequest {
    let spec = project.specification().clone();
    let context = project.research_context().map(str::to_string);
    match project.last_attempt() {
        None => GenerationRequest::initial(spec, context),
        Some(last) => GenerationRequest::repair(
            spec,
            context,
            project.history().len() as u32 + 1,
            last.diagnostics(),
            last.produced_files.clone(),
        ),
    }
}
