//! Structured lifecycle events for projects and benchmark runs.
//!
//! Every event is an `info!` (or `warn!`) record with an `event` field, so a
//! JSON log pipeline can filter on `event = "project.finished"` and friends.

use tracing::{info, warn};

use crate::domain::{AttemptOutcome, Phase, ProjectId};

/// Span carrying `project_id` for everything a project run logs.
///
/// Attach it with `tracing::Instrument` so it survives `.await` points:
///
/// ```ignore
/// drive(project).instrument(project_span(id, name)).await
/// ```
pub fn project_span(project_id: ProjectId, name: &str) -> tracing::Span {
    tracing::info_span!("autocoder.project", project_id = %project_id, name = %name)
}

/// RAII guard that enters a project span in synchronous code.
pub struct ProjectSpan {
    _span: tracing::span::EnteredSpan,
}

impl ProjectSpan {
    pub fn enter(project_id: ProjectId, name: &str) -> Self {
        Self {
            _span: project_span(project_id, name).entered(),
        }
    }
}

pub fn emit_project_submitted(project_id: ProjectId, name: &str, language: &str) {
    info!(event = "project.submitted", project_id = %project_id, name = %name, language = %language);
}

pub fn emit_phase_changed(project_id: ProjectId, from: Phase, to: Phase, reason: &str) {
    info!(
        event = "project.phase_changed",
        project_id = %project_id,
        from = %from,
        to = %to,
        reason = %reason,
    );
}

pub fn emit_attempt_finished(
    project_id: ProjectId,
    attempt: u32,
    outcome: AttemptOutcome,
    wall_time_ms: u64,
) {
    info!(
        event = "attempt.finished",
        project_id = %project_id,
        attempt = attempt,
        outcome = %outcome,
        wall_time_ms = wall_time_ms,
    );
}

pub fn emit_project_finished(project_id: ProjectId, phase: Phase, healing_attempts: u32, attempts: usize) {
    info!(
        event = "project.finished",
        project_id = %project_id,
        phase = %phase,
        healing_attempts = healing_attempts,
        attempts = attempts,
    );
}

/// Research failures are not fatal; the phase continues without context.
pub fn emit_research_failed(project_id: ProjectId, error: &dyn std::fmt::Display) {
    warn!(event = "project.research_failed", project_id = %project_id, error = %error);
}

pub fn emit_instance_finished(run_id: &str, instance_id: &str, resolved: bool, error_kind: Option<&str>, execution_ms: u64) {
    info!(
        event = "benchmark.instance_finished",
        run_id = %run_id,
        instance_id = %instance_id,
        resolved = resolved,
        error = error_kind.unwrap_or("none"),
        execution_ms = execution_ms,
    );
}

pub fn emit_benchmark_finished(run_id: &str, total: usize, resolved: usize, resolution_rate: f64, duration_ms: u64) {
    info!(
        event = "benchmark.finished",
        run_id = %run_id,
        total = total,
        resolved = resolved,
        resolution_rate = resolution_rate,
        duration_ms = duration_ms,
    );
}

pub fn emit_artifact_error(run_id: &str, error: &dyn std::fmt::Display) {
    warn!(event = "benchmark.artifact_error", run_id = %run_id, error = %error);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_project_span_create() {
        let _span = ProjectSpan::enter(ProjectId::new(), "add");
    }
}
