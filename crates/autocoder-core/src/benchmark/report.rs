//! Per-instance results and the aggregate benchmark report.

use std::collections::BTreeMap;
use std::fmt::{self, Write as _};

use chrono::{DateTime, Utc};
use serde::Serialize;

use super::dataset::BenchmarkTask;
use crate::domain::{AttemptCost, GiveUpReason, Phase, Project, ProjectId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum InstanceErrorKind {
    Timeout,
    HealingExhausted,
    Provisioning,
    Generation,
    Internal,
}

impl InstanceErrorKind {
    pub fn as_str(self) -> &'static str {
        match self {
            InstanceErrorKind::Timeout => "timeout",
            InstanceErrorKind::HealingExhausted => "healing_exhausted",
            InstanceErrorKind::Provisioning => "provisioning",
            InstanceErrorKind::Generation => "generation",
            InstanceErrorKind::Internal => "internal",
        }
    }
}

impl fmt::Display for InstanceErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct InstanceError {
    pub kind: InstanceErrorKind,
    pub message: String,
}

/// Write-once result for one dataset entry.
///
/// Fields are private; `resolved` is derived in the constructors so it can
/// only be true when both compilation and tests succeeded.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BenchmarkInstanceResult {
    instance_id: String,
    repo_url: String,
    project_id: Option<ProjectId>,
    expected_criteria: String,
    generated_patch: Option<String>,
    /// Model that produced the candidate, or the label of a supplied patch.
    model: Option<String>,
    resolved: bool,
    compilation_success: bool,
    tests_passed: bool,
    execution_time_ms: u64,
    attempts: usize,
    healing_attempts: u32,
    final_phase: Option<Phase>,
    cost: AttemptCost,
    error: Option<InstanceError>,
}

fn expected_criteria(task: &BenchmarkTask) -> String {
    match &task.test_patch {
        Some(_) => "tests added by the task's test patch pass".to_string(),
        None => "build and test commands succeed".to_string(),
    }
}

impl BenchmarkInstanceResult {
    fn build(
        task: &BenchmarkTask,
        project: Option<&Project>,
        compilation_success: bool,
        tests_passed: bool,
        execution_time_ms: u64,
        error: Option<InstanceError>,
    ) -> Self {
        Self {
            instance_id: task.instance_id.clone(),
            repo_url: task.repo_url.clone(),
            project_id: project.map(Project::id),
            expected_criteria: expected_criteria(task),
            generated_patch: project.and_then(|p| p.last_attempt()).and_then(|a| a.patch.clone()),
            model: project.and_then(|p| p.last_attempt()).and_then(|a| a.model.clone()),
            resolved: compilation_success && tests_passed && error.is_none(),
            compilation_success,
            tests_passed,
            execution_time_ms,
            attempts: project.map(|p| p.history().len()).unwrap_or(0),
            healing_attempts: project.map(Project::healing_attempts).unwrap_or(0),
            final_phase: project.map(Project::phase),
            cost: project.map(Project::total_cost).unwrap_or_default(),
            error,
        }
    }

    /// Result for a project the workflow drove to a terminal phase.
    ///
    /// A rejected supplied patch is unresolved but not an error.
    pub fn from_project(task: &BenchmarkTask, project: &Project, execution_time_ms: u64) -> Self {
        let last = project.last_attempt();
        let tests_passed = project.phase() == Phase::Complete
            && last.map(|a| a.tests_passed()).unwrap_or(false);
        let compilation_success = project.ever_compiled();

        let error = match project.phase() {
            Phase::Failed => {
                let message = project
                    .result()
                    .error
                    .clone()
                    .unwrap_or_else(|| "project failed".to_string());
                let kind = match project.result().failure {
                    Some(GiveUpReason::Unrecoverable) => Some(InstanceErrorKind::Provisioning),
                    Some(GiveUpReason::DeadlineExceeded) => Some(InstanceErrorKind::Timeout),
                    Some(GiveUpReason::Rejected) => None,
                    Some(GiveUpReason::BudgetExhausted) | None => {
                        Some(InstanceErrorKind::HealingExhausted)
                    }
                };
                kind.map(|kind| InstanceError { kind, message })
            }
            Phase::Complete => None,
            other => Some(InstanceError {
                kind: InstanceErrorKind::Internal,
                message: format!("project stopped in non-terminal phase {}", other),
            }),
        };

        Self::build(task, Some(project), compilation_success, tests_passed, execution_time_ms, error)
    }

    /// Result for an instance that errored; `project` carries partial progress.
    pub fn from_error(
        task: &BenchmarkTask,
        project: Option<&Project>,
        kind: InstanceErrorKind,
        message: impl Into<String>,
        execution_time_ms: u64,
    ) -> Self {
        let compilation_success = project.map(Project::ever_compiled).unwrap_or(false);
        Self::build(
            task,
            project,
            compilation_success,
            false,
            execution_time_ms,
            Some(InstanceError {
                kind,
                message: message.into(),
            }),
        )
    }

    /// Dry runs skip verification and are never resolved.
    pub fn dry_run(task: &BenchmarkTask, project: &Project, execution_time_ms: u64) -> Self {
        Self::build(task, Some(project), false, false, execution_time_ms, None)
    }

    pub fn instance_id(&self) -> &str {
        &self.instance_id
    }

    pub fn project_id(&self) -> Option<ProjectId> {
        self.project_id
    }

    pub fn generated_patch(&self) -> Option<&str> {
        self.generated_patch.as_deref()
    }

    pub fn model(&self) -> Option<&str> {
        self.model.as_deref()
    }

    /// Phase the project ended in, if a project was created.
    pub fn final_phase(&self) -> Option<Phase> {
        self.final_phase
    }

    pub fn resolved(&self) -> bool {
        self.resolved
    }

    pub fn compilation_success(&self) -> bool {
        self.compilation_success
    }

    pub fn tests_passed(&self) -> bool {
        self.tests_passed
    }

    pub fn execution_time_ms(&self) -> u64 {
        self.execution_time_ms
    }

    pub fn healing_attempts(&self) -> u32 {
        self.healing_attempts
    }

    pub fn attempts(&self) -> usize {
        self.attempts
    }

    pub fn cost(&self) -> AttemptCost {
        self.cost
    }

    pub fn error(&self) -> Option<&InstanceError> {
        self.error.as_ref()
    }

    pub fn error_kind(&self) -> Option<InstanceErrorKind> {
        self.error.as_ref().map(|e| e.kind)
    }
}

fn rate(numerator: usize, denominator: usize) -> f64 {
    if denominator == 0 {
        0.0
    } else {
        numerator as f64 / denominator as f64
    }
}

/// Aggregate of one benchmark run. Rates are over all instances, errored
/// ones included.
#[derive(Debug, Clone, Serialize)]
pub struct BenchmarkReport {
    pub run_id: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub dry_run: bool,
    pub total: usize,
    /// Instances that finished without an error.
    pub completed: usize,
    pub errored: usize,
    pub resolved: usize,
    pub resolution_rate: f64,
    pub compilation_rate: f64,
    pub test_pass_rate: f64,
    pub average_execution_ms: f64,
    pub total_cost: AttemptCost,
    pub errors_by_kind: BTreeMap<InstanceErrorKind, usize>,
    pub instances: Vec<BenchmarkInstanceResult>,
}

impl BenchmarkReport {
    pub fn new(
        run_id: impl Into<String>,
        started_at: DateTime<Utc>,
        dry_run: bool,
        mut instances: Vec<BenchmarkInstanceResult>,
    ) -> Self {
        instances.sort_by(|a, b| a.instance_id.cmp(&b.instance_id));

        let total = instances.len();
        let errored = instances.iter().filter(|i| i.error.is_some()).count();
        let resolved = instances.iter().filter(|i| i.resolved).count();
        let compiled = instances.iter().filter(|i| i.compilation_success).count();
        let tests_passed = instances.iter().filter(|i| i.tests_passed).count();
        let total_ms: u64 = instances.iter().map(|i| i.execution_time_ms).sum();

        let mut total_cost = AttemptCost::default();
        let mut errors_by_kind = BTreeMap::new();
        for instance in &instances {
            total_cost += instance.cost;
            if let Some(kind) = instance.error_kind() {
                *errors_by_kind.entry(kind).or_insert(0) += 1;
            }
        }

        Self {
            run_id: run_id.into(),
            started_at,
            finished_at: Utc::now(),
            dry_run,
            total,
            completed: total - errored,
            errored,
            resolved,
            resolution_rate: rate(resolved, total),
            compilation_rate: rate(compiled, total),
            test_pass_rate: rate(tests_passed, total),
            average_execution_ms: if total == 0 {
                0.0
            } else {
                total_ms as f64 / total as f64
            },
            total_cost,
            errors_by_kind,
            instances,
        }
    }

    pub fn instance(&self, instance_id: &str) -> Option<&BenchmarkInstanceResult> {
        self.instances.iter().find(|i| i.instance_id == instance_id)
    }

    pub fn render_markdown(&self) -> String {
        let mut out = String::new();
        let _ = writeln!(out, "# Benchmark run {}", self.run_id);
        let _ = writeln!(out);
        if self.dry_run {
            let _ = writeln!(out, "_Dry run: verification skipped._\n");
        }
        let _ = writeln!(out, "| Metric | Value |");
        let _ = writeln!(out, "|--------|-------|");
        let _ = writeln!(out, "| Instances | {} |", self.total);
        let _ = writeln!(out, "| Completed | {} |", self.completed);
        let _ = writeln!(out, "| Errored | {} |", self.errored);
        let _ = writeln!(out, "| Resolved | {} ({:.1}%) |", self.resolved, self.resolution_rate * 100.0);
        let _ = writeln!(out, "| Compilation rate | {:.1}% |", self.compilation_rate * 100.0);
        let _ = writeln!(out, "| Test pass rate | {:.1}% |", self.test_pass_rate * 100.0);
        let _ = writeln!(out, "| Mean execution | {:.0} ms |", self.average_execution_ms);
        let _ = writeln!(out, "| Estimated cost | ${:.4} |", self.total_cost.estimated_usd);

        if !self.errors_by_kind.is_empty() {
            let _ = writeln!(out, "\n## Errors\n");
            for (kind, count) in &self.errors_by_kind {
                let _ = writeln!(out, "- {}: {}", kind, count);
            }
        }

        let _ = writeln!(out, "\n## Instances\n");
        let _ = writeln!(out, "| Instance | Resolved | Compiled | Tests | Attempts | Time (ms) | Error |");
        let _ = writeln!(out, "|----------|----------|----------|-------|----------|-----------|-------|");
        for i in &self.instances {
            let _ = writeln!(
                out,
                "| {} | {} | {} | {} | {} | {} | {} |",
                i.instance_id,
                yes_no(i.resolved),
                yes_no(i.compilation_success),
                yes_no(i.tests_passed),
                i.attempts,
                i.execution_time_ms,
                i.error_kind().map(InstanceErrorKind::as_str).unwrap_or("-"),
            );
        }
        out
    }
}

fn yes_no(b: bool) -> &'static str {
    if b {
        "yes"
    } else {
        "no"
    }
}
