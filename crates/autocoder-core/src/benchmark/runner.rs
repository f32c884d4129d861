//! Benchmark runner: replay repair tasks through the workflow machine under a
//! concurrency bound and per-instance deadlines. In predictions mode the
//! candidate patches come from a file and are only verified.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tracing::{info, instrument, warn};

use super::counters::BenchmarkCounters;
use super::dataset::{load_dataset, load_predictions, BenchmarkTask, DatasetFilter, Prediction};
use super::report::{BenchmarkInstanceResult, BenchmarkReport, InstanceErrorKind};
use crate::artifacts::{artifact_name, ArtifactStore};
use crate::domain::{AutocoderError, GenerationRequest, GiveUpReason, Project, Result};
use crate::obs;
use crate::workflow::WorkflowMachine;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BenchmarkOptions {
    /// Keys the artifact directory. Generated from the start time if absent.
    pub run_id: Option<String>,
    pub max_parallel_instances: usize,
    pub instance_timeout: Duration,
    pub retain_artifacts: bool,
    /// Generate only; skip provisioning, build and test.
    pub dry_run: bool,
    pub filter: DatasetFilter,
}

impl Default for BenchmarkOptions {
    fn default() -> Self {
        Self {
            run_id: None,
            max_parallel_instances: 4,
            instance_timeout: Duration::from_secs(1_800),
            retain_artifacts: true,
            dry_run: false,
            filter: DatasetFilter::default(),
        }
    }
}

impl BenchmarkOptions {
    fn validate(&self) -> Result<()> {
        if self.max_parallel_instances == 0 {
            return Err(AutocoderError::Config(
                "max_parallel_instances must be at least 1".to_string(),
            ));
        }
        if self.instance_timeout.is_zero() {
            return Err(AutocoderError::Config(
                "instance_timeout must be positive".to_string(),
            ));
        }
        Ok(())
    }

    fn resolved_run_id(&self) -> String {
        self.run_id
            .clone()
            .unwrap_or_else(|| format!("run-{}", Utc::now().format("%Y%m%dT%H%M%S%.3fZ")))
    }
}

/// What one worker hands back: the result and the project, if one was made.
type InstanceOutput = (BenchmarkInstanceResult, Option<Project>);

pub struct BenchmarkRunner {
    machine: Arc<WorkflowMachine>,
    artifacts: Option<ArtifactStore>,
}

impl BenchmarkRunner {
    pub fn new(machine: Arc<WorkflowMachine>) -> Self {
        Self {
            machine,
            artifacts: None,
        }
    }

    pub fn with_artifacts(mut self, store: ArtifactStore) -> Self {
        self.artifacts = Some(store);
        self
    }

    /// Load, filter and run a dataset file.
    pub async fn run_dataset(&self, path: &Path, options: BenchmarkOptions) -> Result<BenchmarkReport> {
        let tasks = load_dataset(path)?;
        self.run(tasks, options).await
    }

    /// Load a dataset and a predictions file, then verify the predictions.
    pub async fn evaluate_predictions_file(
        &self,
        dataset: &Path,
        predictions: &Path,
        options: BenchmarkOptions,
    ) -> Result<BenchmarkReport> {
        let tasks = load_dataset(dataset)?;
        let predictions = load_predictions(predictions)?;
        self.evaluate_predictions(tasks, predictions, options).await
    }

    /// Verify externally produced patches against their tasks: apply, build
    /// and test once per prediction, no generation and no healing. Tasks
    /// without a prediction are not run; predictions without a task are
    /// logged and skipped.
    pub async fn evaluate_predictions(
        &self,
        tasks: Vec<BenchmarkTask>,
        predictions: Vec<Prediction>,
        options: BenchmarkOptions,
    ) -> Result<BenchmarkReport> {
        if options.dry_run {
            return Err(AutocoderError::Config(
                "dry_run cannot be combined with predictions".to_string(),
            ));
        }
        let mut by_id: HashMap<String, Prediction> = predictions
            .into_iter()
            .map(|p| (p.instance_id.clone(), p))
            .collect();
        let mut selected = Vec::new();
        for task in tasks {
            if let Some(prediction) = by_id.remove(&task.instance_id) {
                selected.push((task, Some(prediction)));
            }
        }
        for instance_id in by_id.keys() {
            warn!(instance_id = %instance_id, "prediction has no matching task; skipped");
        }
        self.execute(selected, options).await
    }

    /// Batch entry point. Returns a report however many instances fail;
    /// only invalid options are an error.
    pub async fn run(&self, tasks: Vec<BenchmarkTask>, options: BenchmarkOptions) -> Result<BenchmarkReport> {
        let tasks = tasks.into_iter().map(|task| (task, None)).collect();
        self.execute(tasks, options).await
    }

    #[instrument(skip(self, tasks, options), fields(tasks = tasks.len()))]
    async fn execute(
        &self,
        mut tasks: Vec<(BenchmarkTask, Option<Prediction>)>,
        options: BenchmarkOptions,
    ) -> Result<BenchmarkReport> {
        options.validate()?;
        let run_id = options.resolved_run_id();
        tasks.retain(|(task, _)| options.filter.matches(task));
        if let Some(limit) = options.filter.limit {
            tasks.truncate(limit);
        }
        let predictions = tasks.iter().filter(|(_, p)| p.is_some()).count();
        let started_at = Utc::now();
        let clock = Instant::now();
        info!(
            run_id = %run_id,
            instances = tasks.len(),
            parallel = options.max_parallel_instances,
            timeout_ms = options.instance_timeout.as_millis() as u64,
            dry_run = options.dry_run,
            predictions = predictions,
            "benchmark started"
        );

        let semaphore = Arc::new(Semaphore::new(options.max_parallel_instances));
        let counters = Arc::new(BenchmarkCounters::new());

        let mut pending: Vec<(BenchmarkTask, Option<String>, JoinHandle<InstanceOutput>)> =
            Vec::with_capacity(tasks.len());
        for (task, prediction) in tasks {
            // The project is created up front so its owner id survives a
            // panicking worker and its environments can still be released.
            let project = match self.machine.create_project(task.to_specification()) {
                Ok(project) => project,
                Err(e) => {
                    let result = BenchmarkInstanceResult::from_error(
                        &task,
                        None,
                        InstanceErrorKind::Internal,
                        e.to_string(),
                        0,
                    );
                    let handle = tokio::spawn(async move { (result, None) });
                    pending.push((task, None, handle));
                    continue;
                }
            };
            let owner = project.id().to_string();
            let handle = tokio::spawn(run_instance(
                self.machine.clone(),
                semaphore.clone(),
                counters.clone(),
                task.clone(),
                project,
                prediction,
                options.instance_timeout,
                options.dry_run,
            ));
            pending.push((task, Some(owner), handle));
        }

        let mut results = Vec::with_capacity(pending.len());
        let mut projects = Vec::new();
        for (task, owner, handle) in pending {
            let (result, project) = match handle.await {
                Ok(output) => output,
                Err(join_error) => {
                    let message = if join_error.is_panic() {
                        "instance panicked".to_string()
                    } else {
                        format!("instance task failed: {}", join_error)
                    };
                    warn!(instance_id = %task.instance_id, error = %message, "benchmark instance aborted");
                    if let Some(owner) = &owner {
                        counters.add_released(self.machine.runner().abandon(owner).await);
                    }
                    counters.inc_errored();
                    (
                        BenchmarkInstanceResult::from_error(&task, None, InstanceErrorKind::Internal, message, 0),
                        None,
                    )
                }
            };
            obs::emit_instance_finished(
                &run_id,
                result.instance_id(),
                result.resolved(),
                result.error_kind().map(InstanceErrorKind::as_str),
                result.execution_time_ms(),
            );
            if let Some(project) = project {
                projects.push(project);
            }
            results.push(result);
        }

        let report = BenchmarkReport::new(run_id.clone(), started_at, options.dry_run, results);
        counters.flush(&run_id);
        obs::emit_benchmark_finished(
            &run_id,
            report.total,
            report.resolved,
            report.resolution_rate,
            clock.elapsed().as_millis() as u64,
        );

        if options.retain_artifacts {
            if let Some(store) = &self.artifacts {
                self.retain(store, &report, &projects);
            }
        }
        Ok(report)
    }

    /// Best-effort: artifact failures are logged, never fatal to the run.
    fn retain(&self, store: &ArtifactStore, report: &BenchmarkReport, projects: &[Project]) {
        let run_id = &report.run_id;
        for instance in &report.instances {
            if let Some(patch) = instance.generated_patch() {
                let name = format!("patches/{}.diff", artifact_name(instance.instance_id()));
                if let Err(e) = store.write_text(run_id, &name, patch) {
                    obs::emit_artifact_error(run_id, &e);
                }
            }
        }
        for project in projects {
            let name = format!("projects/{}.json", project.id());
            if let Err(e) = store.write_json(run_id, &name, project) {
                obs::emit_artifact_error(run_id, &e);
            }
        }
        if let Err(e) = store.write_json(run_id, "report.json", report) {
            obs::emit_artifact_error(run_id, &e);
        }
        if let Err(e) = store.write_text(run_id, "summary.md", &report.render_markdown()) {
            obs::emit_artifact_error(run_id, &e);
        }
        info!(run_id = %run_id, dir = %store.run_dir(run_id).display(), "artifacts retained");
    }
}

async fn run_instance(
    machine: Arc<WorkflowMachine>,
    semaphore: Arc<Semaphore>,
    counters: Arc<BenchmarkCounters>,
    task: BenchmarkTask,
    mut project: Project,
    prediction: Option<Prediction>,
    timeout: Duration,
    dry_run: bool,
) -> InstanceOutput {
    let _permit = match semaphore.acquire_owned().await {
        Ok(permit) => permit,
        Err(e) => {
            counters.inc_errored();
            let result = BenchmarkInstanceResult::from_error(
                &task,
                Some(&project),
                InstanceErrorKind::Internal,
                format!("worker pool closed: {}", e),
                0,
            );
            return (result, Some(project));
        }
    };
    counters.inc_started();
    let clock = Instant::now();
    let owner = project.id().to_string();

    let result = if dry_run {
        let request = GenerationRequest::initial(project.specification().clone(), None);
        match tokio::time::timeout(timeout, machine.runner().generate_only(&request)).await {
            Ok(Ok(_output)) => BenchmarkInstanceResult::dry_run(&task, &project, elapsed_ms(clock)),
            Ok(Err(e)) => BenchmarkInstanceResult::from_error(
                &task,
                Some(&project),
                InstanceErrorKind::Generation,
                e.to_string(),
                elapsed_ms(clock),
            ),
            Err(_) => BenchmarkInstanceResult::from_error(
                &task,
                Some(&project),
                InstanceErrorKind::Timeout,
                format!("generation exceeded {}ms", timeout.as_millis()),
                elapsed_ms(clock),
            ),
        }
    } else {
        let work = async {
            match &prediction {
                Some(p) => machine.verify(&mut project, &p.model_patch, &p.model_name).await,
                None => machine.drive(&mut project).await,
            }
        };
        match tokio::time::timeout(timeout, work).await {
            Ok(Ok(())) => BenchmarkInstanceResult::from_project(&task, &project, elapsed_ms(clock)),
            Ok(Err(e)) => {
                counters.add_released(machine.runner().abandon(&owner).await);
                if let Err(close) = machine.terminate(&mut project, GiveUpReason::Unrecoverable, &e) {
                    warn!(instance_id = %task.instance_id, error = %close, "could not close project");
                }
                BenchmarkInstanceResult::from_error(
                    &task,
                    Some(&project),
                    InstanceErrorKind::Internal,
                    e.to_string(),
                    elapsed_ms(clock),
                )
            }
            Err(_) => {
                // The drive future is gone; tear down whatever it still held
                // before the permit goes back to the pool.
                let released = machine.runner().abandon(&owner).await;
                counters.add_released(released);
                counters.inc_timed_out();
                warn!(
                    instance_id = %task.instance_id,
                    released = released,
                    limit_ms = timeout.as_millis() as u64,
                    "instance timed out"
                );
                let deadline = AutocoderError::Timeout {
                    context: "instance deadline".to_string(),
                    limit_ms: timeout.as_millis() as u64,
                };
                if let Err(e) = machine.terminate(&mut project, GiveUpReason::DeadlineExceeded, &deadline) {
                    warn!(instance_id = %task.instance_id, error = %e, "could not close project");
                }
                BenchmarkInstanceResult::from_error(
                    &task,
                    Some(&project),
                    InstanceErrorKind::Timeout,
                    format!("instance exceeded its time limit of {}ms", timeout.as_millis()),
                    elapsed_ms(clock),
                )
            }
        }
    };

    if result.error().is_some() {
        counters.inc_errored();
    }
    if result.resolved() {
        counters.inc_resolved();
    }
    counters.inc_finished();
    (result, Some(project))
}

fn elapsed_ms(clock: Instant) -> u64 {
    clock.elapsed().as_millis() as u64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_options_reject_zero_parallelism() {
        let options = BenchmarkOptions {
            max_parallel_instances: 0,
            ..BenchmarkOptions::default()
        };
        assert!(matches!(options.validate(), Err(AutocoderError::Config(_))));
    }

    #[test]
    fn test_run_id_defaults_to_timestamp() {
        let id = BenchmarkOptions::default().resolved_run_id();
        assert!(id.starts_with("run-"));
        let explicit = BenchmarkOptions {
            run_id: Some("nightly".into()),
            ..BenchmarkOptions::default()
        };
        assert_eq!(explicit.resolved_run_id(), "nightly");
    }
}
