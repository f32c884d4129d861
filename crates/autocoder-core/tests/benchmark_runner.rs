//! Benchmark runs over the in-memory backend: concurrency bound, per-instance
//! deadlines, forced cleanup, artifact retention and predictions mode.

use std::sync::Arc;
use std::time::Duration;

use autocoder_core::generation::fakes::ScriptedGenerator;
use autocoder_core::{
    ArtifactStore, BenchmarkOptions, BenchmarkReport, BenchmarkRunner, BenchmarkTask, FileSet,
    GenerationEngine, HealingPolicy, InstanceErrorKind, Phase, Prediction, WorkflowMachine,
};
use sandbox_manager::fakes::{ExecContext, ExecScript, MemoryBackend};
use sandbox_manager::LifecycleManager;

const SLOW_MARKER: &str = "/workspace/SLOW";

fn task(id: &str) -> BenchmarkTask {
    BenchmarkTask {
        instance_id: id.to_string(),
        repo_url: format!("https://github.com/acme/{}", id),
        base_commit: Some("abc123".to_string()),
        language: "typescript".to_string(),
        difficulty: None,
        title: format!("Fix {}", id),
        problem_statement: "parse('') throws instead of returning []".to_string(),
        test_patch: Some("diff --git a/test/parse.test.ts b/test/parse.test.ts\n".to_string()),
        expected_patch: None,
        build_command: None,
        test_command: None,
    }
}

/// Instances whose name contains "slow" get a marker file the backend stalls on.
fn generator() -> ScriptedGenerator {
    ScriptedGenerator::from_fn(|request| {
        let mut files = FileSet::new().with_file("src/parse.ts", "export const parse = (s: string) => s ? s.split(',') : [];");
        if request.specification.name.contains("slow") {
            files.insert("SLOW", "1");
        }
        Ok(files)
    })
}

fn backend() -> Arc<MemoryBackend> {
    let backend = Arc::new(MemoryBackend::new());
    backend.set_exec_handler(|ctx: &ExecContext<'_>| {
        let line = ctx.command_line();
        if line.contains("npm test") && ctx.files.contains_key(SLOW_MARKER) {
            ExecScript::ok("").with_delay(Duration::from_secs(3_600))
        } else if line.contains("git diff") {
            ExecScript::ok("diff --git a/src/parse.ts b/src/parse.ts\n")
        } else {
            ExecScript::ok("")
        }
    });
    backend
}

fn runner(backend: Arc<MemoryBackend>) -> BenchmarkRunner {
    let engine = GenerationEngine::new(Arc::new(generator()), LifecycleManager::new(backend));
    let policy = HealingPolicy {
        backoff_base_ms: 1,
        max_backoff_ms: 5,
        ..HealingPolicy::default()
    };
    BenchmarkRunner::new(Arc::new(WorkflowMachine::new(Arc::new(engine), policy)))
}

fn options(run_id: &str) -> BenchmarkOptions {
    BenchmarkOptions {
        run_id: Some(run_id.to_string()),
        max_parallel_instances: 3,
        instance_timeout: Duration::from_secs(2),
        ..BenchmarkOptions::default()
    }
}

fn tasks() -> Vec<BenchmarkTask> {
    let mut tasks: Vec<BenchmarkTask> = (0..9).map(|i| task(&format!("acme__widgets-{}", i))).collect();
    tasks.push(task("acme__widgets-slow"));
    tasks
}

#[tokio::test]
async fn slow_instance_times_out_without_blocking_the_batch() {
    let backend = backend();
    let report = runner(backend.clone())
        .run(tasks(), options("bench-timeout"))
        .await
        .unwrap();

    assert_eq!(report.total, 10);
    assert_eq!(report.completed, 9);
    assert_eq!(report.errored, 1);
    assert_eq!(report.resolved, 9);
    assert!((report.resolution_rate - 0.9).abs() < 1e-9);

    let slow = report.instance("acme__widgets-slow").unwrap();
    assert_eq!(slow.error_kind(), Some(InstanceErrorKind::Timeout));
    assert_eq!(slow.final_phase(), Some(Phase::Failed));
    assert!(!slow.resolved());
    assert_eq!(report.errors_by_kind.get(&InstanceErrorKind::Timeout), Some(&1));

    for instance in &report.instances {
        if instance.resolved() {
            assert!(instance.compilation_success() && instance.tests_passed());
            assert!(instance.generated_patch().unwrap().starts_with("diff --git"));
        }
    }

    assert!(backend.peak_active() <= 3, "peak was {}", backend.peak_active());
    assert_eq!(backend.active_count(), 0);
    assert!(backend.all_removed_exactly_once());
}

#[tokio::test]
async fn dry_run_generates_without_provisioning() {
    let backend = backend();
    let report = runner(backend.clone())
        .run(
            tasks(),
            BenchmarkOptions {
                dry_run: true,
                ..options("bench-dry")
            },
        )
        .await
        .unwrap();

    assert!(report.dry_run);
    assert_eq!(report.total, 10);
    assert_eq!(report.errored, 0);
    assert_eq!(report.resolved, 0);
    assert_eq!(backend.created_count(), 0);
}

#[tokio::test]
async fn retained_artifacts_are_digest_checked() {
    let dir = tempfile::tempdir().unwrap();
    let store = ArtifactStore::new(dir.path());
    let backend = backend();
    let fast: Vec<BenchmarkTask> = (0..3).map(|i| task(&format!("acme__widgets-{}", i))).collect();

    let report = runner(backend)
        .with_artifacts(store.clone())
        .run(fast, options("bench-artifacts"))
        .await
        .unwrap();

    let run_dir = store.run_dir("bench-artifacts");
    assert!(run_dir.join("summary.md").is_file());
    assert!(run_dir.join("report.digest").is_file());
    assert!(run_dir.join("patches/acme__widgets-0.diff").is_file());
    assert_eq!(std::fs::read_dir(run_dir.join("projects")).unwrap().count(), 6);

    let stored: serde_json::Value = store.read_json("bench-artifacts", "report.json").unwrap();
    assert_eq!(stored["total"], 3);
    assert_eq!(stored["resolved"], report.resolved);
}

#[tokio::test]
async fn same_run_id_never_overwrites_artifacts() {
    let dir = tempfile::tempdir().unwrap();
    let store = ArtifactStore::new(dir.path());
    let first: BenchmarkReport = runner(backend())
        .with_artifacts(store.clone())
        .run(vec![task("acme__widgets-0")], options("bench-rerun"))
        .await
        .unwrap();
    let before = std::fs::read_to_string(store.run_dir("bench-rerun").join("report.json")).unwrap();

    // The second run still reports; its retention failures are only logged.
    let second = runner(backend())
        .with_artifacts(store.clone())
        .run(vec![task("acme__widgets-0")], options("bench-rerun"))
        .await
        .unwrap();
    let after = std::fs::read_to_string(store.run_dir("bench-rerun").join("report.json")).unwrap();

    assert_eq!(first.total, second.total);
    assert_eq!(before, after);
}

#[tokio::test]
async fn unchanged_repository_is_never_resolved() {
    let backend = Arc::new(MemoryBackend::new());
    let report = runner(backend.clone())
        .run(vec![task("acme__widgets-0")], options("bench-empty-diff"))
        .await
        .unwrap();

    let instance = report.instance("acme__widgets-0").unwrap();
    assert_eq!(report.resolved, 0);
    assert!(instance.compilation_success());
    assert!(!instance.tests_passed());
    assert!(instance.generated_patch().is_none());
    assert_eq!(instance.error_kind(), Some(InstanceErrorKind::HealingExhausted));
    assert!(backend.all_removed_exactly_once());
}

fn prediction(id: &str, patch: &str) -> Prediction {
    Prediction {
        instance_id: id.to_string(),
        model_patch: patch.to_string(),
        model_name: "gpt-x".to_string(),
    }
}

#[tokio::test]
async fn predictions_are_verified_without_generation() {
    let backend = Arc::new(MemoryBackend::new());
    backend.set_exec_handler(|ctx: &ExecContext<'_>| {
        let corrupt = ctx
            .files
            .get("/workspace/.autocoder/candidate.patch")
            .map_or(false, |p| p.contains("CORRUPT"));
        if corrupt && ctx.command_line().contains("candidate.patch") {
            ExecScript::fail(1, "error: corrupt patch at line 2")
        } else {
            ExecScript::ok("")
        }
    });
    let tasks: Vec<BenchmarkTask> = (0..4).map(|i| task(&format!("acme__widgets-{}", i))).collect();
    let predictions = vec![
        prediction("acme__widgets-0", "diff --git a/src/parse.ts b/src/parse.ts\n"),
        prediction("acme__widgets-1", "CORRUPT"),
        prediction("acme__widgets-2", ""),
        prediction("acme__ghost-1", "diff --git a/x b/x\n"),
    ];

    let report = runner(backend.clone())
        .evaluate_predictions(tasks, predictions, options("bench-predictions"))
        .await
        .unwrap();

    assert_eq!(report.total, 3);
    assert_eq!(report.resolved, 1);
    assert_eq!(report.errored, 0);
    assert!(report.instance("acme__widgets-3").is_none());

    let good = report.instance("acme__widgets-0").unwrap();
    assert!(good.resolved());
    assert_eq!(good.model(), Some("gpt-x"));
    assert!(good.generated_patch().unwrap().starts_with("diff --git"));

    for id in ["acme__widgets-1", "acme__widgets-2"] {
        let rejected = report.instance(id).unwrap();
        assert!(!rejected.resolved());
        assert!(!rejected.compilation_success());
        assert!(rejected.error().is_none());
        assert_eq!(rejected.final_phase(), Some(Phase::Failed));
    }

    // The empty patch never reached an environment.
    assert_eq!(backend.created_count(), 2);
    assert!(backend.all_removed_exactly_once());
}

#[tokio::test]
async fn predictions_reject_dry_run() {
    let result = runner(backend())
        .evaluate_predictions(
            vec![task("acme__widgets-0")],
            vec![prediction("acme__widgets-0", "diff")],
            BenchmarkOptions {
                dry_run: true,
                ..options("bench-predictions-dry")
            },
        )
        .await;
    assert!(result.is_err());
}
