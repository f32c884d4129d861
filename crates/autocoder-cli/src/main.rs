//! Autocoder CLI
//!
//! The `autocoder` command drives the generate -> build -> test -> heal loop.
//!
//! ## Commands
//!
//! - `submit`: run one component specification to completion
//! - `bench`: replay a repair-task dataset and report resolution rates, or
//!   verify a predictions file against it with `--predictions`
//! - `ping`: check that the configured sandbox backend is reachable

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use autocoder_core::{
    AutocoderConfig, BenchmarkOptions, BenchmarkRunner, ComponentSpecification, DatasetFilter,
    Phase, Project,
};
use clap::{Parser, Subcommand};
use serde::Serialize;
use tracing::{info, Level};

#[derive(Parser)]
#[command(name = "autocoder")]
#[command(author = "Stevedores Org")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Autonomous code generation with sandboxed verification", long_about = None)]
struct Cli {
    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Emit JSON-formatted log lines and JSON reports
    #[arg(long, global = true)]
    json: bool,

    /// Configuration file (default: autocoder.toml or .autocoder/config.toml)
    #[arg(short, long, global = true, env = "AUTOCODER_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Generate, build and test one component, healing on failure
    Submit {
        /// Component specification (JSON)
        #[arg(short, long)]
        spec: PathBuf,

        /// Override the healing budget
        #[arg(long)]
        max_healing: Option<u32>,
    },

    /// Run a benchmark dataset
    Bench {
        /// Dataset file (JSON array or JSON Lines)
        #[arg(short, long)]
        dataset: PathBuf,

        /// Instances run concurrently
        #[arg(short, long)]
        parallel: Option<usize>,

        /// Per-instance time limit in seconds
        #[arg(long)]
        timeout_secs: Option<u64>,

        /// Only run tasks in these languages
        #[arg(long = "language")]
        languages: Vec<String>,

        /// Only run tasks with these difficulties
        #[arg(long = "difficulty")]
        difficulties: Vec<String>,

        /// Only run these instance ids
        #[arg(long = "instance")]
        instances: Vec<String>,

        /// Stop after this many tasks
        #[arg(long)]
        limit: Option<usize>,

        /// Generate only; skip build and test
        #[arg(long, conflicts_with = "predictions")]
        dry_run: bool,

        /// Verify patches from a predictions file (JSON Lines:
        /// instance_id, model_patch, model_name) instead of generating
        #[arg(long)]
        predictions: Option<PathBuf>,

        /// Run identifier used for the artifact directory
        #[arg(long)]
        run_id: Option<String>,

        /// Root directory for retained artifacts
        #[arg(long)]
        artifacts_dir: Option<PathBuf>,

        /// Do not write artifacts
        #[arg(long)]
        no_retain: bool,
    },

    /// Check the sandbox backend
    Ping,
}

/// What `submit` prints.
#[derive(Debug, Serialize)]
struct SubmitSummary<'a> {
    project_id: String,
    name: &'a str,
    phase: String,
    healing_attempts: u32,
    attempts: usize,
    error: Option<&'a str>,
    diagnostics: Vec<String>,
    files: Vec<&'a str>,
    estimated_usd: f64,
}

impl<'a> SubmitSummary<'a> {
    fn from_project(project: &'a Project) -> Self {
        let result = project.result();
        Self {
            project_id: project.id().to_string(),
            name: project.name(),
            phase: project.phase().to_string(),
            healing_attempts: project.healing_attempts(),
            attempts: project.history().len(),
            error: result.error.as_deref(),
            diagnostics: result.final_diagnostics.iter().map(|d| d.render()).collect(),
            files: result.files.paths(),
            estimated_usd: project.total_cost().estimated_usd,
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let level = if cli.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };
    autocoder_core::init_tracing(cli.json, level);

    let config = AutocoderConfig::load(cli.config.as_deref()).context("Failed to load configuration")?;

    match cli.command {
        Commands::Submit { spec, max_healing } => cmd_submit(config, &spec, max_healing).await,
        Commands::Bench {
            dataset,
            parallel,
            timeout_secs,
            languages,
            difficulties,
            instances,
            limit,
            dry_run,
            predictions,
            run_id,
            artifacts_dir,
            no_retain,
        } => {
            let filter = DatasetFilter {
                languages,
                difficulties,
                instance_ids: instances,
                limit,
            };
            let options = bench_options(&config, parallel, timeout_secs, filter, dry_run, run_id, no_retain);
            cmd_bench(config, &dataset, predictions.as_deref(), options, artifacts_dir, cli.json).await
        }
        Commands::Ping => cmd_ping(&config).await,
    }
}

fn read_specification(path: &Path) -> Result<ComponentSpecification> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read specification: {}", path.display()))?;
    let spec: ComponentSpecification = serde_json::from_str(&content)
        .with_context(|| format!("Invalid specification JSON: {}", path.display()))?;
    Ok(spec)
}

async fn cmd_submit(mut config: AutocoderConfig, spec_path: &Path, max_healing: Option<u32>) -> Result<()> {
    let spec = read_specification(spec_path)?;
    if let Some(max) = max_healing {
        config.healing.max_healing_attempts = max;
    }
    let machine = config.build_machine()?;

    info!(name = %spec.name, language = %spec.language, "submitting project");
    let project = machine.submit(spec).await?;

    println!("{}", serde_json::to_string_pretty(&SubmitSummary::from_project(&project))?);
    if project.phase() == Phase::Failed {
        bail!(
            "project {} failed: {}",
            project.name(),
            project.result().error.as_deref().unwrap_or("unknown error")
        );
    }
    Ok(())
}

fn bench_options(
    config: &AutocoderConfig,
    parallel: Option<usize>,
    timeout_secs: Option<u64>,
    filter: DatasetFilter,
    dry_run: bool,
    run_id: Option<String>,
    no_retain: bool,
) -> BenchmarkOptions {
    let mut options = config.benchmark_options();
    if let Some(parallel) = parallel {
        options.max_parallel_instances = parallel;
    }
    if let Some(secs) = timeout_secs {
        options.instance_timeout = Duration::from_secs(secs);
    }
    options.filter = filter;
    options.dry_run = dry_run;
    options.run_id = run_id;
    if no_retain {
        options.retain_artifacts = false;
    }
    options
}

async fn cmd_bench(
    mut config: AutocoderConfig,
    dataset: &Path,
    predictions: Option<&Path>,
    options: BenchmarkOptions,
    artifacts_dir: Option<PathBuf>,
    json: bool,
) -> Result<()> {
    if let Some(dir) = artifacts_dir {
        config.benchmark.artifacts_dir = dir;
    }
    let machine = Arc::new(config.build_machine()?);
    let runner = BenchmarkRunner::new(machine).with_artifacts(config.artifact_store());

    let report = match predictions {
        Some(predictions) => {
            info!(predictions = %predictions.display(), "evaluating predictions");
            runner
                .evaluate_predictions_file(dataset, predictions, options)
                .await
                .with_context(|| format!("Evaluation failed for predictions {}", predictions.display()))?
        }
        None => runner
            .run_dataset(dataset, options)
            .await
            .with_context(|| format!("Benchmark failed for dataset {}", dataset.display()))?,
    };

    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        println!("{}", report.render_markdown());
    }
    Ok(())
}

async fn cmd_ping(config: &AutocoderConfig) -> Result<()> {
    let lifecycle = config.build_lifecycle()?;
    let backend = config.sandbox.backend;
    if lifecycle.ping().await {
        println!("sandbox backend {} ({}): reachable", backend, lifecycle.backend_name());
        Ok(())
    } else {
        bail!("sandbox backend {} is unreachable", backend)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition_is_valid() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_bench_flags_parse() {
        let cli = Cli::try_parse_from([
            "autocoder",
            "--json",
            "bench",
            "--dataset",
            "tasks.jsonl",
            "--parallel",
            "8",
            "--language",
            "typescript",
            "--language",
            "rust",
            "--instance",
            "acme__widgets-42",
            "--dry-run",
            "--no-retain",
        ])
        .unwrap();
        assert!(cli.json);
        match cli.command {
            Commands::Bench {
                parallel,
                languages,
                instances,
                dry_run,
                no_retain,
                ..
            } => {
                assert_eq!(parallel, Some(8));
                assert_eq!(languages, vec!["typescript", "rust"]);
                assert_eq!(instances, vec!["acme__widgets-42"]);
                assert!(dry_run && no_retain);
            }
            _ => panic!("expected bench"),
        }
    }

    #[test]
    fn test_predictions_flag_parses_and_excludes_dry_run() {
        let cli = Cli::try_parse_from([
            "autocoder",
            "bench",
            "--dataset",
            "tasks.jsonl",
            "--predictions",
            "preds.jsonl",
        ])
        .unwrap();
        match cli.command {
            Commands::Bench { predictions, dry_run, .. } => {
                assert_eq!(predictions, Some(PathBuf::from("preds.jsonl")));
                assert!(!dry_run);
            }
            _ => panic!("expected bench"),
        }

        let both = Cli::try_parse_from([
            "autocoder",
            "bench",
            "--dataset",
            "tasks.jsonl",
            "--predictions",
            "preds.jsonl",
            "--dry-run",
        ]);
        assert!(both.is_err());
    }

    #[test]
    fn test_cli_flags_override_config() {
        let config = AutocoderConfig::default();
        let options = bench_options(
            &config,
            Some(2),
            Some(30),
            DatasetFilter::default(),
            true,
            Some("nightly".into()),
            true,
        );
        assert_eq!(options.max_parallel_instances, 2);
        assert_eq!(options.instance_timeout, Duration::from_secs(30));
        assert!(options.dry_run);
        assert!(!options.retain_artifacts);
        assert_eq!(options.run_id.as_deref(), Some("nightly"));

        let untouched = bench_options(&config, None, None, DatasetFilter::default(), false, None, false);
        assert_eq!(untouched.max_parallel_instances, config.benchmark.max_parallel_instances);
    }

    #[test]
    fn test_read_specification() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("spec.json");
        std::fs::write(
            &path,
            r#"{"name":"slugify","description":"Turn titles into URL slugs","target_type":"function","language":"typescript"}"#,
        )
        .unwrap();
        let spec = read_specification(&path).unwrap();
        assert_eq!(spec.name, "slugify");
        assert!(spec.test_scenarios.is_empty());

        std::fs::write(&path, "{").unwrap();
        assert!(read_specification(&path).is_err());
    }
}
