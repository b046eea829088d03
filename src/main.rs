//! Baleen: rollout collection and training-batch packing for LLM fine-tuning.
//!
//! Provides subcommands for the pieces of the loop:
//!
//! - `run`        -- Run the full iteration loop
//! - `collect`    -- Run one collection round and save the graded groups
//! - `pack`       -- Pack a file of tokenized results and report utilization
//! - `iterations` -- Inspect (and optionally prune) a run's output root

use std::collections::BTreeSet;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use baleen::config::{RunConfig, RunContext};
use baleen::metrics::{JsonlMetricsSink, MetricsSink, RewardHistory};
use baleen::model::{CompletionBackend, HttpBackend, MockBackend};
use baleen::rollout::{KeywordTask, RolloutCollector, Task, TokenBudget};
use baleen::store::{self, RsyncStorageSync};
use baleen::training::iteration::{IterationLoop, LocalFineTuner};
use baleen::training::pack::{pack, TokenizedResult};

// ---------------------------------------------------------------------------
// CLI definition
// ---------------------------------------------------------------------------

/// Rollout collection and training-batch packing for LLM fine-tuning loops.
#[derive(Parser)]
#[command(name = "baleen", version, about)]
struct Cli {
    /// Path to a JSON configuration file (uses defaults if not provided).
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Path to a JSON file of keyword-graded tasks.
    #[arg(long, global = true)]
    tasks: Option<PathBuf>,

    /// Use the scripted mock backend and a built-in task set instead of a
    /// live inference server.
    #[arg(long, global = true, default_value_t = false)]
    mock: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the full iteration loop.
    Run {
        /// Number of iterations to run.
        #[arg(long, default_value_t = 5)]
        iterations: u64,
    },

    /// Run one collection round and save the graded groups.
    Collect {
        /// Choices to sample per task.
        #[arg(long)]
        n: Option<usize>,

        /// Path to save the graded sample groups.
        #[arg(long, default_value = "data/groups.json")]
        output: PathBuf,
    },

    /// Pack a JSON file of tokenized results and report buffer utilization.
    Pack {
        /// Path to a JSON array of tokenized results.
        results: PathBuf,

        /// Override the configured sequence length.
        #[arg(long)]
        seq_len: Option<usize>,
    },

    /// Inspect a run's output root: current iteration, best iteration, and
    /// retained checkpoint directories.
    Iterations {
        /// Output root to inspect (defaults to the configured one).
        #[arg(long)]
        dir: Option<PathBuf>,

        /// Apply retention: keep exactly these iteration numbers.
        #[arg(long, value_delimiter = ',')]
        keep: Option<Vec<u64>>,
    },
}

// ---------------------------------------------------------------------------
// Entrypoint
// ---------------------------------------------------------------------------

#[tokio::main]
async fn main() -> Result<()> {
    // Initialise tracing (reads RUST_LOG env var, defaults to info).
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    // Load or create configuration.
    let mut config = match &cli.config {
        Some(path) => {
            let text = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read config from {}", path.display()))?;
            serde_json::from_str::<RunConfig>(&text)
                .with_context(|| format!("Failed to parse config from {}", path.display()))?
        }
        None => RunConfig::default(),
    };

    // Fill in the API key from the environment when not set in the config.
    if config.model.api_key.is_empty() {
        if let Ok(key) = std::env::var("BALEEN_API_KEY").or_else(|_| std::env::var("OPENAI_API_KEY"))
        {
            config.model.api_key = key;
        }
    }

    let mock = cli.mock;
    let tasks_path = cli.tasks.clone();

    match cli.command {
        Commands::Run { iterations } => {
            cmd_run(&config, mock, tasks_path.as_deref(), iterations).await
        }
        Commands::Collect { n, output } => {
            cmd_collect(&config, mock, tasks_path.as_deref(), n, &output).await
        }
        Commands::Pack { results, seq_len } => cmd_pack(&config, &results, seq_len),
        Commands::Iterations { dir, keep } => cmd_iterations(&config, dir, keep).await,
    }
}

// ---------------------------------------------------------------------------
// Command handlers
// ---------------------------------------------------------------------------

async fn cmd_run(
    config: &RunConfig,
    mock: bool,
    tasks_path: Option<&std::path::Path>,
    iterations: u64,
) -> Result<()> {
    let backend = build_backend(config, mock)?;
    let tasks = build_tasks(tasks_path, mock)?;
    let context = RunContext::new(&config.run.output_dir);
    let sink = Arc::new(JsonlMetricsSink::new(&config.run.output_dir));
    let tuner = Arc::new(LocalFineTuner::new(config.run.tune_command.clone()));

    tracing::info!(
        run = %context.run_id,
        iterations,
        tasks = tasks.len(),
        mock,
        "starting run"
    );

    let mut looper = IterationLoop::new(
        config.clone(),
        context,
        backend,
        tuner,
        Arc::clone(&sink) as Arc<dyn MetricsSink>,
        Arc::clone(&sink) as Arc<dyn RewardHistory>,
        tasks.clone(),
        tasks,
    );
    if let Some(target) = &config.run.sync_target {
        looper = looper.with_sync(Arc::new(RsyncStorageSync {
            target: target.clone(),
        }));
    }

    let reports = looper.run(iterations).await?;

    if let Some(last) = reports.last() {
        tracing::info!(
            iterations = reports.len(),
            final_val_reward = last.val_mean_reward,
            final_checkpoint = %last.checkpoint.display(),
            "run finished"
        );
    }
    Ok(())
}

async fn cmd_collect(
    config: &RunConfig,
    mock: bool,
    tasks_path: Option<&std::path::Path>,
    n: Option<usize>,
    output: &PathBuf,
) -> Result<()> {
    let backend = build_backend(config, mock)?;
    let tasks = build_tasks(tasks_path, mock)?;
    let n = n.unwrap_or(config.sampling.group_size);

    let budget = Arc::new(TokenBudget::sized_for(
        backend.token_capacity(),
        config.governor.initial_expected_completion_tokens,
        config.governor.headroom,
    ));
    let collector = RolloutCollector::new(
        backend,
        config.sampling.clone(),
        config.early_stop.clone(),
    );

    let (groups, stats) = collector.collect(&tasks, n, &budget).await?;

    if let Some(parent) = output.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let json = serde_json::to_string_pretty(&groups)?;
    std::fs::write(output, json)?;

    tracing::info!(
        path = %output.display(),
        groups = groups.len(),
        grades = stats.grades,
        exceptions = stats.exceptions,
        early_stops = stats.early_stops,
        mean_reward = stats.mean_reward(),
        "saved graded sample groups"
    );
    Ok(())
}

fn cmd_pack(config: &RunConfig, results_path: &PathBuf, seq_len: Option<usize>) -> Result<()> {
    let text = std::fs::read_to_string(results_path)
        .with_context(|| format!("Failed to read {}", results_path.display()))?;
    let results: Vec<TokenizedResult> =
        serde_json::from_str(&text).context("Failed to parse tokenized results")?;

    let seq_len = seq_len.unwrap_or(config.packing.seq_len);
    let output = pack(&results, seq_len, config.packing.pad_token_id)?;

    println!("Packed {} results into {} buffers (seq_len {seq_len})", results.len(), output.buffers.len());
    for (index, buffer) in output.buffers.iter().enumerate() {
        let used: usize = buffer.segments.iter().map(|s| s.len).sum();
        println!(
            "  buffer {index}: {} segments, {used}/{seq_len} tokens ({:.1}% full)",
            buffer.segments.len(),
            100.0 * used as f64 / seq_len as f64
        );
    }
    if !output.oversized.is_empty() {
        println!("{} oversized results could not be packed:", output.oversized.len());
        for oversized in &output.oversized {
            println!(
                "  task {} choice {}: {} tokens > {seq_len}",
                oversized.task_id, oversized.choice_index, oversized.len
            );
        }
    }
    Ok(())
}

async fn cmd_iterations(
    config: &RunConfig,
    dir: Option<PathBuf>,
    keep: Option<Vec<u64>>,
) -> Result<()> {
    let root = dir.unwrap_or_else(|| config.run.output_dir.clone());

    if let Some(keep) = keep {
        let keep: BTreeSet<u64> = keep.into_iter().collect();
        let removed = store::retain(&root, &keep)?;
        println!("Pruned {} iteration directories", removed.len());
    }

    println!("Output root: {}", root.display());
    println!("  Current iteration: {}", store::current_iteration(&root)?);
    match store::latest_checkpoint(&root)? {
        Some(path) => println!("  Latest checkpoint: {}", path.display()),
        None => println!("  Latest checkpoint: (none)"),
    }

    let sink = JsonlMetricsSink::new(&root);
    match sink.best_iteration().await? {
        Some(best) => println!("  Best iteration by validation reward: {best}"),
        None => println!("  Best iteration by validation reward: (no metrics logged)"),
    }

    let present = store::iterations(&root)?;
    println!("  Retained directories: {present:?}");
    Ok(())
}

// ---------------------------------------------------------------------------
// Wiring helpers
// ---------------------------------------------------------------------------

fn build_backend(config: &RunConfig, mock: bool) -> Result<Arc<dyn CompletionBackend>> {
    if mock {
        tracing::info!("using mock backend");
        Ok(Arc::new(MockBackend::new(config.model.token_capacity)))
    } else {
        let backend = HttpBackend::new(
            &config.model.api_base,
            &config.model.api_key,
            &config.model.model_id,
            config.model.token_capacity,
        )?;
        Ok(Arc::new(backend))
    }
}

fn build_tasks(tasks_path: Option<&std::path::Path>, mock: bool) -> Result<Vec<Arc<dyn Task>>> {
    if let Some(path) = tasks_path {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read tasks from {}", path.display()))?;
        let specs: Vec<KeywordTask> =
            serde_json::from_str(&text).context("Failed to parse task file")?;
        anyhow::ensure!(!specs.is_empty(), "task file is empty");
        return Ok(specs
            .into_iter()
            .map(|task| Arc::new(task) as Arc<dyn Task>)
            .collect());
    }

    anyhow::ensure!(
        mock,
        "no task file given; pass --tasks <file.json> or use --mock"
    );

    // Built-in arithmetic task set for mock runs. The mock backend answers
    // "42" on even choices, so groups have reward variance.
    Ok((0..12)
        .map(|i| {
            let a = i + 30;
            let b = 12 - i;
            Arc::new(KeywordTask::new(
                &format!("sum-{i}"),
                &format!("What is {a} + {b}? Answer with just the number."),
                vec![100 + i as u32, 200, 300],
                "42",
            )) as Arc<dyn Task>
        })
        .collect())
}
