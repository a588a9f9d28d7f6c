//! Sway: expert iteration for studying emergent influence of LLM agents.
//!
//! Provides subcommands for each stage of the pipeline:
//!
//! - `run`      -- Full loop: generate, select, fine-tune, repeat
//! - `generate` -- One generation + selection pass, no fine-tuning
//! - `select`   -- Re-run selection over an existing iteration directory
//! - `inspect`  -- Print statistics for a run's iteration directories

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use sway::config::RunConfig;
use sway::iteration::IterationRunner;
use sway::stats::{
    aggregate_trajectories, read_turn_dir, select_extremes, selected_file_path,
    to_selected_records, write_selected_file, IterationStats, TrajectoryView,
};

// ---------------------------------------------------------------------------
// CLI definition
// ---------------------------------------------------------------------------

/// Sway: expert iteration for studying emergent influence of LLM agents.
#[derive(Parser)]
#[command(name = "sway", version, about)]
struct Cli {
    /// Path to a JSON run configuration (uses defaults if not provided).
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Environment spec file; overrides the one named in the config.
    #[arg(long, global = true)]
    env_spec: Option<PathBuf>,

    /// Use the deterministic scripted backend instead of HTTP model servers.
    #[arg(long, global = true)]
    scripted: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the full expert-iteration loop.
    Run {
        /// Override the number of iterations from the config.
        #[arg(long)]
        iterations: Option<usize>,
    },

    /// One generation + selection pass with no fine-tuning.
    Generate {
        /// Trajectories per initial state; overrides the config.
        #[arg(long)]
        repetitions: Option<usize>,
    },

    /// Re-run aggregation and selection over an existing iteration directory.
    Select {
        /// Iteration directory holding per-device turn files.
        dir: PathBuf,

        /// Trajectories kept per rank (best and worst) per initial state.
        #[arg(long, default_value_t = 1)]
        top_n: usize,

        /// Score trajectories by their mean turn rating instead of the
        /// final turn's.
        #[arg(long)]
        mean_reward: bool,
    },

    /// Print statistics for a run's iteration directories.
    Inspect {
        /// Run directory, or a single iteration directory.
        path: PathBuf,

        /// Score trajectories by their mean turn rating instead of the
        /// final turn's.
        #[arg(long)]
        mean_reward: bool,
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

    let mut config = match &cli.config {
        Some(path) => RunConfig::load(path)?,
        None => RunConfig::default(),
    };
    if let Some(env_spec) = &cli.env_spec {
        config.env_spec = env_spec.clone();
    }

    // Fill in API keys from the environment when the config leaves them empty.
    if let Ok(key) = std::env::var("OPENAI_API_KEY") {
        if config.agent_backend.api_key.is_empty() {
            config.agent_backend.api_key = key.clone();
        }
        if config.env_backend.api_key.is_empty() {
            config.env_backend.api_key = key;
        }
    }

    match cli.command {
        Commands::Run { iterations } => cmd_run(config, cli.scripted, iterations).await,
        Commands::Generate { repetitions } => {
            cmd_generate(config, cli.scripted, repetitions).await
        }
        Commands::Select {
            dir,
            top_n,
            mean_reward,
        } => cmd_select(&dir, top_n, !mean_reward),
        Commands::Inspect { path, mean_reward } => cmd_inspect(&path, !mean_reward),
    }
}

// ---------------------------------------------------------------------------
// Command handlers
// ---------------------------------------------------------------------------

async fn cmd_run(mut config: RunConfig, scripted: bool, iterations: Option<usize>) -> Result<()> {
    if let Some(iterations) = iterations {
        config.iterations = iterations;
    }
    let mut runner = IterationRunner::new(config, scripted)?;
    runner.launch().await
}

async fn cmd_generate(
    mut config: RunConfig,
    scripted: bool,
    repetitions: Option<usize>,
) -> Result<()> {
    if let Some(repetitions) = repetitions {
        config.n_trajs_per_initial_state = repetitions;
    }
    let runner = IterationRunner::new(config, scripted)?;
    let path = runner.generate_once().await?;
    tracing::info!(path = %path.display(), "selected trajectories written");
    Ok(())
}

fn cmd_select(dir: &PathBuf, top_n: usize, final_reward: bool) -> Result<()> {
    let records = read_turn_dir(dir)?;
    let views = aggregate_trajectories(records, final_reward);
    let selection = select_extremes(&views, top_n);
    let selected = to_selected_records(&selection);
    let path = selected_file_path(dir);
    write_selected_file(&path, &selected)?;
    tracing::info!(
        path = %path.display(),
        count = selected.len(),
        "selected trajectories written"
    );
    Ok(())
}

fn cmd_inspect(path: &PathBuf, final_reward: bool) -> Result<()> {
    let mut iterations: Vec<(usize, PathBuf)> = Vec::new();
    for entry in
        std::fs::read_dir(path).with_context(|| format!("failed to read {}", path.display()))?
    {
        let child = entry
            .with_context(|| format!("failed to list {}", path.display()))?
            .path();
        if !child.is_dir() {
            continue;
        }
        if let Some(index) = child
            .file_name()
            .and_then(|n| n.to_str())
            .and_then(|n| n.parse::<usize>().ok())
        {
            iterations.push((index, child));
        }
    }
    iterations.sort_by_key(|(index, _)| *index);

    if iterations.is_empty() {
        // Not a run directory; treat the path itself as one iteration.
        let records = read_turn_dir(path)?;
        let views = aggregate_trajectories(records, final_reward);
        print_stats(&path.display().to_string(), &views);
        return Ok(());
    }

    for (index, dir) in &iterations {
        let records = read_turn_dir(dir)
            .with_context(|| format!("failed to load iteration {index}"))?;
        let views = aggregate_trajectories(records, final_reward);
        print_stats(&format!("Iteration {index}"), &views);
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Statistics output
// ---------------------------------------------------------------------------

fn print_stats(label: &str, views: &[TrajectoryView]) {
    let overall = IterationStats::compute(views);
    println!("{label}: {} trajectories", overall.n_trajectories);
    print_stats_block(&overall, "  ");

    let mut env_names: Vec<&str> = views.iter().map(|v| v.env_name.as_str()).collect();
    env_names.sort_unstable();
    env_names.dedup();
    if env_names.len() > 1 {
        for env_name in env_names {
            let env_views: Vec<TrajectoryView> = views
                .iter()
                .filter(|v| v.env_name == env_name)
                .cloned()
                .collect();
            let stats = IterationStats::compute(&env_views);
            println!("  [{env_name}] {} trajectories", stats.n_trajectories);
            print_stats_block(&stats, "    ");
        }
    }
    println!();
}

fn print_stats_block(stats: &IterationStats, indent: &str) {
    println!(
        "{indent}reward:    {:.3} ± {:.3}",
        stats.reward_mean, stats.reward_stderr
    );
    println!(
        "{indent}influence: {:.3} ± {:.3}",
        stats.influence_mean, stats.influence_stderr
    );
    println!(
        "{indent}length:    {:.2} turns",
        stats.conversation_length_mean
    );
    for (state, fraction) in &stats.state_visit_fractions {
        println!("{indent}visited {state}: {:.1}%", fraction * 100.0);
    }
}
