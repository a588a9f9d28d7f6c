//! Launching the external fine-tuning job and locating its checkpoints.
//!
//! The job is a launcher plus script (typically `accelerate launch` with a
//! training script); this module builds the command line, runs it to
//! completion with inherited stdio, and resolves the checkpoint it produced.

use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use tokio::process::Command;
use tracing::{debug, info};

use crate::config::TrainingConfig;

/// Everything one fine-tuning invocation needs.
#[derive(Debug)]
pub struct FinetuneArgs<'a> {
    pub training: &'a TrainingConfig,
    /// Selected-trajectories file the job trains on.
    pub data_path: &'a Path,
    /// Directory the job writes `checkpoint-<n>` directories into.
    pub output_dir: &'a Path,
    /// Base model identifier.
    pub model_name: &'a str,
    /// Zero-based iteration this job belongs to.
    pub iteration: usize,
    /// Checkpoint from the previous iteration to continue from, if any.
    pub adapter_path: Option<&'a Path>,
    pub seed: Option<u64>,
}

/// Run one fine-tuning job and return the checkpoint it produced.
///
/// A non-zero exit status or a missing checkpoint is fatal: continuing the
/// run would silently reuse the previous iteration's weights.
pub async fn run_finetune(args: &FinetuneArgs<'_>) -> Result<PathBuf> {
    std::fs::create_dir_all(args.output_dir)
        .with_context(|| format!("failed to create {}", args.output_dir.display()))?;

    let command_args = finetune_command_args(args);
    info!(
        launcher = %args.training.launcher,
        iteration = args.iteration,
        output_dir = %args.output_dir.display(),
        "launching fine-tuning job"
    );
    debug!(args = ?command_args, "fine-tuning command line");

    let status = Command::new(&args.training.launcher)
        .args(&command_args)
        .env("NCCL_P2P_LEVEL", "NVL")
        .status()
        .await
        .with_context(|| format!("failed to launch '{}'", args.training.launcher))?;
    if !status.success() {
        bail!("fine-tuning job exited with {status}");
    }

    let checkpoint = latest_checkpoint(args.output_dir)?;
    info!(checkpoint = %checkpoint.display(), "fine-tuning finished");
    Ok(checkpoint)
}

/// The arguments passed to the launcher, in order: launcher args, script,
/// then `--key=value` flags for the script.
fn finetune_command_args(args: &FinetuneArgs<'_>) -> Vec<String> {
    let mut command_args: Vec<String> = args.training.launcher_args.clone();
    command_args.push(args.training.script.display().to_string());
    command_args.push(format!("--data_path={}", args.data_path.display()));
    command_args.push(format!("--output_dir={}", args.output_dir.display()));
    command_args.push(format!("--model_name={}", args.model_name));
    command_args.push(format!("--iteration={}", args.iteration));
    if let Some(adapter) = args.adapter_path {
        command_args.push(format!("--adapter_path={}", adapter.display()));
    }
    if let Some(seed) = args.seed {
        command_args.push(format!("--seed={seed}"));
    }
    for (key, value) in &args.training.args {
        command_args.push(format!("--{key}={value}"));
    }
    command_args
}

/// Find the `checkpoint-<n>` directory with the highest numeric suffix.
pub fn latest_checkpoint(dir: impl AsRef<Path>) -> Result<PathBuf> {
    let dir = dir.as_ref();
    let entries = std::fs::read_dir(dir)
        .with_context(|| format!("failed to read checkpoint directory {}", dir.display()))?;

    let mut best: Option<(u64, PathBuf)> = None;
    for entry in entries {
        let entry = entry.with_context(|| format!("failed to list {}", dir.display()))?;
        let path = entry.path();
        if !path.is_dir() {
            continue;
        }
        let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
            continue;
        };
        let Some(suffix) = name.strip_prefix("checkpoint-") else {
            continue;
        };
        let Ok(number) = suffix.parse::<u64>() else {
            continue;
        };
        if best.as_ref().is_none_or(|(n, _)| number > *n) {
            best = Some((number, path));
        }
    }
    best.map(|(_, path)| path)
        .with_context(|| format!("no checkpoint found in {}", dir.display()))
}
