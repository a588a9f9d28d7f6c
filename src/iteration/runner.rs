//! The expert-iteration control loop.
//!
//! Each iteration runs the same phase sequence:
//!
//! 1. **Generate** -- fill the trajectory queue from the environment spec and
//!    drain it with one worker per device, writing per-device turn files.
//! 2. **Aggregate** -- reduce turn records to scored trajectories and log
//!    iteration statistics.
//! 3. **Select** -- keep the best and worst trajectories per initial state
//!    and persist them as the fine-tuning data file.
//! 4. **Fine-tune** -- run the external training job and adopt its newest
//!    checkpoint as the adapter for the next iteration.
//!
//! After the last iteration a final evaluation pass generates one trajectory
//! per initial state and logs statistics without fine-tuning.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use chrono::Local;
use tracing::{debug, info};

use crate::backend::{AnyBackend, ApiBackend, ScriptedBackend};
use crate::config::RunConfig;
use crate::env::EnvironmentSpec;
use crate::generation::TrajectoryGenerator;
use crate::stats::{
    aggregate_trajectories, read_turn_dir, select_extremes, selected_file_path,
    to_selected_records, write_selected_file, IterationStats, TrajectoryView,
};
use crate::tracking::RunTracker;

use super::finetune::{run_finetune, FinetuneArgs};

/// File the effective configuration is snapshotted to inside the run's
/// trajectory directory.
pub const CONFIG_SNAPSHOT_FILE: &str = "config.json";

// ---------------------------------------------------------------------------
// Iteration runner
// ---------------------------------------------------------------------------

/// Drives a full run: `iterations` generate/select/fine-tune cycles followed
/// by one evaluation pass.
#[derive(Debug)]
pub struct IterationRunner {
    config: RunConfig,
    run_name: String,
    spec: Arc<EnvironmentSpec>,
    trajectory_dir: PathBuf,
    model_dir: PathBuf,
    /// Checkpoint adopted from the most recent fine-tuning job; `None` until
    /// the first iteration completes.
    adapter: Option<PathBuf>,
    scripted: bool,
}

impl IterationRunner {
    /// Validate the config, load the environment spec, and resolve the run's
    /// directories.
    ///
    /// With `scripted` set, both the agent and environment roles use a
    /// [`ScriptedBackend`] instead of HTTP backends (offline smoke runs).
    pub fn new(config: RunConfig, scripted: bool) -> Result<Self> {
        if config.n_trajs_per_initial_state == 0 {
            bail!("n_trajs_per_initial_state must be at least 1");
        }
        let spec = Arc::new(EnvironmentSpec::load_from_file(&config.env_spec)?);
        let run_name = resolve_run_name(&config);
        let trajectory_dir = config.trajectory_dir(&run_name);
        let model_dir = config.model_dir(&run_name);

        Ok(Self {
            config,
            run_name,
            spec,
            trajectory_dir,
            model_dir,
            adapter: None,
            scripted,
        })
    }

    pub fn run_name(&self) -> &str {
        &self.run_name
    }

    pub fn trajectory_dir(&self) -> &Path {
        &self.trajectory_dir
    }

    /// The checkpoint the next iteration would fine-tune from.
    pub fn adapter(&self) -> Option<&Path> {
        self.adapter.as_deref()
    }

    // ------------------------------------------------------------------
    // Entry points
    // ------------------------------------------------------------------

    /// Run the full loop, writing a run record when tracking is enabled.
    ///
    /// The tracker only annotates the outcome; the original error still
    /// propagates to the caller.
    pub async fn launch(&mut self) -> Result<()> {
        if !self.config.track_run {
            return self.run().await;
        }

        std::fs::create_dir_all(&self.trajectory_dir)
            .with_context(|| format!("failed to create {}", self.trajectory_dir.display()))?;
        let tracker = RunTracker::start(&self.run_name, &self.trajectory_dir)?;
        match self.run().await {
            Ok(()) => tracker.finish_success(),
            Err(err) => {
                tracker.finish_failure(&format!("{err:#}"))?;
                Err(err)
            }
        }
    }

    /// Run every iteration plus the final evaluation pass.
    pub async fn run(&mut self) -> Result<()> {
        self.prepare_run_dirs()?;
        info!(
            run_name = %self.run_name,
            iterations = self.config.iterations,
            devices = self.config.devices.len(),
            "starting expert-iteration run"
        );

        for iteration in 0..self.config.iterations {
            self.run_iteration(iteration)
                .await
                .with_context(|| format!("iteration {iteration} failed"))?;
        }

        // Evaluate the final policy: one trajectory per initial state, with
        // no fine-tuning afterwards.
        info!(
            iteration = self.config.iterations,
            "running final evaluation pass"
        );
        self.generate_and_select(self.config.iterations, 1)
            .await
            .context("final evaluation pass failed")?;

        info!(run_name = %self.run_name, "run complete");
        Ok(())
    }

    /// One generation + selection pass with no fine-tuning afterwards.
    /// Returns the selected-trajectories file.
    pub async fn generate_once(&self) -> Result<PathBuf> {
        self.prepare_run_dirs()?;
        self.generate_and_select(0, self.config.n_trajs_per_initial_state)
            .await
    }

    // ------------------------------------------------------------------
    // One iteration
    // ------------------------------------------------------------------

    async fn run_iteration(&mut self, iteration: usize) -> Result<()> {
        info!(iteration, "starting iteration");

        let selected = self
            .generate_and_select(iteration, self.config.n_trajs_per_initial_state)
            .await?;

        let output_dir = self.model_dir.join(iteration.to_string());
        let args = FinetuneArgs {
            training: &self.config.training,
            data_path: &selected,
            output_dir: &output_dir,
            model_name: &self.config.agent_backend.model_id,
            iteration,
            adapter_path: self.adapter.as_deref(),
            seed: self.config.seed,
        };
        let checkpoint = run_finetune(&args)
            .await
            .with_context(|| format!("fine-tuning failed for iteration {iteration}"))?;

        info!(iteration, checkpoint = %checkpoint.display(), "adopting checkpoint");
        self.adapter = Some(checkpoint);
        Ok(())
    }

    /// Generate (or load) the iteration's trajectories, log statistics, and
    /// persist the best/worst subset. Returns the selected-trajectories file.
    async fn generate_and_select(
        &self,
        iteration: usize,
        repetitions: usize,
    ) -> Result<PathBuf> {
        let override_dir = if iteration == 0 {
            self.config.override_initial_trajectories.as_deref()
        } else {
            None
        };

        let (iter_dir, records) = match override_dir {
            Some(dir) => {
                info!(dir = %dir.display(), "loading initial trajectories from override directory");
                let records = read_turn_dir(dir).with_context(|| {
                    format!("failed to load override trajectories from {}", dir.display())
                })?;
                (dir.to_path_buf(), records)
            }
            None => {
                let iter_dir = self.trajectory_dir.join(iteration.to_string());
                let (agent_backend, env_backend) = self.backends();
                let generator = TrajectoryGenerator::new(
                    Arc::clone(&self.spec),
                    self.config.devices.clone(),
                    agent_backend,
                    env_backend,
                    self.config.seed,
                );
                generator
                    .generate(repetitions, &iter_dir)
                    .await
                    .with_context(|| format!("generation failed for iteration {iteration}"))?;
                let records = read_turn_dir(&iter_dir)?;
                (iter_dir, records)
            }
        };

        let views = aggregate_trajectories(records, self.config.final_reward);
        self.log_stats(iteration, &views);

        let selection = select_extremes(&views, self.config.top_n_trajs_per_initial_state);
        let top_views: Vec<TrajectoryView> = selection.best.iter().map(|&v| v.clone()).collect();
        let top_stats = IterationStats::compute(&top_views);
        info!(
            iteration,
            n_trajectories = top_stats.n_trajectories,
            reward = format!(
                "{:.3} ± {:.3}",
                top_stats.reward_mean, top_stats.reward_stderr
            ),
            influence = format!(
                "{:.3} ± {:.3}",
                top_stats.influence_mean, top_stats.influence_stderr
            ),
            "top-n statistics"
        );

        let selected = to_selected_records(&selection);
        let path = selected_file_path(&iter_dir);
        write_selected_file(&path, &selected)?;
        Ok(path)
    }

    // ------------------------------------------------------------------
    // Helpers
    // ------------------------------------------------------------------

    fn prepare_run_dirs(&self) -> Result<()> {
        std::fs::create_dir_all(&self.trajectory_dir)
            .with_context(|| format!("failed to create {}", self.trajectory_dir.display()))?;
        std::fs::create_dir_all(&self.model_dir)
            .with_context(|| format!("failed to create {}", self.model_dir.display()))?;

        let mut snapshot = self.config.clone();
        snapshot.run_name = Some(self.run_name.clone());
        let path = self.trajectory_dir.join(CONFIG_SNAPSHOT_FILE);
        let json = serde_json::to_string_pretty(&snapshot)
            .context("failed to serialize config snapshot")?;
        std::fs::write(&path, json)
            .with_context(|| format!("failed to write {}", path.display()))?;
        debug!(path = %path.display(), "config snapshot written");
        Ok(())
    }

    /// Build the (agent, environment) backend pair for one generation pass.
    ///
    /// The agent requests the current adapter's weights once fine-tuning has
    /// produced one; the environment always serves the base model. When both
    /// roles resolve to the same server and model, one client is shared.
    fn backends(&self) -> (Arc<AnyBackend>, Arc<AnyBackend>) {
        if self.scripted {
            let shared = Arc::new(AnyBackend::Scripted(ScriptedBackend::default()));
            return (Arc::clone(&shared), shared);
        }

        let mut agent = ApiBackend::new(&self.config.agent_backend);
        if let Some(adapter) = &self.adapter {
            agent = agent.with_adapter(adapter.display().to_string());
        }
        if self.adapter.is_none() && self.config.agent_backend == self.config.env_backend {
            let shared = Arc::new(AnyBackend::Api(agent));
            return (Arc::clone(&shared), shared);
        }

        let env = ApiBackend::new(&self.config.env_backend);
        (
            Arc::new(AnyBackend::Api(agent)),
            Arc::new(AnyBackend::Api(env)),
        )
    }

    fn log_stats(&self, iteration: usize, views: &[TrajectoryView]) {
        let overall = IterationStats::compute(views);
        info!(
            iteration,
            n_trajectories = overall.n_trajectories,
            reward = format!("{:.3} ± {:.3}", overall.reward_mean, overall.reward_stderr),
            influence = format!(
                "{:.3} ± {:.3}",
                overall.influence_mean, overall.influence_stderr
            ),
            mean_length = format!("{:.2}", overall.conversation_length_mean),
            "iteration statistics"
        );

        let mut by_env: BTreeMap<&str, Vec<TrajectoryView>> = BTreeMap::new();
        for view in views {
            by_env
                .entry(view.env_name.as_str())
                .or_default()
                .push(view.clone());
        }
        for (env_name, env_views) in &by_env {
            let stats = IterationStats::compute(env_views);
            info!(
                iteration,
                env = %env_name,
                n_trajectories = stats.n_trajectories,
                reward = format!("{:.3} ± {:.3}", stats.reward_mean, stats.reward_stderr),
                influence = format!("{:.3} ± {:.3}", stats.influence_mean, stats.influence_stderr),
                "environment statistics"
            );
            for (state, fraction) in &stats.state_visit_fractions {
                info!(
                    iteration,
                    env = %env_name,
                    state = %state,
                    visited = format!("{:.1}%", fraction * 100.0),
                    "state visit rate"
                );
            }
        }
    }
}

/// The configured run name, or `"<env spec stem>-<MM-DD_HH-MM-SS>"`.
fn resolve_run_name(config: &RunConfig) -> String {
    if let Some(name) = &config.run_name {
        return name.clone();
    }
    let stem = config
        .env_spec
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "run".into());
    format!("{stem}-{}", Local::now().format("%m-%d_%H-%M-%S"))
}
