//! Dispatch and monitoring for one generation pass.
//!
//! The generator fills the shared queue, spawns one worker per configured
//! device, and then monitors: once a second it mirrors the shared progress
//! counter into the progress bar, and as workers finish it collects their
//! results. The first worker failure aborts the rest and fails the pass.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use indicatif::{ProgressBar, ProgressStyle};
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use crate::backend::AnyBackend;
use crate::env::EnvironmentSpec;
use crate::generation::worker::TrajectoryWorker;
use crate::trajectory::{ProgressCounter, TrajectoryQueue};

const PROGRESS_TEMPLATE: &str = "[{elapsed_precise}] {bar:40.cyan/blue} {pos}/{len} {msg}";
const PROGRESS_CHARS: &str = "█▓▒░ ";

/// Runs one generation pass across all configured devices.
pub struct TrajectoryGenerator {
    spec: Arc<EnvironmentSpec>,
    devices: Vec<String>,
    agent_backend: Arc<AnyBackend>,
    env_backend: Arc<AnyBackend>,
    seed: Option<u64>,
}

impl TrajectoryGenerator {
    pub fn new(
        spec: Arc<EnvironmentSpec>,
        devices: Vec<String>,
        agent_backend: Arc<AnyBackend>,
        env_backend: Arc<AnyBackend>,
        seed: Option<u64>,
    ) -> Self {
        Self {
            spec,
            devices,
            agent_backend,
            env_backend,
            seed,
        }
    }

    /// Generate `repetitions` trajectories per initial state, writing one
    /// JSONL file per device into `output_dir`. Returns the number of
    /// trajectories generated.
    pub async fn generate(&self, repetitions: usize, output_dir: &Path) -> Result<usize> {
        std::fs::create_dir_all(output_dir)
            .with_context(|| format!("failed to create {}", output_dir.display()))?;

        let queue = Arc::new(TrajectoryQueue::new());
        queue.populate(&self.spec, repetitions);
        let total = queue.size();
        if total == 0 {
            warn!("nothing to generate: queue is empty");
            return Ok(0);
        }
        let progress = Arc::new(ProgressCounter::new());

        info!(
            total,
            workers = self.devices.len(),
            repetitions,
            output_dir = %output_dir.display(),
            "starting trajectory generation"
        );

        let mut join_set = JoinSet::new();
        for (worker_index, device) in self.devices.iter().enumerate() {
            let worker = TrajectoryWorker::new(
                device,
                worker_index,
                Arc::clone(&self.spec),
                Arc::clone(&queue),
                Arc::clone(&progress),
                Arc::clone(&self.agent_backend),
                Arc::clone(&self.env_backend),
                output_dir,
                self.seed,
            );
            join_set.spawn(worker.run());
        }

        let bar = ProgressBar::new(total as u64);
        bar.set_style(
            ProgressStyle::default_bar()
                .template(PROGRESS_TEMPLATE)
                .expect("invalid progress bar template")
                .progress_chars(PROGRESS_CHARS),
        );
        bar.set_message("trajectories");

        let mut interval = tokio::time::interval(Duration::from_secs(1));
        loop {
            tokio::select! {
                joined = join_set.join_next() => match joined {
                    None => break,
                    Some(Ok(Ok(completed))) => {
                        debug!(completed, "worker finished");
                    }
                    Some(Ok(Err(err))) => {
                        join_set.abort_all();
                        bar.abandon();
                        return Err(err.context("trajectory worker failed"));
                    }
                    Some(Err(join_err)) => {
                        join_set.abort_all();
                        bar.abandon();
                        return Err(anyhow!(join_err).context("trajectory worker panicked"));
                    }
                },
                _ = interval.tick() => {
                    bar.set_position(progress.read() as u64);
                }
            }
        }

        bar.set_position(progress.read() as u64);
        bar.finish();

        let completed = progress.read();
        if completed != total {
            bail!("generation finished with {completed} of {total} trajectories");
        }
        info!(completed, "trajectory generation finished");
        Ok(completed)
    }
}
