use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

/// Complete configuration for an iterated influence-RL run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunConfig {
    /// Run name; defaults to `"<env_spec stem>-<MM-DD_HH-MM-SS>"` when unset.
    pub run_name: Option<String>,
    /// Path to the environment spec JSON file (see [`crate::env::EnvironmentSpec`]).
    pub env_spec: PathBuf,
    /// Compute devices; one trajectory worker is spawned per entry
    /// (e.g. `"cuda:0"`, `"cuda:1"`).
    pub devices: Vec<String>,
    /// Trajectories generated per initial state each iteration (default: 8).
    pub n_trajs_per_initial_state: usize,
    /// Trajectories kept per rank (best and worst) per initial state at
    /// selection time (default: 1).
    pub top_n_trajs_per_initial_state: usize,
    /// Number of generate/select/fine-tune cycles (default: 4). A final
    /// evaluation pass with one trajectory per initial state runs afterwards.
    pub iterations: usize,
    /// Score a trajectory by its final turn's expected preference instead of
    /// the mean over turns (default: true).
    pub final_reward: bool,
    /// Seed for per-worker transition sampling; `None` leaves sampling
    /// unseeded.
    pub seed: Option<u64>,
    /// Root directory under which `trajectories/<run>` and `models/<run>`
    /// are created (default: `"data"`).
    pub data_root: PathBuf,
    /// When set, iteration 0 skips generation and loads turn records from
    /// this directory instead (a previous run's iteration directory).
    pub override_initial_trajectories: Option<PathBuf>,
    /// Write a run record (`run.json`) and classify failed runs by duration.
    pub track_run: bool,
    /// Backend serving the agent policy.
    pub agent_backend: BackendConfig,
    /// Backend serving the environment's character and assessor models.
    pub env_backend: BackendConfig,
    /// External fine-tuning job invocation.
    pub training: TrainingConfig,
}

/// Connection settings for one OpenAI-compatible model server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackendConfig {
    /// Base URL of the server (e.g. `"http://localhost:8000/v1"`).
    pub api_base: String,
    /// Model identifier requested from the server.
    pub model_id: String,
    /// Bearer token; may be filled from the environment at startup.
    pub api_key: String,
}

/// Invocation of the external fine-tuning job.
///
/// The job is treated as a black box: it reads the selected-trajectories file,
/// writes `checkpoint-<n>` directories under the iteration's output dir, and
/// signals failure through its exit status.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrainingConfig {
    /// Launcher binary (default: `"accelerate"`).
    pub launcher: String,
    /// Arguments placed between the launcher and the script
    /// (default: `["launch"]`).
    pub launcher_args: Vec<String>,
    /// Path to the training script the launcher executes.
    pub script: PathBuf,
    /// Extra `--key=value` flags passed through to the script
    /// (learning rate, batch size, ...).
    pub args: BTreeMap<String, String>,
}

impl RunConfig {
    /// Load a configuration from a JSON file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let text = std::fs::read_to_string(path.as_ref())
            .with_context(|| format!("failed to read config from {}", path.as_ref().display()))?;
        serde_json::from_str(&text)
            .with_context(|| format!("failed to parse config from {}", path.as_ref().display()))
    }

    /// Directory holding this run's trajectory output.
    pub fn trajectory_dir(&self, run_name: &str) -> PathBuf {
        self.data_root.join("trajectories").join(run_name)
    }

    /// Directory holding this run's fine-tuned model output.
    pub fn model_dir(&self, run_name: &str) -> PathBuf {
        self.data_root.join("models").join(run_name)
    }
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            run_name: None,
            env_spec: PathBuf::from("config/env_specs/therapist.json"),
            devices: vec!["cuda:0".into()],
            n_trajs_per_initial_state: 8,
            top_n_trajs_per_initial_state: 1,
            iterations: 4,
            final_reward: true,
            seed: None,
            data_root: PathBuf::from("data"),
            override_initial_trajectories: None,
            track_run: false,
            agent_backend: BackendConfig {
                api_base: "http://localhost:8000/v1".into(),
                model_id: "meta-llama/Meta-Llama-3-8B-Instruct".into(),
                api_key: String::new(),
            },
            env_backend: BackendConfig {
                api_base: "http://localhost:8000/v1".into(),
                model_id: "meta-llama/Meta-Llama-3-8B-Instruct".into(),
                api_key: String::new(),
            },
            training: TrainingConfig {
                launcher: "accelerate".into(),
                launcher_args: vec!["launch".into()],
                script: PathBuf::from("training/expert_iteration.py"),
                args: BTreeMap::new(),
            },
        }
    }
}
