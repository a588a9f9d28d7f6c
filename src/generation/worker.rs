//! Trajectory workers: one per compute device.
//!
//! A worker loops on the shared queue, rolls each work item out to a terminal
//! state, appends one JSONL line per completed turn to its own output file,
//! and bumps the shared progress counter exactly once per finished
//! trajectory. An empty queue is the normal exit signal; any rollout error
//! aborts the worker and fails the iteration.

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use tracing::{debug, info};

use crate::agent::Agent;
use crate::backend::AnyBackend;
use crate::env::{Environment, EnvironmentSpec};
use crate::trajectory::{ProgressCounter, SubEnvironment, TrajectoryQueue, TurnRecord};

/// A single generation worker bound to one compute device.
pub struct TrajectoryWorker {
    device: String,
    spec: Arc<EnvironmentSpec>,
    queue: Arc<TrajectoryQueue>,
    progress: Arc<ProgressCounter>,
    agent_backend: Arc<AnyBackend>,
    env_backend: Arc<AnyBackend>,
    agent: Agent,
    output_path: PathBuf,
    seed: Option<u64>,
}

impl TrajectoryWorker {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        device: &str,
        worker_index: usize,
        spec: Arc<EnvironmentSpec>,
        queue: Arc<TrajectoryQueue>,
        progress: Arc<ProgressCounter>,
        agent_backend: Arc<AnyBackend>,
        env_backend: Arc<AnyBackend>,
        output_dir: &Path,
        seed: Option<u64>,
    ) -> Self {
        let output_path = output_dir.join(format!("{}.jsonl", output_stem(device, worker_index)));
        Self {
            device: device.to_string(),
            spec,
            queue,
            progress,
            agent_backend,
            env_backend,
            agent: Agent::default(),
            output_path,
            seed,
        }
    }

    /// Drain the queue, rolling out one trajectory per item. Returns the
    /// number of trajectories this worker completed.
    pub async fn run(self) -> Result<usize> {
        let mut completed = 0usize;
        while let Some(item) = self.queue.take() {
            self.rollout(&item).await.with_context(|| {
                format!(
                    "rollout failed on device {} (env {}, initial state {}, trajectory {})",
                    self.device, item.env_name, item.initial_state_id, item.trajectory_id
                )
            })?;
            self.progress.increment();
            completed += 1;
        }
        info!(device = %self.device, completed, "worker drained the queue");
        Ok(completed)
    }

    /// Roll one trajectory out to a terminal state, appending a turn record
    /// after every completed turn.
    async fn rollout(&self, item: &SubEnvironment) -> Result<()> {
        let seed = self.seed.map(|base| trajectory_seed(base, item));
        let mut env = Environment::new(&self.spec, &item.env_name, &item.initial_state_id, seed)?;
        let agent_system_prompt = env.agent_system_prompt();

        let mut visited_states = std::collections::BTreeSet::new();
        visited_states.insert(env.current_state().name.clone());

        let mut turn = 0usize;
        while !env.is_terminal() {
            let action = self
                .agent
                .act(
                    &agent_system_prompt,
                    &env.current_state().history,
                    &self.agent_backend,
                )
                .await?;
            let outcome = env.step(&action, &self.env_backend).await?;
            visited_states.insert(env.current_state().name.clone());
            turn += 1;

            let record = TurnRecord {
                env_name: item.env_name.clone(),
                initial_state_id: item.initial_state_id.clone(),
                trajectory_id: item.trajectory_id,
                turn,
                agent_system_prompt: agent_system_prompt.clone(),
                history: env.current_state().history.clone(),
                preferences: outcome.preferences,
                influence_scores: outcome.influence_scores,
                transition_probs: outcome.transition_probs,
                visited_states: visited_states.clone(),
                terminal: outcome.terminal,
            };
            record.append_to(&self.output_path)?;
        }

        debug!(
            device = %self.device,
            env = %item.env_name,
            initial_state = %item.initial_state_id,
            trajectory = item.trajectory_id,
            turns = turn,
            "completed trajectory"
        );
        Ok(())
    }
}

/// File stem for a device's output: the digits of the device string
/// (`"cuda:1"` writes `1.jsonl`), or the worker index when the device name
/// carries no digits.
fn output_stem(device: &str, worker_index: usize) -> String {
    let digits: String = device.chars().filter(char::is_ascii_digit).collect();
    if digits.is_empty() {
        worker_index.to_string()
    } else {
        digits
    }
}

/// Seed for one trajectory's transition sampling, derived so repeated runs
/// with the same base seed replay the same transitions.
fn trajectory_seed(base: u64, item: &SubEnvironment) -> u64 {
    let mut hasher = DefaultHasher::new();
    item.hash(&mut hasher);
    base.wrapping_add(hasher.finish())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::ScriptedBackend;

    fn test_spec() -> EnvironmentSpec {
        let json = serde_json::json!({
            "environments": {
                "therapist": {
                    "max_turns": 2,
                    "agent_prompt": "You are a chatbot talking to {name}.",
                    "character_prompt": "You are {name}.",
                    "transition_prompt": "Did {name} agree?",
                    "preference_prompt": "Rate the last reply.",
                    "influence_prompt": "Rate the last reply for influence.",
                    "preference_tokens": ["1", "2"],
                    "influence_tokens": ["1", "2"],
                    "states": {
                        "initial_state": {
                            "history": [
                                {"role": "environment", "content": "Hi, I'm {name}."}
                            ],
                            "valid_transitions": {
                                "no": "initial_state"
                            },
                            "default_transition": "no"
                        }
                    },
                    "initial_states": {
                        "0": {"variables": {"name": "Alice"}},
                        "1": {"variables": {"name": "Bob"}}
                    }
                }
            }
        });
        serde_json::from_value(json).unwrap()
    }

    fn scripted() -> Arc<AnyBackend> {
        Arc::new(AnyBackend::Scripted(ScriptedBackend::default()))
    }

    #[test]
    fn test_output_stem() {
        assert_eq!(output_stem("cuda:0", 3), "0");
        assert_eq!(output_stem("cuda:12", 0), "12");
        assert_eq!(output_stem("cpu", 3), "3");
    }

    #[test]
    fn test_trajectory_seed_is_stable_per_item() {
        let item = SubEnvironment {
            env_name: "therapist".into(),
            initial_state_id: "0".into(),
            trajectory_id: 2,
        };
        let other = SubEnvironment {
            trajectory_id: 3,
            ..item.clone()
        };
        assert_eq!(trajectory_seed(7, &item), trajectory_seed(7, &item));
        assert_ne!(trajectory_seed(7, &item), trajectory_seed(7, &other));
    }

    #[tokio::test]
    async fn test_worker_drains_queue_and_counts() {
        let spec = Arc::new(test_spec());
        let queue = Arc::new(TrajectoryQueue::new());
        let total = queue.populate(&spec, 3);
        assert_eq!(total, 6);

        let progress = Arc::new(ProgressCounter::new());
        let dir = tempfile::tempdir().unwrap();
        let worker = TrajectoryWorker::new(
            "cuda:0",
            0,
            Arc::clone(&spec),
            Arc::clone(&queue),
            Arc::clone(&progress),
            scripted(),
            scripted(),
            dir.path(),
            Some(7),
        );

        let completed = worker.run().await.unwrap();
        assert_eq!(completed, 6);
        assert_eq!(progress.read(), 6);
        assert!(queue.is_empty());

        // Two turns per trajectory (max_turns = 2): 12 records in 0.jsonl.
        let records = TurnRecord::read_file(dir.path().join("0.jsonl")).unwrap();
        assert_eq!(records.len(), 12);
        let last = records.last().unwrap();
        assert!(last.visited_states.contains("initial_state"));
        assert!(!last.preferences.is_empty());
        // Each trajectory's first turn is non-terminal, its second terminal.
        assert!(records.iter().all(|r| r.terminal == (r.turn == 2)));
    }

    #[tokio::test]
    async fn test_worker_on_empty_queue_exits_immediately() {
        let spec = Arc::new(test_spec());
        let queue = Arc::new(TrajectoryQueue::new());
        let progress = Arc::new(ProgressCounter::new());
        let dir = tempfile::tempdir().unwrap();
        let worker = TrajectoryWorker::new(
            "cuda:1",
            1,
            spec,
            queue,
            Arc::clone(&progress),
            scripted(),
            scripted(),
            dir.path(),
            None,
        );

        assert_eq!(worker.run().await.unwrap(), 0);
        assert_eq!(progress.read(), 0);
        assert!(!dir.path().join("1.jsonl").exists());
    }
}
