//! Work distribution for trajectory generation.
//!
//! The [`TrajectoryQueue`] is filled once per iteration with every
//! trajectory to generate, then drained concurrently by the workers. An empty
//! queue is how workers learn that the iteration is done. The
//! [`ProgressCounter`] counts completed trajectories across all workers and
//! feeds the progress display.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::env::spec::EnvironmentSpec;

// ---------------------------------------------------------------------------
// Work items
// ---------------------------------------------------------------------------

/// One unit of generation work: a single trajectory to roll out.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SubEnvironment {
    /// Environment to instantiate.
    pub env_name: String,
    /// Initial state to start from.
    pub initial_state_id: String,
    /// Index of this trajectory among those sharing the initial state
    /// (`0..repetitions`).
    pub trajectory_id: usize,
}

// ---------------------------------------------------------------------------
// Queue
// ---------------------------------------------------------------------------

/// A mutex-guarded FIFO of pending trajectories, shared across workers.
///
/// The lock is held only for push/pop, never across an await point.
#[derive(Debug, Default)]
pub struct TrajectoryQueue {
    items: Mutex<VecDeque<SubEnvironment>>,
    total: AtomicUsize,
}

impl TrajectoryQueue {
    /// Create an empty queue.
    pub fn new() -> Self {
        Self::default()
    }

    /// Fill the queue with `repetitions` trajectories for every initial state
    /// of every environment in the spec, in deterministic order. Returns the
    /// number of work items queued.
    pub fn populate(&self, spec: &EnvironmentSpec, repetitions: usize) -> usize {
        let mut items = self.items.lock().unwrap();
        let before = items.len();
        for (env_name, env) in &spec.environments {
            for initial_state_id in env.initial_states.keys() {
                for trajectory_id in 0..repetitions {
                    items.push_back(SubEnvironment {
                        env_name: env_name.clone(),
                        initial_state_id: initial_state_id.clone(),
                        trajectory_id,
                    });
                }
            }
        }
        let queued = items.len() - before;
        self.total.fetch_add(queued, Ordering::Relaxed);
        debug!(queued, repetitions, "populated trajectory queue");
        queued
    }

    /// Pop the next work item. `None` means the iteration's work is done and
    /// the calling worker should exit.
    pub fn take(&self) -> Option<SubEnvironment> {
        self.items.lock().unwrap().pop_front()
    }

    /// Total number of items queued at population time, not the remaining
    /// count. This is the progress-bar denominator.
    pub fn size(&self) -> usize {
        self.total.load(Ordering::Relaxed)
    }

    /// Whether all items have been taken.
    pub fn is_empty(&self) -> bool {
        self.items.lock().unwrap().is_empty()
    }
}

// ---------------------------------------------------------------------------
// Progress counter
// ---------------------------------------------------------------------------

/// Monotonic count of completed trajectories, shared across workers.
///
/// Purely a counter: the ordering does not synchronize any other memory.
#[derive(Debug, Default)]
pub struct ProgressCounter {
    completed: AtomicUsize,
}

impl ProgressCounter {
    /// Create a counter at zero.
    pub fn new() -> Self {
        Self::default()
    }

    /// Record one completed trajectory and return the new total.
    pub fn increment(&self) -> usize {
        self.completed.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// Current number of completed trajectories.
    pub fn read(&self) -> usize {
        self.completed.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;
    use std::sync::Arc;

    use super::*;

    fn two_env_spec() -> EnvironmentSpec {
        let json = serde_json::json!({
            "environments": {
                "therapist": {
                    "max_turns": 2,
                    "agent_prompt": "a", "character_prompt": "c",
                    "transition_prompt": "t", "preference_prompt": "p",
                    "influence_prompt": "i",
                    "preference_tokens": ["1"], "influence_tokens": ["1"],
                    "states": {
                        "initial_state": {
                            "valid_transitions": {"no": "initial_state"},
                            "default_transition": "no"
                        }
                    },
                    "initial_states": {"0": {}, "1": {}, "2": {}}
                },
                "nudging": {
                    "max_turns": 2,
                    "agent_prompt": "a", "character_prompt": "c",
                    "transition_prompt": "t", "preference_prompt": "p",
                    "influence_prompt": "i",
                    "preference_tokens": ["1"], "influence_tokens": ["1"],
                    "states": {
                        "initial_state": {
                            "valid_transitions": {"no": "initial_state"},
                            "default_transition": "no"
                        }
                    },
                    "initial_states": {"0": {}, "1": {}}
                }
            }
        });
        serde_json::from_value(json).unwrap()
    }

    #[test]
    fn test_populate_size_formula() {
        let queue = TrajectoryQueue::new();
        // 3 + 2 initial states, 4 repetitions each.
        let queued = queue.populate(&two_env_spec(), 4);
        assert_eq!(queued, 20);
        assert_eq!(queue.size(), 20);

        // The total is fixed at population time; only emptiness tracks the
        // drain.
        queue.take().unwrap();
        assert_eq!(queue.size(), 20);
        assert!(!queue.is_empty());
        while queue.take().is_some() {}
        assert_eq!(queue.size(), 20);
        assert!(queue.is_empty());
    }

    #[test]
    fn test_take_drains_fifo_until_empty() {
        let queue = TrajectoryQueue::new();
        queue.populate(&two_env_spec(), 1);
        let first = queue.take().unwrap();
        // BTreeMap order: "nudging" sorts before "therapist".
        assert_eq!(first.env_name, "nudging");
        assert_eq!(first.initial_state_id, "0");
        assert_eq!(first.trajectory_id, 0);

        let mut remaining = 0;
        while queue.take().is_some() {
            remaining += 1;
        }
        assert_eq!(remaining, 4);
        assert!(queue.is_empty());
        assert!(queue.take().is_none());
    }

    #[test]
    fn test_take_on_empty_queue_returns_none() {
        let queue = TrajectoryQueue::new();
        assert!(queue.take().is_none());
        assert_eq!(queue.size(), 0);
    }

    #[test]
    fn test_concurrent_takes_never_duplicate() {
        let queue = Arc::new(TrajectoryQueue::new());
        let total = queue.populate(&two_env_spec(), 8);

        let mut handles = Vec::new();
        for _ in 0..4 {
            let queue = Arc::clone(&queue);
            handles.push(std::thread::spawn(move || {
                let mut taken = Vec::new();
                while let Some(item) = queue.take() {
                    taken.push(item);
                }
                taken
            }));
        }

        let mut all: Vec<SubEnvironment> = Vec::new();
        for handle in handles {
            all.extend(handle.join().unwrap());
        }
        assert_eq!(all.len(), total);
        let unique: HashSet<&SubEnvironment> = all.iter().collect();
        assert_eq!(unique.len(), total, "a work item was taken twice");
        assert!(queue.is_empty());
    }

    #[test]
    fn test_progress_counter_across_threads() {
        let counter = Arc::new(ProgressCounter::new());
        let mut handles = Vec::new();
        for _ in 0..4 {
            let counter = Arc::clone(&counter);
            handles.push(std::thread::spawn(move || {
                for _ in 0..25 {
                    counter.increment();
                }
            }));
        }
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(counter.read(), 100);
    }

    #[test]
    fn test_progress_counter_is_monotonic() {
        let counter = ProgressCounter::new();
        let mut last = counter.read();
        for _ in 0..10 {
            let next = counter.increment();
            assert!(next > last);
            last = next;
        }
        assert_eq!(counter.read(), 10);
    }
}
