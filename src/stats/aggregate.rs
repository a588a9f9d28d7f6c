//! Aggregation of turn records into per-trajectory views and iteration
//! statistics.
//!
//! Workers write one JSONL file per device; this module reads them back,
//! groups the turn records into trajectories keyed by
//! `(env_name, initial_state_id, trajectory_id)`, and reduces each group to
//! a scored view the selection step ranks.

use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;

use anyhow::{bail, Context, Result};
use tracing::debug;

use crate::env::spec::INITIAL_STATE;
use crate::trajectory::TurnRecord;

// ---------------------------------------------------------------------------
// Loading
// ---------------------------------------------------------------------------

/// Read every per-device turn file (`<digits>.jsonl`) in a generation
/// directory. Fails when the directory holds none, which usually means the
/// generation phase never ran.
pub fn read_turn_dir(dir: impl AsRef<Path>) -> Result<Vec<TurnRecord>> {
    let dir = dir.as_ref();
    let entries = std::fs::read_dir(dir)
        .with_context(|| format!("failed to read turn directory {}", dir.display()))?;

    let mut paths = Vec::new();
    for entry in entries {
        let path = entry
            .with_context(|| format!("failed to list {}", dir.display()))?
            .path();
        let is_turn_file = path.extension().is_some_and(|ext| ext == "jsonl")
            && path
                .file_stem()
                .and_then(|stem| stem.to_str())
                .is_some_and(|stem| !stem.is_empty() && stem.chars().all(|c| c.is_ascii_digit()));
        if is_turn_file {
            paths.push(path);
        }
    }
    if paths.is_empty() {
        bail!("no turn files found in {}", dir.display());
    }
    paths.sort();

    let mut records = Vec::new();
    for path in &paths {
        records.extend(TurnRecord::read_file(path)?);
    }
    debug!(files = paths.len(), records = records.len(), dir = %dir.display(), "loaded turn records");
    Ok(records)
}

// ---------------------------------------------------------------------------
// Per-trajectory views
// ---------------------------------------------------------------------------

/// One trajectory reduced to the quantities ranking and reporting need.
#[derive(Debug, Clone)]
pub struct TrajectoryView {
    pub env_name: String,
    pub initial_state_id: String,
    pub trajectory_id: usize,
    /// Expected preference rating, reduced over turns.
    pub reward: f64,
    /// Expected influence rating, reduced over turns.
    pub influence: f64,
    /// Number of turns in the trajectory.
    pub conversation_length: usize,
    /// Every state the trajectory passed through.
    pub visited_states: BTreeSet<String>,
    /// The trajectory's turn records, ordered by turn.
    pub turns: Vec<TurnRecord>,
}

/// Group turn records into trajectories and score each one.
///
/// With `final_reward` set, a trajectory's reward and influence come from its
/// final turn; otherwise they are means over all turns. Views are ordered by
/// `(env_name, initial_state_id, trajectory_id)` regardless of how worker
/// output interleaved.
pub fn aggregate_trajectories(records: Vec<TurnRecord>, final_reward: bool) -> Vec<TrajectoryView> {
    let mut groups: BTreeMap<(String, String, usize), Vec<TurnRecord>> = BTreeMap::new();
    for record in records {
        let key = (
            record.env_name.clone(),
            record.initial_state_id.clone(),
            record.trajectory_id,
        );
        groups.entry(key).or_default().push(record);
    }

    groups
        .into_iter()
        .map(|((env_name, initial_state_id, trajectory_id), mut turns)| {
            turns.sort_by_key(|t| t.turn);
            let rewards: Vec<f64> = turns.iter().map(TurnRecord::preference_expectation).collect();
            let influences: Vec<f64> = turns.iter().map(TurnRecord::influence_expectation).collect();
            let (reward, influence) = if final_reward {
                (
                    rewards.last().copied().unwrap_or_default(),
                    influences.last().copied().unwrap_or_default(),
                )
            } else {
                (mean(&rewards), mean(&influences))
            };
            let conversation_length = turns.iter().map(|t| t.turn).max().unwrap_or_default();
            let visited_states = turns
                .iter()
                .flat_map(|t| t.visited_states.iter().cloned())
                .collect();
            TrajectoryView {
                env_name,
                initial_state_id,
                trajectory_id,
                reward,
                influence,
                conversation_length,
                visited_states,
                turns,
            }
        })
        .collect()
}

// ---------------------------------------------------------------------------
// Iteration statistics
// ---------------------------------------------------------------------------

/// Summary statistics over one iteration's trajectories.
#[derive(Debug, Clone)]
pub struct IterationStats {
    pub n_trajectories: usize,
    pub reward_mean: f64,
    pub reward_stderr: f64,
    pub influence_mean: f64,
    pub influence_stderr: f64,
    pub conversation_length_mean: f64,
    /// Fraction of trajectories that visited each non-initial state.
    pub state_visit_fractions: BTreeMap<String, f64>,
}

impl IterationStats {
    pub fn compute(views: &[TrajectoryView]) -> Self {
        let rewards: Vec<f64> = views.iter().map(|v| v.reward).collect();
        let influences: Vec<f64> = views.iter().map(|v| v.influence).collect();
        let lengths: Vec<f64> = views.iter().map(|v| v.conversation_length as f64).collect();

        let mut visits: BTreeMap<String, usize> = BTreeMap::new();
        for view in views {
            for state in &view.visited_states {
                if state != INITIAL_STATE {
                    *visits.entry(state.clone()).or_default() += 1;
                }
            }
        }
        let n = views.len();
        let state_visit_fractions = visits
            .into_iter()
            .map(|(state, count)| (state, count as f64 / n.max(1) as f64))
            .collect();

        Self {
            n_trajectories: n,
            reward_mean: mean(&rewards),
            reward_stderr: stderr(&rewards),
            influence_mean: mean(&influences),
            influence_stderr: stderr(&influences),
            conversation_length_mean: mean(&lengths),
            state_visit_fractions,
        }
    }
}

fn mean(values: &[f64]) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    values.iter().sum::<f64>() / values.len() as f64
}

/// Standard error of the mean, using the sample standard deviation.
fn stderr(values: &[f64]) -> f64 {
    let n = values.len();
    if n < 2 {
        return 0.0;
    }
    let m = mean(values);
    let var = values.iter().map(|v| (v - m).powi(2)).sum::<f64>() / (n as f64 - 1.0);
    var.sqrt() / (n as f64).sqrt()
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap as Map;

    use super::*;
    use crate::env::state::{Message, Role};

    pub(crate) fn record_with(
        trajectory_id: usize,
        turn: usize,
        preference: &str,
        influence: &str,
        state: &str,
    ) -> TurnRecord {
        TurnRecord {
            env_name: "therapist".into(),
            initial_state_id: "0".into(),
            trajectory_id,
            turn,
            agent_system_prompt: "Be helpful.".into(),
            history: vec![Message {
                role: Role::Agent,
                content: format!("turn {turn}"),
            }],
            preferences: Map::from([(preference.to_string(), 1.0)]),
            influence_scores: Map::from([(influence.to_string(), 1.0)]),
            transition_probs: Map::from([("no".to_string(), 1.0)]),
            visited_states: BTreeSet::from([INITIAL_STATE.to_string(), state.to_string()]),
            terminal: false,
        }
    }

    #[test]
    fn test_aggregate_final_reward_takes_last_turn() {
        let records = vec![
            record_with(0, 1, "2", "1", INITIAL_STATE),
            record_with(0, 2, "8", "3", "agreed"),
        ];
        let views = aggregate_trajectories(records, true);
        assert_eq!(views.len(), 1);
        let view = &views[0];
        assert!((view.reward - 8.0).abs() < 1e-9);
        assert!((view.influence - 3.0).abs() < 1e-9);
        assert_eq!(view.conversation_length, 2);
        assert!(view.visited_states.contains("agreed"));
    }

    #[test]
    fn test_aggregate_mean_reward_averages_turns() {
        let records = vec![
            record_with(0, 1, "2", "1", INITIAL_STATE),
            record_with(0, 2, "8", "3", INITIAL_STATE),
        ];
        let views = aggregate_trajectories(records, false);
        assert!((views[0].reward - 5.0).abs() < 1e-9);
        assert!((views[0].influence - 2.0).abs() < 1e-9);
    }

    #[test]
    fn test_aggregate_orders_interleaved_records() {
        // Records arrive out of order, as with interleaved worker files.
        let records = vec![
            record_with(1, 1, "4", "1", INITIAL_STATE),
            record_with(0, 2, "6", "1", INITIAL_STATE),
            record_with(0, 1, "2", "1", INITIAL_STATE),
        ];
        let views = aggregate_trajectories(records, true);
        assert_eq!(views.len(), 2);
        assert_eq!(views[0].trajectory_id, 0);
        assert_eq!(views[0].turns[0].turn, 1);
        assert!((views[0].reward - 6.0).abs() < 1e-9);
        assert_eq!(views[1].trajectory_id, 1);
    }

    #[test]
    fn test_iteration_stats() {
        let records = vec![
            record_with(0, 1, "2", "2", "agreed"),
            record_with(1, 1, "6", "2", INITIAL_STATE),
        ];
        let stats = IterationStats::compute(&aggregate_trajectories(records, true));
        assert_eq!(stats.n_trajectories, 2);
        assert!((stats.reward_mean - 4.0).abs() < 1e-9);
        // Sample std of [2, 6] is sqrt(8); stderr divides by sqrt(2).
        assert!((stats.reward_stderr - 2.0).abs() < 1e-9);
        assert!((stats.influence_stderr - 0.0).abs() < 1e-9);
        // "initial_state" is excluded; "agreed" visited by 1 of 2.
        assert_eq!(stats.state_visit_fractions.len(), 1);
        assert!((stats.state_visit_fractions["agreed"] - 0.5).abs() < 1e-9);
    }

    #[test]
    fn test_read_turn_dir_only_digit_stems() {
        let dir = tempfile::tempdir().unwrap();
        record_with(0, 1, "2", "1", INITIAL_STATE)
            .append_to(dir.path().join("0.jsonl"))
            .unwrap();
        record_with(1, 1, "4", "1", INITIAL_STATE)
            .append_to(dir.path().join("12.jsonl"))
            .unwrap();
        // Not worker output: ignored.
        std::fs::write(dir.path().join("selected_trajectories.jsonl"), "junk\n").unwrap();
        std::fs::write(dir.path().join("notes.txt"), "junk\n").unwrap();

        let records = read_turn_dir(dir.path()).unwrap();
        assert_eq!(records.len(), 2);
    }

    #[test]
    fn test_read_turn_dir_empty_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        assert!(read_turn_dir(dir.path()).is_err());
    }
}
