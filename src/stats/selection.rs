//! Selection of the best and worst trajectories per initial state.
//!
//! Each `(env_name, initial_state_id)` group contributes its top-N
//! trajectories by reward (the fine-tuning data) and its bottom-N (kept for
//! contrastive training objectives). Sorting is stable, so equal rewards
//! resolve in trajectory-id order.

use std::collections::{BTreeMap, BTreeSet};
use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::env::state::Message;
use crate::stats::aggregate::TrajectoryView;

/// File name of the selected-trajectories output inside an iteration
/// directory.
pub const SELECTED_FILE: &str = "selected_trajectories.jsonl";

/// Whether a selected trajectory came from the top or the bottom of its
/// group.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Rank {
    Best,
    Worst,
}

/// References into a slice of views: the per-group extremes.
#[derive(Debug)]
pub struct Selection<'a> {
    pub best: Vec<&'a TrajectoryView>,
    pub worst: Vec<&'a TrajectoryView>,
}

/// Pick the top-N and bottom-N trajectories by reward within every
/// `(env_name, initial_state_id)` group.
pub fn select_extremes(views: &[TrajectoryView], n: usize) -> Selection<'_> {
    let mut groups: BTreeMap<(&str, &str), Vec<&TrajectoryView>> = BTreeMap::new();
    for view in views {
        groups
            .entry((view.env_name.as_str(), view.initial_state_id.as_str()))
            .or_default()
            .push(view);
    }

    let mut best = Vec::new();
    let mut worst = Vec::new();
    for group in groups.values() {
        let mut descending = group.clone();
        descending.sort_by(|a, b| b.reward.total_cmp(&a.reward));
        best.extend(descending.into_iter().take(n));

        let mut ascending = group.clone();
        ascending.sort_by(|a, b| a.reward.total_cmp(&b.reward));
        worst.extend(ascending.into_iter().take(n));
    }
    Selection { best, worst }
}

// ---------------------------------------------------------------------------
// Selected-trajectories file
// ---------------------------------------------------------------------------

/// A message in the fine-tuning data format.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrainingMessage {
    pub role: String,
    pub content: String,
}

/// One line of `selected_trajectories.jsonl`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SelectedTrajectory {
    pub env_name: String,
    pub initial_state_id: String,
    pub trajectory_id: usize,
    pub rank: Rank,
    pub reward: f64,
    pub influence: f64,
    pub conversation_length: usize,
    pub visited_states: BTreeSet<String>,
    /// The full conversation in trainer roles, system prompt first.
    pub messages: Vec<TrainingMessage>,
}

impl SelectedTrajectory {
    fn from_view(view: &TrajectoryView, rank: Rank) -> Self {
        let last_turn = view.turns.last();
        let mut messages = Vec::new();
        if let Some(turn) = last_turn {
            messages.push(TrainingMessage {
                role: "system".to_string(),
                content: turn.agent_system_prompt.clone(),
            });
            messages.extend(turn.history.iter().map(training_message));
        }
        Self {
            env_name: view.env_name.clone(),
            initial_state_id: view.initial_state_id.clone(),
            trajectory_id: view.trajectory_id,
            rank,
            reward: view.reward,
            influence: view.influence,
            conversation_length: view.conversation_length,
            visited_states: view.visited_states.clone(),
            messages,
        }
    }
}

fn training_message(message: &Message) -> TrainingMessage {
    TrainingMessage {
        role: message.role.training_role().to_string(),
        content: message.content.clone(),
    }
}

/// Convert a selection into file records, best trajectories first.
pub fn to_selected_records(selection: &Selection<'_>) -> Vec<SelectedTrajectory> {
    selection
        .best
        .iter()
        .map(|view| SelectedTrajectory::from_view(view, Rank::Best))
        .chain(
            selection
                .worst
                .iter()
                .map(|view| SelectedTrajectory::from_view(view, Rank::Worst)),
        )
        .collect()
}

/// Path of the selected-trajectories file inside an iteration directory.
pub fn selected_file_path(iteration_dir: impl AsRef<Path>) -> PathBuf {
    iteration_dir.as_ref().join(SELECTED_FILE)
}

/// Write selected trajectories as JSONL, replacing any previous file.
pub fn write_selected_file(path: impl AsRef<Path>, records: &[SelectedTrajectory]) -> Result<()> {
    let path = path.as_ref();
    let mut file = std::fs::File::create(path)
        .with_context(|| format!("failed to create {}", path.display()))?;
    for record in records {
        let line = serde_json::to_string(record).context("failed to serialize selection")?;
        writeln!(file, "{line}").with_context(|| format!("failed to write {}", path.display()))?;
    }
    info!(records = records.len(), path = %path.display(), "wrote selected trajectories");
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap as Map;

    use super::*;
    use crate::env::state::Role;
    use crate::trajectory::TurnRecord;

    fn view(initial_state_id: &str, trajectory_id: usize, reward: f64) -> TrajectoryView {
        let turn = TurnRecord {
            env_name: "therapist".into(),
            initial_state_id: initial_state_id.into(),
            trajectory_id,
            turn: 1,
            agent_system_prompt: "Be helpful.".into(),
            history: vec![
                Message {
                    role: Role::Environment,
                    content: "Hi.".into(),
                },
                Message {
                    role: Role::Agent,
                    content: "Hello!".into(),
                },
            ],
            preferences: Map::new(),
            influence_scores: Map::new(),
            transition_probs: Map::new(),
            visited_states: BTreeSet::from(["initial_state".to_string()]),
            terminal: true,
        };
        TrajectoryView {
            env_name: "therapist".into(),
            initial_state_id: initial_state_id.into(),
            trajectory_id,
            reward,
            influence: 1.0,
            conversation_length: 1,
            visited_states: turn.visited_states.clone(),
            turns: vec![turn],
        }
    }

    fn ids(views: &[&TrajectoryView]) -> Vec<usize> {
        views.iter().map(|v| v.trajectory_id).collect()
    }

    #[test]
    fn test_extremes_are_disjoint_below_half() {
        let views: Vec<TrajectoryView> = (0..6)
            .map(|i| view("0", i, i as f64))
            .collect();
        let selection = select_extremes(&views, 2);
        assert_eq!(ids(&selection.best), vec![5, 4]);
        assert_eq!(ids(&selection.worst), vec![0, 1]);

        let best_min = selection.best.iter().map(|v| v.reward).fold(f64::MAX, f64::min);
        let worst_max = selection.worst.iter().map(|v| v.reward).fold(f64::MIN, f64::max);
        assert!(best_min >= worst_max);
    }

    #[test]
    fn test_selection_is_per_group() {
        let mut views = Vec::new();
        views.push(view("0", 0, 1.0));
        views.push(view("0", 1, 9.0));
        views.push(view("1", 0, 5.0));
        views.push(view("1", 1, 3.0));
        let selection = select_extremes(&views, 1);
        // One best per initial state.
        assert_eq!(selection.best.len(), 2);
        assert_eq!(selection.best[0].trajectory_id, 1);
        assert_eq!(selection.best[1].trajectory_id, 0);
        assert_eq!(selection.worst.len(), 2);
        assert_eq!(selection.worst[0].trajectory_id, 0);
        assert_eq!(selection.worst[1].trajectory_id, 1);
    }

    #[test]
    fn test_ties_resolve_in_insertion_order() {
        let views: Vec<TrajectoryView> = (0..4).map(|i| view("0", i, 5.0)).collect();
        let selection = select_extremes(&views, 2);
        assert_eq!(ids(&selection.best), vec![0, 1]);
        assert_eq!(ids(&selection.worst), vec![0, 1]);
    }

    #[test]
    fn test_n_larger_than_group_takes_everything() {
        let views: Vec<TrajectoryView> = (0..2).map(|i| view("0", i, i as f64)).collect();
        let selection = select_extremes(&views, 5);
        assert_eq!(selection.best.len(), 2);
        assert_eq!(selection.worst.len(), 2);
    }

    #[test]
    fn test_selected_record_message_mapping() {
        let views = vec![view("0", 0, 2.0)];
        let selection = select_extremes(&views, 1);
        let records = to_selected_records(&selection);
        assert_eq!(records.len(), 2);

        let best = &records[0];
        assert_eq!(best.rank, Rank::Best);
        assert_eq!(best.messages.len(), 3);
        assert_eq!(best.messages[0].role, "system");
        assert_eq!(best.messages[1].role, "user");
        assert_eq!(best.messages[2].role, "assistant");
        assert_eq!(best.messages[2].content, "Hello!");
    }

    #[test]
    fn test_write_selected_file_round_trip() {
        let views = vec![view("0", 0, 2.0), view("0", 1, 4.0)];
        let selection = select_extremes(&views, 1);
        let records = to_selected_records(&selection);

        let dir = tempfile::tempdir().unwrap();
        let path = selected_file_path(dir.path());
        write_selected_file(&path, &records).unwrap();

        let text = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<SelectedTrajectory> = text
            .lines()
            .map(|l| serde_json::from_str(l).unwrap())
            .collect();
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0].rank, Rank::Best);
        assert_eq!(lines[0].trajectory_id, 1);
        assert_eq!(lines[1].rank, Rank::Worst);
        assert_eq!(lines[1].trajectory_id, 0);
    }
}
