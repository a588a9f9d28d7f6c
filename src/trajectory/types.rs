//! Core turn-record data types shared by generation, aggregation, and
//! selection.

use std::collections::{BTreeMap, BTreeSet};
use std::io::Write;
use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::env::state::Message;

// ---------------------------------------------------------------------------
// Turn record
// ---------------------------------------------------------------------------

/// One line of a worker's JSONL output: everything recorded about a single
/// agent turn.
///
/// The triple `(env_name, initial_state_id, trajectory_id)` identifies the
/// trajectory; `turn` orders records within it. The history snapshot is the
/// full conversation after the turn completed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TurnRecord {
    /// Environment this trajectory ran in.
    pub env_name: String,
    /// Initial state the trajectory started from.
    pub initial_state_id: String,
    /// Index of this trajectory among those sharing the initial state.
    pub trajectory_id: usize,
    /// One-based turn number within the trajectory.
    pub turn: usize,
    /// The agent's system prompt for this trajectory.
    pub agent_system_prompt: String,
    /// Full conversation after this turn.
    pub history: Vec<Message>,
    /// Preference assessor's distribution over rating tokens.
    pub preferences: BTreeMap<String, f64>,
    /// Influence assessor's distribution over rating tokens.
    pub influence_scores: BTreeMap<String, f64>,
    /// Transition distribution the turn's state change was sampled from.
    pub transition_probs: BTreeMap<String, f64>,
    /// Names of all states visited up to and including this turn.
    pub visited_states: BTreeSet<String>,
    /// Whether the environment was terminal after this turn.
    pub terminal: bool,
}

impl TurnRecord {
    /// Expected preference rating for this turn.
    pub fn preference_expectation(&self) -> f64 {
        expectation(&self.preferences)
    }

    /// Expected influence rating for this turn.
    pub fn influence_expectation(&self) -> f64 {
        expectation(&self.influence_scores)
    }

    /// Append this record as one JSONL line, creating the file if needed.
    pub fn append_to(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        let line = serde_json::to_string(self).context("failed to serialize turn record")?;
        let mut file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .with_context(|| format!("failed to open {}", path.display()))?;
        writeln!(file, "{line}").with_context(|| format!("failed to write to {}", path.display()))?;
        Ok(())
    }

    /// Read all records from a JSONL file.
    pub fn read_file(path: impl AsRef<Path>) -> Result<Vec<Self>> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read {}", path.display()))?;
        text.lines()
            .enumerate()
            .filter(|(_, line)| !line.trim().is_empty())
            .map(|(i, line)| {
                serde_json::from_str(line).with_context(|| {
                    format!("failed to parse turn record at {}:{}", path.display(), i + 1)
                })
            })
            .collect()
    }
}

// ---------------------------------------------------------------------------
// Rating expectations
// ---------------------------------------------------------------------------

/// Expected value of a rating distribution: the probability-weighted sum of
/// its tokens parsed as numbers. Tokens that do not parse contribute nothing.
pub fn expectation(probs: &BTreeMap<String, f64>) -> f64 {
    probs
        .iter()
        .filter_map(|(token, prob)| token.parse::<f64>().ok().map(|value| value * prob))
        .sum()
}
