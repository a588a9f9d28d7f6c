//! Conversation state shared by the environment engine and the turn records.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Who produced a message in the conversation history.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    /// The policy being trained.
    Agent,
    /// The simulated character the agent talks to.
    Environment,
    /// A tool invocation emitted by the agent.
    ToolUse,
    /// The result returned to the agent for a tool invocation.
    ToolResponse,
}

impl Role {
    /// Role name as it appears in turn records and rendered transcripts.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Agent => "agent",
            Self::Environment => "environment",
            Self::ToolUse => "tool_use",
            Self::ToolResponse => "tool_response",
        }
    }

    /// Role name used in the fine-tuning data format.
    pub fn training_role(self) -> &'static str {
        match self {
            Self::Agent => "assistant",
            Self::Environment => "user",
            Self::ToolUse => "function_call",
            Self::ToolResponse => "ipython",
        }
    }
}

/// One message in a conversation history.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    pub content: String,
}

/// A node in the environment's conversation state machine.
///
/// States are instantiated from [`crate::env::StateConfig`] entries with the
/// initial state's variables substituted into their history templates. The
/// engine moves between states by sampling transition tokens; a transition
/// back into the same state keeps the history and bumps `turns`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct State {
    /// Name of the state config this state was instantiated from.
    pub name: String,
    /// Full conversation so far, oldest message first.
    pub history: Vec<Message>,
    /// Variables available for template substitution.
    pub variables: BTreeMap<String, String>,
    /// Number of completed agent turns.
    pub turns: usize,
    /// Transition token -> next state name.
    pub valid_transitions: BTreeMap<String, String>,
    /// Transition token assumed when the sampled token is not valid.
    /// `None` only for terminal states, which are never stepped.
    pub default_transition: Option<String>,
    /// Whether entering this state ends the trajectory.
    pub terminal: bool,
}

impl State {
    /// Whether the trajectory ends here, either because the state is marked
    /// terminal or because the turn limit has been reached.
    pub fn is_terminal(&self, max_turns: usize) -> bool {
        self.terminal || self.turns >= max_turns
    }
}
