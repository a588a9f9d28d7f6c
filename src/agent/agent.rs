//! The agent policy: turns the conversation so far into a chat request and
//! generates the next agent message.

use anyhow::{Context, Result};
use tracing::debug;

use crate::backend::{AnyBackend, Backend, ChatMessage};
use crate::env::state::{Message, Role};

/// The policy driving agent turns.
pub struct Agent {
    /// Sampling temperature for agent turns.
    pub temperature: f64,
    /// Token budget per agent turn.
    pub max_tokens: usize,
}

impl Default for Agent {
    fn default() -> Self {
        Self {
            temperature: 1.0,
            max_tokens: 1024,
        }
    }
}

impl Agent {
    /// Generate the agent's next message given its system prompt and the
    /// conversation so far.
    pub async fn act(
        &self,
        system_prompt: &str,
        history: &[Message],
        backend: &AnyBackend,
    ) -> Result<String> {
        let messages = chat_messages(system_prompt, history);
        let reply = backend
            .generate(&messages, self.temperature, self.max_tokens)
            .await
            .context("agent turn failed")?;
        let action = reply.trim().to_string();
        debug!(chars = action.len(), "agent produced a turn");
        Ok(action)
    }
}

/// Map a conversation history into chat messages from the agent's
/// perspective: its own output replays as the assistant, everything the
/// environment produced arrives as user input.
pub fn chat_messages(system_prompt: &str, history: &[Message]) -> Vec<ChatMessage> {
    let mut messages = vec![ChatMessage::system(system_prompt)];
    for message in history {
        let chat = match message.role {
            Role::Agent | Role::ToolUse => ChatMessage::assistant(&message.content),
            Role::Environment | Role::ToolResponse => ChatMessage::user(&message.content),
        };
        messages.push(chat);
    }
    messages
}
