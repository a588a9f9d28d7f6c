//! Scripted backend that replays canned responses.
//!
//! Stands in for a model server in tests and offline smoke runs: `generate`
//! pops queued replies (falling back to a fixed line), and `token_probs`
//! pops queued token choices (falling back to a uniform distribution over
//! the valid tokens).

use std::collections::{BTreeMap, VecDeque};
use std::sync::Mutex;

use anyhow::Result;

use crate::backend::api::ChatMessage;

/// A backend that replays a script instead of calling a model server.
#[derive(Debug)]
pub struct ScriptedBackend {
    replies: Mutex<VecDeque<String>>,
    choices: Mutex<VecDeque<String>>,
    fallback_reply: String,
}

impl ScriptedBackend {
    /// Create a scripted backend whose `generate` returns `fallback_reply`
    /// once any queued replies are exhausted.
    pub fn new(fallback_reply: impl Into<String>) -> Self {
        Self {
            replies: Mutex::new(VecDeque::new()),
            choices: Mutex::new(VecDeque::new()),
            fallback_reply: fallback_reply.into(),
        }
    }

    /// Queue a reply returned by the next `generate` call.
    pub fn queue_reply(&self, reply: impl Into<String>) {
        self.replies.lock().unwrap().push_back(reply.into());
    }

    /// Queue a token the next `token_probs` call assigns probability 1.0,
    /// provided it is among the valid tokens for that call.
    pub fn queue_choice(&self, token: impl Into<String>) {
        self.choices.lock().unwrap().push_back(token.into());
    }

    /// Pop the next queued reply or fall back to the fixed line.
    pub async fn generate(
        &self,
        _messages: &[ChatMessage],
        _temperature: f64,
        _max_tokens: usize,
    ) -> Result<String> {
        let queued = self.replies.lock().unwrap().pop_front();
        Ok(queued.unwrap_or_else(|| self.fallback_reply.clone()))
    }

    /// Pop the next queued choice, or distribute probability uniformly over
    /// `valid_tokens` when the queue is empty or the choice is not valid.
    pub async fn token_probs(
        &self,
        _messages: &[ChatMessage],
        valid_tokens: &[String],
    ) -> Result<BTreeMap<String, f64>> {
        let choice = self.choices.lock().unwrap().pop_front();
        if let Some(token) = choice {
            if valid_tokens.contains(&token) {
                let mut probs = BTreeMap::new();
                probs.insert(token, 1.0);
                return Ok(probs);
            }
        }
        let uniform = 1.0 / valid_tokens.len().max(1) as f64;
        Ok(valid_tokens
            .iter()
            .map(|t| (t.clone(), uniform))
            .collect())
    }
}

impl Default for ScriptedBackend {
    fn default() -> Self {
        Self::new("I hear you. Tell me more about that.")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_replies_queue_then_fallback() {
        let backend = ScriptedBackend::new("fallback");
        backend.queue_reply("first");
        backend.queue_reply("second");
        assert_eq!(backend.generate(&[], 1.0, 16).await.unwrap(), "first");
        assert_eq!(backend.generate(&[], 1.0, 16).await.unwrap(), "second");
        assert_eq!(backend.generate(&[], 1.0, 16).await.unwrap(), "fallback");
    }

    #[tokio::test]
    async fn test_queued_choice_gets_full_probability() {
        let backend = ScriptedBackend::default();
        backend.queue_choice("yes");
        let valid = vec!["yes".to_string(), "no".to_string()];
        let probs = backend.token_probs(&[], &valid).await.unwrap();
        assert_eq!(probs.len(), 1);
        assert!((probs["yes"] - 1.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_empty_queue_is_uniform() {
        let backend = ScriptedBackend::default();
        let valid = vec!["1".to_string(), "2".to_string()];
        let probs = backend.token_probs(&[], &valid).await.unwrap();
        assert!((probs["1"] - 0.5).abs() < 1e-9);
        assert!((probs["2"] - 0.5).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_invalid_choice_falls_back_to_uniform() {
        let backend = ScriptedBackend::default();
        backend.queue_choice("banana");
        let valid = vec!["yes".to_string(), "no".to_string()];
        let probs = backend.token_probs(&[], &valid).await.unwrap();
        assert_eq!(probs.len(), 2);
    }
}
