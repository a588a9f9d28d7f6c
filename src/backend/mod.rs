//! Model backends.
//!
//! A backend answers two kinds of queries: free-form chat generation (agent
//! and character turns) and the probability distribution over a small set of
//! rating tokens (assessor calls). The [`ApiBackend`] talks to an
//! OpenAI-compatible server; the [`ScriptedBackend`] replays canned responses
//! for tests and offline smoke runs.

pub mod api;
pub mod scripted;

pub use api::{ApiBackend, ChatMessage};
pub use scripted::ScriptedBackend;

use std::collections::BTreeMap;

use anyhow::Result;

// ---------------------------------------------------------------------------
// Backend trait and enum dispatch
// ---------------------------------------------------------------------------

/// The core backend trait.
#[allow(async_fn_in_trait)]
pub trait Backend: Send + Sync {
    /// Generate a chat completion and return the text of the first choice.
    async fn generate(
        &self,
        messages: &[ChatMessage],
        temperature: f64,
        max_tokens: usize,
    ) -> Result<String>;

    /// Return the model's normalized distribution over `valid_tokens` at the
    /// next generation position. May be empty when the model puts no mass on
    /// any valid token; callers decide the fallback.
    async fn token_probs(
        &self,
        messages: &[ChatMessage],
        valid_tokens: &[String],
    ) -> Result<BTreeMap<String, f64>>;
}

/// An enum wrapper around all concrete backend types, enabling runtime
/// backend selection without `dyn` (which is incompatible with async trait
/// methods).
#[derive(Debug)]
pub enum AnyBackend {
    Api(ApiBackend),
    Scripted(ScriptedBackend),
}

impl Backend for AnyBackend {
    async fn generate(
        &self,
        messages: &[ChatMessage],
        temperature: f64,
        max_tokens: usize,
    ) -> Result<String> {
        match self {
            Self::Api(b) => b.generate(messages, temperature, max_tokens).await,
            Self::Scripted(b) => b.generate(messages, temperature, max_tokens).await,
        }
    }

    async fn token_probs(
        &self,
        messages: &[ChatMessage],
        valid_tokens: &[String],
    ) -> Result<BTreeMap<String, f64>> {
        match self {
            Self::Api(b) => b.token_probs(messages, valid_tokens).await,
            Self::Scripted(b) => b.token_probs(messages, valid_tokens).await,
        }
    }
}
