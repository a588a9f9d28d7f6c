//! HTTP backend for OpenAI-compatible model servers.
//!
//! Two request shapes cover everything the pipeline needs: a plain chat
//! completion (agent and character turns) and a one-token completion with
//! `top_logprobs`, from which the assessors' distributions over their rating
//! tokens are recovered.

use std::collections::BTreeMap;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::config::BackendConfig;

/// Timeout applied to every request; generation against a busy server can
/// take a while.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(120);

/// Alternatives requested per position when recovering a token distribution.
const TOP_LOGPROBS: usize = 10;

// ---------------------------------------------------------------------------
// Wire types
// ---------------------------------------------------------------------------

/// One chat message as the server expects it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

impl ChatMessage {
    fn new(role: &str, content: impl Into<String>) -> Self {
        Self {
            role: role.to_string(),
            content: content.into(),
        }
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self::new("system", content)
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::new("user", content)
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::new("assistant", content)
    }
}

/// Body of a `/chat/completions` request. Logprob fields are omitted from
/// the JSON entirely unless set, since some servers reject unknown nulls.
#[derive(Debug, Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: &'a [ChatMessage],
    temperature: f64,
    max_tokens: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    logprobs: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    top_logprobs: Option<usize>,
}

/// The slice of the completion response the pipeline reads. Everything else
/// (usage accounting, fingerprints) is ignored at parse time.
#[derive(Debug, Clone, Deserialize)]
pub struct ChatResponse {
    pub id: String,
    pub choices: Vec<ChatChoice>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ChatChoice {
    pub message: ChatMessage,
    #[serde(default)]
    pub logprobs: Option<ChoiceLogProbs>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ChoiceLogProbs {
    /// One entry per generated token position.
    #[serde(default)]
    pub content: Vec<PositionLogProbs>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PositionLogProbs {
    /// The most likely tokens at this position, highest first.
    #[serde(default)]
    pub top_logprobs: Vec<CandidateToken>,
}

/// One alternative token at a generation position.
#[derive(Debug, Clone, Deserialize)]
pub struct CandidateToken {
    pub token: String,
    pub logprob: f64,
}

// ---------------------------------------------------------------------------
// Backend
// ---------------------------------------------------------------------------

/// Client for one OpenAI-compatible server.
///
/// When an adapter checkpoint has been adopted, its path is requested as the
/// model identifier instead of the base model, matching how serving stacks
/// expose dynamically loaded LoRA weights.
#[derive(Debug, Clone)]
pub struct ApiBackend {
    api_base: String,
    model_id: String,
    adapter: Option<String>,
    api_key: String,
    http: reqwest::Client,
}

impl ApiBackend {
    pub fn new(config: &BackendConfig) -> Self {
        let http = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .expect("failed to build reqwest client");

        Self {
            api_base: config.api_base.trim_end_matches('/').to_string(),
            model_id: config.model_id.clone(),
            adapter: None,
            api_key: config.api_key.clone(),
            http,
        }
    }

    /// A copy of this backend that requests `adapter` instead of the base
    /// model.
    pub fn with_adapter(&self, adapter: impl Into<String>) -> Self {
        let mut backend = self.clone();
        backend.adapter = Some(adapter.into());
        backend
    }

    /// The model identifier sent with each request.
    pub fn served_model(&self) -> &str {
        self.adapter.as_deref().unwrap_or(&self.model_id)
    }

    async fn send(&self, request: &ChatRequest<'_>) -> Result<ChatResponse> {
        let response = self
            .http
            .post(format!("{}/chat/completions", self.api_base))
            .bearer_auth(&self.api_key)
            .json(request)
            .send()
            .await
            .with_context(|| format!("request to {} failed", self.api_base))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            bail!("model server answered {status}: {body}");
        }
        response
            .json::<ChatResponse>()
            .await
            .context("malformed chat completion response")
    }

    /// Generate a completion and return the text of the first choice.
    pub async fn generate(
        &self,
        messages: &[ChatMessage],
        temperature: f64,
        max_tokens: usize,
    ) -> Result<String> {
        let model = self.served_model();
        debug!(model, n_messages = messages.len(), "requesting completion");

        let request = ChatRequest {
            model,
            messages,
            temperature,
            max_tokens,
            logprobs: None,
            top_logprobs: None,
        };
        let reply = self.send(&request).await?;
        Ok(reply
            .choices
            .into_iter()
            .next()
            .map(|choice| choice.message.content)
            .unwrap_or_default())
    }

    /// The model's distribution over `valid_tokens` at the next generation
    /// position.
    ///
    /// Requests a single token with `top_logprobs` and keeps the candidates
    /// whose trimmed, lowercased form matches a valid token, renormalized
    /// over the matches. May return an empty map when nothing matches; the
    /// caller picks the fallback.
    pub async fn token_probs(
        &self,
        messages: &[ChatMessage],
        valid_tokens: &[String],
    ) -> Result<BTreeMap<String, f64>> {
        let model = self.served_model();
        debug!(model, valid = valid_tokens.len(), "requesting token distribution");

        let request = ChatRequest {
            model,
            messages,
            temperature: 1.0,
            max_tokens: 1,
            logprobs: Some(true),
            top_logprobs: Some(TOP_LOGPROBS),
        };
        let reply = self.send(&request).await?;
        let candidates = reply
            .choices
            .into_iter()
            .next()
            .and_then(|choice| choice.logprobs)
            .and_then(|lp| lp.content.into_iter().next())
            .map(|position| position.top_logprobs)
            .unwrap_or_default();

        Ok(match_valid_tokens(&candidates, valid_tokens))
    }
}

/// Sum the probability mass of candidates matching each valid token, then
/// normalize over the matches. Matching ignores surrounding whitespace and
/// case.
fn match_valid_tokens(
    candidates: &[CandidateToken],
    valid_tokens: &[String],
) -> BTreeMap<String, f64> {
    let mut probs: BTreeMap<String, f64> = BTreeMap::new();
    for candidate in candidates {
        let normalized = candidate.token.trim().to_lowercase();
        if let Some(valid) = valid_tokens.iter().find(|t| t.to_lowercase() == normalized) {
            *probs.entry(valid.clone()).or_insert(0.0) += candidate.logprob.exp();
        }
    }
    let total: f64 = probs.values().sum();
    if total > 0.0 {
        for p in probs.values_mut() {
            *p /= total;
        }
    }
    probs
}
