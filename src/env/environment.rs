//! The conversation state machine driven during a rollout.
//!
//! Each agent turn advances the machine in four backend calls: the transition
//! assessor picks the next state, the character produces the environment's
//! reply (unless the trajectory ended), and the preference and influence
//! assessors rate the turn. Transition sampling uses the per-trajectory RNG
//! so runs are reproducible under a fixed seed.

use std::collections::BTreeMap;

use anyhow::{Context, Result};
use rand::distributions::WeightedIndex;
use rand::prelude::*;
use tracing::debug;

use crate::backend::{AnyBackend, Backend, ChatMessage};
use crate::env::spec::{fill_template, EnvironmentConfig, EnvironmentSpec, INITIAL_STATE};
use crate::env::state::{Message, Role, State};

/// Sampling temperature for character replies.
const CHARACTER_TEMPERATURE: f64 = 1.0;
/// Token budget for character replies.
const CHARACTER_MAX_TOKENS: usize = 1024;

/// Assessor outputs for one completed agent turn.
#[derive(Debug, Clone)]
pub struct TurnOutcome {
    /// Normalized transition-token distribution the next state was sampled
    /// from.
    pub transition_probs: BTreeMap<String, f64>,
    /// Preference assessor's distribution over rating tokens.
    pub preferences: BTreeMap<String, f64>,
    /// Influence assessor's distribution over rating tokens.
    pub influence_scores: BTreeMap<String, f64>,
    /// Whether the trajectory ended on this turn.
    pub terminal: bool,
}

/// One instantiated environment, owning the current conversation state.
pub struct Environment {
    env_name: String,
    initial_state_id: String,
    config: EnvironmentConfig,
    current_state: State,
    rng: StdRng,
}

impl Environment {
    /// Instantiate an environment from a spec, positioned at the initial
    /// state identified by `initial_state_id`.
    pub fn new(
        spec: &EnvironmentSpec,
        env_name: &str,
        initial_state_id: &str,
        seed: Option<u64>,
    ) -> Result<Self> {
        let config = spec
            .environments
            .get(env_name)
            .with_context(|| format!("unknown environment '{env_name}'"))?
            .clone();
        let variables = config
            .initial_states
            .get(initial_state_id)
            .with_context(|| {
                format!("environment '{env_name}' has no initial state '{initial_state_id}'")
            })?
            .variables
            .clone();
        let current_state = config.build_state(INITIAL_STATE, &variables)?;
        let rng = match seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        Ok(Self {
            env_name: env_name.to_string(),
            initial_state_id: initial_state_id.to_string(),
            config,
            current_state,
            rng,
        })
    }

    pub fn env_name(&self) -> &str {
        &self.env_name
    }

    pub fn initial_state_id(&self) -> &str {
        &self.initial_state_id
    }

    pub fn current_state(&self) -> &State {
        &self.current_state
    }

    /// System prompt for the agent policy, with this trajectory's variables
    /// substituted.
    pub fn agent_system_prompt(&self) -> String {
        fill_template(&self.config.agent_prompt, &self.current_state.variables)
    }

    /// Whether the trajectory has ended, by terminal state or turn limit.
    pub fn is_terminal(&self) -> bool {
        self.current_state.is_terminal(self.config.max_turns)
    }

    /// Advance the machine by one agent turn.
    pub async fn step(&mut self, agent_action: &str, backend: &AnyBackend) -> Result<TurnOutcome> {
        self.current_state.history.push(Message {
            role: Role::Agent,
            content: agent_action.to_string(),
        });

        let transition_probs = self.transition_probs(backend).await?;
        let token = self.sample_transition(&transition_probs)?;
        debug!(
            env = %self.env_name,
            state = %self.current_state.name,
            transition = %token,
            "applying transition"
        );
        self.apply_transition(&token)?;

        if !self.is_terminal() {
            let reply = self.character_reply(backend).await?;
            self.current_state.history.push(Message {
                role: Role::Environment,
                content: reply,
            });
        }

        let preferences = self
            .assess(
                backend,
                &self.config.preference_prompt,
                &self.config.preference_tokens,
            )
            .await?;
        let influence_scores = self
            .assess(
                backend,
                &self.config.influence_prompt,
                &self.config.influence_tokens,
            )
            .await?;

        Ok(TurnOutcome {
            transition_probs,
            preferences,
            influence_scores,
            terminal: self.is_terminal(),
        })
    }

    // ------------------------------------------------------------------
    // Transitions
    // ------------------------------------------------------------------

    /// Query the transition assessor for a distribution over this state's
    /// transition tokens. When the model puts no mass on any valid token,
    /// the default transition gets probability 1.
    async fn transition_probs(&self, backend: &AnyBackend) -> Result<BTreeMap<String, f64>> {
        let tokens: Vec<String> = self.current_state.valid_transitions.keys().cloned().collect();
        let messages = self.assessor_messages(&self.config.transition_prompt);
        let mut probs = backend.token_probs(&messages, &tokens).await?;
        if probs.is_empty() {
            let default = self.default_transition()?;
            probs.insert(default, 1.0);
        }
        Ok(probs)
    }

    /// Sample a transition token from the assessor's distribution.
    fn sample_transition(&mut self, probs: &BTreeMap<String, f64>) -> Result<String> {
        let weights: Vec<f64> = probs.values().copied().collect();
        let dist = WeightedIndex::new(&weights).context("invalid transition distribution")?;
        let index = dist.sample(&mut self.rng);
        let token = probs
            .keys()
            .nth(index)
            .context("sampled transition index out of range")?;
        Ok(token.clone())
    }

    /// Move to the state named by `token`, falling back to the default
    /// transition for unknown tokens. A self-transition keeps the state and
    /// bumps the turn counter; entering a different state carries the
    /// conversation history over and appends that state's template messages.
    fn apply_transition(&mut self, token: &str) -> Result<()> {
        let state = &self.current_state;
        let token = if state.valid_transitions.contains_key(token) {
            token.to_string()
        } else {
            self.default_transition()?
        };
        let next_name = state
            .valid_transitions
            .get(&token)
            .with_context(|| format!("default transition '{token}' is not a valid transition"))?
            .clone();

        if next_name == state.name {
            self.current_state.turns += 1;
        } else {
            let mut next = self.config.build_state(&next_name, &state.variables)?;
            let mut history = state.history.clone();
            history.append(&mut next.history);
            next.history = history;
            next.turns = state.turns + 1;
            self.current_state = next;
        }
        Ok(())
    }

    fn default_transition(&self) -> Result<String> {
        self.current_state
            .default_transition
            .clone()
            .with_context(|| {
                format!("state '{}' has no default transition", self.current_state.name)
            })
    }

    // ------------------------------------------------------------------
    // Backend calls
    // ------------------------------------------------------------------

    /// Generate the character's reply to the conversation so far.
    async fn character_reply(&self, backend: &AnyBackend) -> Result<String> {
        let system = fill_template(&self.config.character_prompt, &self.current_state.variables);
        let mut messages = vec![ChatMessage::system(system)];
        for message in &self.current_state.history {
            // The character speaks as the assistant; everything the agent
            // produced is user input from its perspective.
            let chat = match message.role {
                Role::Environment => ChatMessage::assistant(&message.content),
                Role::Agent | Role::ToolUse | Role::ToolResponse => {
                    ChatMessage::user(&message.content)
                }
            };
            messages.push(chat);
        }
        backend
            .generate(&messages, CHARACTER_TEMPERATURE, CHARACTER_MAX_TOKENS)
            .await
            .context("character reply failed")
    }

    /// Query an assessor for its distribution over rating tokens, falling
    /// back to a uniform distribution when the model puts no mass on any of
    /// them.
    async fn assess(
        &self,
        backend: &AnyBackend,
        prompt: &str,
        tokens: &[String],
    ) -> Result<BTreeMap<String, f64>> {
        let messages = self.assessor_messages(prompt);
        let probs = backend.token_probs(&messages, tokens).await?;
        if probs.is_empty() {
            let uniform = 1.0 / tokens.len().max(1) as f64;
            return Ok(tokens.iter().map(|t| (t.clone(), uniform)).collect());
        }
        Ok(probs)
    }

    /// Build the two-message conversation sent to an assessor: its system
    /// prompt plus the rendered transcript.
    fn assessor_messages(&self, prompt: &str) -> Vec<ChatMessage> {
        let system = fill_template(prompt, &self.current_state.variables);
        let transcript = render_transcript(&self.current_state.history);
        vec![ChatMessage::system(system), ChatMessage::user(transcript)]
    }
}

/// Render a conversation history as a plain-text transcript.
fn render_transcript(history: &[Message]) -> String {
    history
        .iter()
        .map(|m| format!("{}: {}", m.role.as_str(), m.content))
        .collect::<Vec<_>>()
        .join("\n\n")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::ScriptedBackend;

    fn test_spec() -> EnvironmentSpec {
        let json = serde_json::json!({
            "environments": {
                "therapist": {
                    "max_turns": 3,
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
                                "yes": "agreed",
                                "no": "initial_state"
                            },
                            "default_transition": "no"
                        },
                        "agreed": {"terminal": true}
                    },
                    "initial_states": {
                        "0": {"variables": {"name": "Alice"}}
                    }
                }
            }
        });
        serde_json::from_value(json).unwrap()
    }

    fn make_env() -> Environment {
        Environment::new(&test_spec(), "therapist", "0", Some(7)).unwrap()
    }

    #[test]
    fn test_new_builds_initial_state() {
        let env = make_env();
        assert_eq!(env.current_state().name, INITIAL_STATE);
        assert_eq!(env.current_state().history[0].content, "Hi, I'm Alice.");
        assert_eq!(env.agent_system_prompt(), "You are a chatbot talking to Alice.");
        assert!(!env.is_terminal());
    }

    #[test]
    fn test_unknown_environment_is_an_error() {
        assert!(Environment::new(&test_spec(), "nonexistent", "0", None).is_err());
        assert!(Environment::new(&test_spec(), "therapist", "99", None).is_err());
    }

    #[tokio::test]
    async fn test_step_self_transition_appends_reply() {
        let backend = ScriptedBackend::new("Tell me more.");
        backend.queue_choice("no");
        let backend = AnyBackend::Scripted(backend);

        let mut env = make_env();
        let outcome = env.step("How are you feeling?", &backend).await.unwrap();

        assert!(!outcome.terminal);
        assert!((outcome.transition_probs["no"] - 1.0).abs() < 1e-9);
        assert_eq!(env.current_state().turns, 1);
        let history = &env.current_state().history;
        assert_eq!(history.len(), 3);
        assert_eq!(history[1].role, Role::Agent);
        assert_eq!(history[2].role, Role::Environment);
        assert_eq!(history[2].content, "Tell me more.");
    }

    #[tokio::test]
    async fn test_step_into_terminal_state_skips_reply() {
        let backend = ScriptedBackend::default();
        backend.queue_choice("yes");
        let backend = AnyBackend::Scripted(backend);

        let mut env = make_env();
        let outcome = env.step("You should agree.", &backend).await.unwrap();

        assert!(outcome.terminal);
        assert!(env.is_terminal());
        assert_eq!(env.current_state().name, "agreed");
        // Agent message is last: no character reply after a terminal state.
        let last = env.current_state().history.last().unwrap();
        assert_eq!(last.role, Role::Agent);
        // Assessors still ran for the final turn.
        assert_eq!(outcome.preferences.len(), 2);
        assert_eq!(outcome.influence_scores.len(), 2);
    }

    #[tokio::test]
    async fn test_turn_limit_terminates() {
        let backend = ScriptedBackend::default();
        for _ in 0..3 {
            backend.queue_choice("no");
        }
        let backend = AnyBackend::Scripted(backend);

        let mut env = make_env();
        for turn in 0..3 {
            assert!(!env.is_terminal(), "terminal before turn {turn}");
            env.step("Please agree.", &backend).await.unwrap();
        }
        assert!(env.is_terminal());
        assert_eq!(env.current_state().turns, 3);
    }

    #[test]
    fn test_unknown_token_falls_back_to_default() {
        let mut env = make_env();
        env.apply_transition("banana").unwrap();
        // Default is "no": a self-transition.
        assert_eq!(env.current_state().name, INITIAL_STATE);
        assert_eq!(env.current_state().turns, 1);
    }

    #[test]
    fn test_render_transcript() {
        let history = vec![
            Message {
                role: Role::Environment,
                content: "Hi.".into(),
            },
            Message {
                role: Role::Agent,
                content: "Hello.".into(),
            },
        ];
        assert_eq!(render_transcript(&history), "environment: Hi.\n\nagent: Hello.");
    }
}
