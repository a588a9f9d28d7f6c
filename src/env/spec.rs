//! Environment spec files: the JSON schema that defines simulated
//! environments, their conversation state machines, and their initial states.
//!
//! A spec file holds one or more named environments. Each environment carries
//! the system prompts for the character and the assessor models, the state
//! configs, and the set of initial states that seed trajectories. State
//! history templates may reference initial-state variables as `{name}`.

use std::collections::BTreeMap;
use std::path::Path;

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::env::state::{Message, Role, State};

/// Name of the state every trajectory starts in.
pub const INITIAL_STATE: &str = "initial_state";

/// A parsed environment spec file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnvironmentSpec {
    /// Environment name -> configuration.
    pub environments: BTreeMap<String, EnvironmentConfig>,
}

/// Configuration for one simulated environment.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnvironmentConfig {
    /// Maximum number of agent turns before forced termination.
    pub max_turns: usize,
    /// System prompt template for the agent policy.
    pub agent_prompt: String,
    /// System prompt template for the simulated character.
    pub character_prompt: String,
    /// System prompt template for the transition assessor.
    pub transition_prompt: String,
    /// System prompt template for the preference assessor.
    pub preference_prompt: String,
    /// System prompt template for the influence assessor.
    pub influence_prompt: String,
    /// Rating tokens the preference assessor chooses between (e.g. "1".."10").
    pub preference_tokens: Vec<String>,
    /// Rating tokens the influence assessor chooses between.
    pub influence_tokens: Vec<String>,
    /// State name -> state configuration. Must contain [`INITIAL_STATE`].
    pub states: BTreeMap<String, StateConfig>,
    /// Initial state id -> template variables for that starting point.
    pub initial_states: BTreeMap<String, InitialStateConfig>,
}

/// Configuration for one node of the conversation state machine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StateConfig {
    /// Messages prepended to the history when this state is first entered.
    #[serde(default)]
    pub history: Vec<MessageTemplate>,
    /// Transition token -> next state name.
    #[serde(default)]
    pub valid_transitions: BTreeMap<String, String>,
    /// Transition token assumed when the sampled token is not in
    /// `valid_transitions`. Must itself be a valid transition.
    #[serde(default)]
    pub default_transition: Option<String>,
    /// Whether entering this state ends the trajectory.
    #[serde(default)]
    pub terminal: bool,
}

/// A history message with `{variable}` placeholders.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageTemplate {
    pub role: Role,
    pub content: String,
}

/// One starting point for trajectories in an environment.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InitialStateConfig {
    /// Values substituted for `{name}` placeholders in prompts and history
    /// templates.
    #[serde(default)]
    pub variables: BTreeMap<String, String>,
}

impl EnvironmentSpec {
    /// Load and validate a spec from a JSON file.
    pub fn load_from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read environment spec from {}", path.display()))?;
        let spec: Self = serde_json::from_str(&text)
            .with_context(|| format!("failed to parse environment spec from {}", path.display()))?;
        spec.validate()?;
        info!(
            environments = spec.environments.len(),
            path = %path.display(),
            "loaded environment spec"
        );
        Ok(spec)
    }

    /// Check structural invariants: every environment has an initial state
    /// config and at least one initial state, every transition targets an
    /// existing state, and every non-terminal state has a default transition
    /// that is one of its valid transitions.
    pub fn validate(&self) -> Result<()> {
        for (env_name, env) in &self.environments {
            if !env.states.contains_key(INITIAL_STATE) {
                bail!("environment '{env_name}' has no '{INITIAL_STATE}' state");
            }
            if env.initial_states.is_empty() {
                bail!("environment '{env_name}' has no initial states");
            }
            for (state_name, state) in &env.states {
                if !state.terminal {
                    match &state.default_transition {
                        None => bail!(
                            "state '{state_name}' in environment '{env_name}' is not \
                             terminal but has no default transition"
                        ),
                        Some(token) if !state.valid_transitions.contains_key(token) => bail!(
                            "default transition '{token}' of state '{state_name}' in \
                             environment '{env_name}' is not a valid transition"
                        ),
                        Some(_) => {}
                    }
                }
                for target in state.valid_transitions.values() {
                    if !env.states.contains_key(target) {
                        bail!(
                            "state '{state_name}' in environment '{env_name}' transitions \
                             to unknown state '{target}'"
                        );
                    }
                }
            }
        }
        Ok(())
    }
}

impl EnvironmentConfig {
    /// Instantiate a state config with the given variables substituted into
    /// its history templates.
    pub fn build_state(&self, name: &str, variables: &BTreeMap<String, String>) -> Result<State> {
        let config = self
            .states
            .get(name)
            .with_context(|| format!("unknown state '{name}'"))?;
        let history = config
            .history
            .iter()
            .map(|template| Message {
                role: template.role,
                content: fill_template(&template.content, variables),
            })
            .collect();
        Ok(State {
            name: name.to_string(),
            history,
            variables: variables.clone(),
            turns: 0,
            valid_transitions: config.valid_transitions.clone(),
            default_transition: config.default_transition.clone(),
            terminal: config.terminal,
        })
    }
}

// ---------------------------------------------------------------------------
// Template substitution
// ---------------------------------------------------------------------------

/// Replace every `{name}` placeholder with the matching variable value.
/// Placeholders without a matching variable are left untouched.
pub fn fill_template(template: &str, variables: &BTreeMap<String, String>) -> String {
    let mut text = template.to_string();
    for (name, value) in variables {
        text = text.replace(&format!("{{{name}}}"), value);
    }
    text
}
