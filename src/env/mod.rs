//! Simulated conversation environments.
//!
//! An environment is a config-driven state machine ([`environment`]) built
//! from a spec file ([`spec`]): states carry templated conversation history
//! and a transition table, and a transition assessor model decides how the
//! simulated character reacts to each agent turn. Preference and influence
//! assessors rate every turn; their distributions end up in the turn records.

pub mod environment;
pub mod spec;
pub mod state;

// Re-export the core engine and spec types at the module level.
pub use environment::{Environment, TurnOutcome};
pub use spec::{
    fill_template, EnvironmentConfig, EnvironmentSpec, InitialStateConfig, MessageTemplate,
    StateConfig, INITIAL_STATE,
};
pub use state::{Message, Role, State};
