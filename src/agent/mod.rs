//! Agent module: the policy that produces agent turns.

pub mod agent;

// Re-export the primary types for convenient access.
pub use agent::{chat_messages, Agent};
