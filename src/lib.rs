//! Sway: expert iteration for studying emergent influence of LLM agents.
//!
//! An agent converses with a simulated character inside a config-driven state
//! machine; assessor models score every turn for the character's preference
//! and for how much the agent swayed it. Each iteration generates
//! trajectories in parallel across devices, keeps the best and worst per
//! initial state, and fine-tunes the agent on them.

pub mod agent;
pub mod backend;
pub mod config;
pub mod env;
pub mod generation;
pub mod iteration;
pub mod stats;
pub mod tracking;
pub mod trajectory;
