//! Trajectory records and work distribution.
//!
//! This module provides:
//! - [`types::TurnRecord`] -- one JSONL line per completed agent turn, the
//!   unit everything downstream (aggregation, selection, training data) is
//!   built from.
//! - [`queue::TrajectoryQueue`] -- the shared work queue the iteration
//!   controller fills and the workers drain.
//! - [`queue::ProgressCounter`] -- the shared count of completed
//!   trajectories behind the progress display.

pub mod queue;
pub mod types;

// Re-export the most commonly used items at the module level.
pub use queue::{ProgressCounter, SubEnvironment, TrajectoryQueue};
pub use types::{expectation, TurnRecord};
