//! Concurrent trajectory generation.
//!
//! One [`TrajectoryGenerator`] pass covers an iteration's generation phase:
//! it fills the shared queue, runs a [`TrajectoryWorker`] per device, and
//! monitors progress until the queue drains or a worker fails.

pub mod generator;
pub mod worker;

pub use generator::TrajectoryGenerator;
pub use worker::TrajectoryWorker;
