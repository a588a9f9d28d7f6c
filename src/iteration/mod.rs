//! The outer expert-iteration loop and its fine-tuning handoff.

pub mod finetune;
pub mod runner;

pub use finetune::{latest_checkpoint, run_finetune, FinetuneArgs};
pub use runner::{IterationRunner, CONFIG_SNAPSHOT_FILE};
