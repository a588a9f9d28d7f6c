//! Aggregation and selection over generated turn records.

pub mod aggregate;
pub mod selection;

pub use aggregate::{aggregate_trajectories, read_turn_dir, IterationStats, TrajectoryView};
pub use selection::{
    select_extremes, selected_file_path, to_selected_records, write_selected_file, Rank,
    SelectedTrajectory, Selection, TrainingMessage, SELECTED_FILE,
};
