//! Run records: a small JSON audit trail written next to a run's outputs.
//!
//! The record is written when the run starts and rewritten when it ends.
//! Runs that fail within the first five minutes are flagged for cleanup --
//! they died during setup and left nothing worth keeping -- but their
//! outputs are never deleted here, only annotated.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};
use uuid::Uuid;

/// Failures faster than this are flagged for cleanup.
const CLEANUP_THRESHOLD_SECS: i64 = 300;

/// File name of the run record inside the run's trajectory directory.
pub const RUN_RECORD_FILE: &str = "run.json";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Running,
    Succeeded,
    Failed,
}

/// The persisted state of one run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunRecord {
    pub id: Uuid,
    pub run_name: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub status: RunStatus,
    pub error: Option<String>,
    /// The run failed quickly enough that its outputs are not worth keeping.
    pub cleanup: bool,
}

/// Writes and updates a [`RunRecord`] over a run's lifetime.
pub struct RunTracker {
    path: PathBuf,
    record: RunRecord,
}

impl RunTracker {
    /// Start tracking a run, writing the initial record into `dir`.
    pub fn start(run_name: &str, dir: &Path) -> Result<Self> {
        let record = RunRecord {
            id: Uuid::new_v4(),
            run_name: run_name.to_string(),
            started_at: Utc::now(),
            finished_at: None,
            status: RunStatus::Running,
            error: None,
            cleanup: false,
        };
        let tracker = Self {
            path: dir.join(RUN_RECORD_FILE),
            record,
        };
        tracker.save()?;
        info!(id = %tracker.record.id, run = run_name, "tracking run");
        Ok(tracker)
    }

    pub fn record(&self) -> &RunRecord {
        &self.record
    }

    /// Mark the run as finished successfully.
    pub fn finish_success(mut self) -> Result<()> {
        self.record.status = RunStatus::Succeeded;
        self.record.finished_at = Some(Utc::now());
        self.save()
    }

    /// Mark the run as failed, flagging it for cleanup when it died within
    /// the first five minutes.
    pub fn finish_failure(mut self, error: &str) -> Result<()> {
        let now = Utc::now();
        let elapsed = now - self.record.started_at;
        self.record.status = RunStatus::Failed;
        self.record.finished_at = Some(now);
        self.record.error = Some(error.to_string());
        self.record.cleanup = elapsed < chrono::Duration::seconds(CLEANUP_THRESHOLD_SECS);
        if self.record.cleanup {
            warn!(
                run = %self.record.run_name,
                elapsed_secs = elapsed.num_seconds(),
                "run failed during setup; outputs flagged for cleanup"
            );
        }
        self.save()
    }

    fn save(&self) -> Result<()> {
        let json = serde_json::to_string_pretty(&self.record)
            .context("failed to serialize run record")?;
        std::fs::write(&self.path, json)
            .with_context(|| format!("failed to write {}", self.path.display()))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn read_record(dir: &Path) -> RunRecord {
        let text = std::fs::read_to_string(dir.join(RUN_RECORD_FILE)).unwrap();
        serde_json::from_str(&text).unwrap()
    }

    #[test]
    fn test_start_writes_running_record() {
        let dir = tempfile::tempdir().unwrap();
        let tracker = RunTracker::start("myrun", dir.path()).unwrap();
        let record = read_record(dir.path());
        assert_eq!(record.status, RunStatus::Running);
        assert_eq!(record.run_name, "myrun");
        assert_eq!(record.id, tracker.record().id);
        assert!(!record.cleanup);
    }

    #[test]
    fn test_finish_success() {
        let dir = tempfile::tempdir().unwrap();
        let tracker = RunTracker::start("myrun", dir.path()).unwrap();
        tracker.finish_success().unwrap();
        let record = read_record(dir.path());
        assert_eq!(record.status, RunStatus::Succeeded);
        assert!(record.finished_at.is_some());
        assert!(!record.cleanup);
    }

    #[test]
    fn test_fast_failure_is_flagged_for_cleanup() {
        let dir = tempfile::tempdir().unwrap();
        let tracker = RunTracker::start("myrun", dir.path()).unwrap();
        tracker.finish_failure("backend unreachable").unwrap();
        let record = read_record(dir.path());
        assert_eq!(record.status, RunStatus::Failed);
        assert_eq!(record.error.as_deref(), Some("backend unreachable"));
        assert!(record.cleanup);
    }

    #[test]
    fn test_slow_failure_keeps_outputs() {
        let dir = tempfile::tempdir().unwrap();
        let mut tracker = RunTracker::start("myrun", dir.path()).unwrap();
        tracker.record.started_at = Utc::now() - chrono::Duration::seconds(400);
        tracker.finish_failure("worker failed").unwrap();
        let record = read_record(dir.path());
        assert_eq!(record.status, RunStatus::Failed);
        assert!(!record.cleanup);
    }
}
