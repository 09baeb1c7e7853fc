use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Resumable progress marker for one domain service's batch run.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncCheckpoint {
    /// Number of fully processed batches. Never decreases within a run.
    pub batch_index: u32,
    /// Records handled so far in this run.
    pub processed_count: u64,
    pub last_synced_id: Option<String>,
    /// Entity table `cursor` refers to. `None` means the first table.
    pub entity: Option<String>,
    /// Sequence of the last processed record; the next batch starts after it.
    pub cursor: i64,
    /// Time of the last completed pull, used for incremental fetches.
    pub last_sync_time: Option<DateTime<Utc>>,
    pub completed: bool,
    pub pulled_count: u64,
    pub failed_count: u64,
}

impl SyncCheckpoint {
    pub fn new() -> Self {
        Self::default()
    }

    /// Starts a new run, carrying over only the incremental pull marker.
    pub fn next_run(previous: Option<&SyncCheckpoint>) -> Self {
        Self {
            last_sync_time: previous.and_then(|c| c.last_sync_time),
            ..Self::default()
        }
    }

    /// Whether a stored checkpoint describes an interrupted run.
    pub fn is_resumable(&self) -> bool {
        !self.completed && (self.processed_count > 0 || self.cursor > 0 || self.batch_index > 0)
    }
}
