//! Lifecycle events for UI consumers.

use serde::Serialize;
use tokio::sync::broadcast;

/// Something the sync core wants observers to know about.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event")]
pub enum SyncEvent {
    #[serde(rename = "SYNC_STARTED")]
    Started { services: Vec<String> },
    #[serde(rename = "SYNC_PROGRESS")]
    Progress {
        service: String,
        percent: f64,
        processed: u64,
        total: u64,
    },
    #[serde(rename = "SYNC_COMPLETED")]
    Completed { success: bool, processed: u64 },
    #[serde(rename = "SYNC_ERROR")]
    Error { service: String, message: String },
    #[serde(rename = "SYNC_CONFLICT_DETECTED")]
    ConflictDetected {
        conflict_id: String,
        table: String,
        local_id: Option<String>,
    },
    #[serde(rename = "SYNC_CONFLICT_RESOLVED")]
    ConflictResolved {
        conflict_id: String,
        resolution: String,
    },
}

impl SyncEvent {
    pub fn name(&self) -> &'static str {
        match self {
            SyncEvent::Started { .. } => "SYNC_STARTED",
            SyncEvent::Progress { .. } => "SYNC_PROGRESS",
            SyncEvent::Completed { .. } => "SYNC_COMPLETED",
            SyncEvent::Error { .. } => "SYNC_ERROR",
            SyncEvent::ConflictDetected { .. } => "SYNC_CONFLICT_DETECTED",
            SyncEvent::ConflictResolved { .. } => "SYNC_CONFLICT_RESOLVED",
        }
    }
}

const EVENT_CAPACITY: usize = 256;

/// Broadcast fan-out. Emitting with no subscribers is a no-op.
#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<SyncEvent>,
}

impl EventBus {
    pub fn new() -> Self {
        let (tx, _rx) = broadcast::channel(EVENT_CAPACITY);
        Self { tx }
    }

    pub fn emit(&self, event: SyncEvent) {
        tracing::trace!(event = event.name(), "Emitting sync event");
        let _ = self.tx.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SyncEvent> {
        self.tx.subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}
