//! Sync core: the offline mutation queue, the per-domain sync contract, the
//! conflict policy and the orchestrator that drives them.
//!
//! # Flow
//!
//! A write is attempted through [`OfflineMutationQueue::execute_or_enqueue`]
//! or recorded locally by a [`TableSyncService`]. When the device comes back
//! online the [`ConnectivityMonitor`] wakes the reconnect listener, which
//! drains the queue and runs [`SyncOrchestrator::synchronize_all`]. Services
//! are visited one at a time in priority order and each persists a
//! [`SyncCheckpoint`](crate::models::SyncCheckpoint) after every batch.

pub mod conflict;
pub mod connectivity;
pub mod domains;
pub mod events;
pub mod orchestrator;
pub mod queue;
pub mod remote;
pub mod service;
pub mod table_sync;

pub use conflict::{ConflictResolver, FieldMergePolicy, LedgerMergePolicy, Resolution};
pub use connectivity::{Connectivity, ConnectivityMonitor};
pub use domains::{standard_resolver, standard_services};
pub use events::{EventBus, SyncEvent};
pub use orchestrator::{DomainResult, SkipReason, SyncOrchestrator, SyncReport};
pub use queue::{ExecuteOutcome, OfflineMutationQueue, QueueSettings};
pub use remote::{ApiResponse, DisconnectedApi, HttpApiClient, RemoteApi, RequestOptions};
pub use service::{DomainSyncService, RunContext};
pub use table_sync::{EntityTable, ServiceDeps, TableSyncService};

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Process-wide "at most one at a time" flag.
#[derive(Debug, Clone, Default)]
pub struct SingleFlight {
    busy: Arc<AtomicBool>,
}

/// Holds the flag until dropped.
#[derive(Debug)]
pub struct FlightGuard {
    busy: Arc<AtomicBool>,
}

impl SingleFlight {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns `None` if another holder is active.
    pub fn try_acquire(&self) -> Option<FlightGuard> {
        self.busy
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| FlightGuard {
                busy: self.busy.clone(),
            })
    }

    pub fn is_busy(&self) -> bool {
        self.busy.load(Ordering::Acquire)
    }
}

impl Drop for FlightGuard {
    fn drop(&mut self) {
        self.busy.store(false, Ordering::Release);
    }
}
