//! Offline-first synchronization engine.
//!
//! Local writes land in SQLite and, when the network is unavailable, in a
//! durable mutation queue. Once connectivity returns the orchestrator drains
//! the queue and walks every registered domain service in priority order,
//! pushing dirty records, pulling remote changes and checkpointing progress
//! after every batch.
//!
//! ```no_run
//! use fieldsync::{EngineConfig, SyncEngine, SyncOptions};
//!
//! # async fn run() -> fieldsync::Result<()> {
//! let config = EngineConfig::load(None).expect("config");
//! let engine = SyncEngine::open(config).await?;
//! engine.connectivity().set_online(true);
//!
//! let report = engine.synchronize_all(SyncOptions::default()).await;
//! println!("synced {} records", report.processed);
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod db;
pub mod engine;
pub mod error;
pub mod models;
pub mod sync;

#[cfg(test)]
pub(crate) mod testing;

pub use config::{EngineConfig, RunMode, SyncOptions};
pub use engine::SyncEngine;
pub use error::{Result, SyncError};
pub use models::{
    BusinessDomain, ConflictRecord, ConflictStrategy, MutationOperation, MutationQueueItem,
    MutationStatus, NewMutation, Payload, RemoteRecord, SyncCheckpoint, SyncPriority, SyncStatus,
    SyncableRecord,
};
pub use sync::{
    ConnectivityMonitor, DomainSyncService, EventBus, ExecuteOutcome, OfflineMutationQueue,
    SyncEvent, SyncOrchestrator, SyncReport, TableSyncService,
};

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Get the version of the library
pub fn version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}

/// Installs a fmt subscriber filtered by `RUST_LOG`, falling back to
/// `default_filter`. Returns false if a global subscriber already exists.
pub fn init_tracing(default_filter: &str) -> bool {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| default_filter.into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .try_init()
        .is_ok()
}
