//! The contract every business domain implements.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio_util::sync::CancellationToken;

use super::conflict::Resolution;
use crate::db::CheckpointRepository;
use crate::error::Result;
use crate::models::{
    BusinessDomain, ConflictStrategy, DomainServiceDescriptor, RemoteRecord, SyncCheckpoint,
    SyncableRecord,
};

/// Per-run settings handed to every batch call.
#[derive(Debug, Clone, Default)]
pub struct RunContext {
    /// Fires when the orchestrator run is cancelled.
    pub cancel: CancellationToken,
    pub force_full_sync: bool,
    pub compression_enabled: bool,
}

impl RunContext {
    pub fn new(force_full_sync: bool, compression_enabled: bool) -> Self {
        Self {
            cancel: CancellationToken::new(),
            force_full_sync,
            compression_enabled,
        }
    }
}

/// Synchronization of one business domain's tables against the server.
///
/// Implementations must never overwrite a dirty local record during a pull,
/// and a batch call interrupted by connectivity loss or cancellation must
/// return its partial progress with `completed = false` instead of failing.
#[async_trait]
pub trait DomainSyncService: Send + Sync {
    fn descriptor(&self) -> &DomainServiceDescriptor;

    fn checkpoints(&self) -> &CheckpointRepository;

    /// Idempotent local table bootstrap.
    async fn ensure_local_structure(&self) -> Result<()>;

    /// Fetches records changed since `last_sync_time` and upserts them.
    /// Returns the number of local rows that changed.
    async fn pull_from_server(
        &self,
        force_full_sync: bool,
        last_sync_time: Option<DateTime<Utc>>,
    ) -> Result<u64>;

    /// Pushes dirty records, or every live record when `only_modified` is false.
    async fn push_to_server(&self, only_modified: bool) -> Result<u64>;

    /// Push then pull. Returns false if the run could not finish.
    async fn synchronize(&self, force_full_sync: bool) -> Result<bool>;

    /// Processes at most `batch_size` unsynced records after the checkpoint
    /// cursor. The call that drains the last record also pulls and returns
    /// a checkpoint with `completed = true`.
    async fn synchronize_batch(
        &self,
        batch_index: u32,
        batch_size: usize,
        checkpoint: SyncCheckpoint,
        run: &RunContext,
    ) -> Result<SyncCheckpoint>;

    /// Pure resolution of one divergent record.
    fn resolve_conflict(
        &self,
        local: &SyncableRecord,
        remote: &RemoteRecord,
        strategy: ConflictStrategy,
    ) -> Resolution;

    /// Externally resolves a conflict parked under the `ask` strategy.
    async fn resolve_record_conflict(
        &self,
        conflict_id: &str,
        strategy: ConflictStrategy,
    ) -> Result<()>;

    /// Records still waiting to be pushed.
    async fn pending_count(&self) -> Result<u64>;

    fn priority(&self) -> i32 {
        self.descriptor().priority
    }

    fn business_domain(&self) -> BusinessDomain {
        self.descriptor().domain
    }

    fn business_entities(&self) -> &[String] {
        &self.descriptor().entities
    }

    fn user_friendly_name(&self) -> &str {
        &self.descriptor().display_name
    }

    fn service_name(&self) -> String {
        self.descriptor().service_name()
    }

    async fn save_checkpoint(&self, checkpoint: &SyncCheckpoint) -> Result<()> {
        self.checkpoints()
            .save(&self.service_name(), checkpoint)
            .await
    }

    async fn load_checkpoint(&self) -> Result<Option<SyncCheckpoint>> {
        self.checkpoints().load(&self.service_name()).await
    }

    async fn reset_checkpoint(&self) -> Result<()> {
        self.checkpoints().delete(&self.service_name()).await?;
        Ok(())
    }
}
