//! Durable offline mutation queue.
//!
//! Items are persisted before `enqueue` returns and move through
//! `pending -> processing -> {completed | failed | conflict}`. A failed
//! attempt puts the item back to pending behind an exponential backoff until
//! its retry budget is spent.

use chrono::{DateTime, Utc};
use rand::Rng;
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

use super::conflict::merge_values;
use super::connectivity::Connectivity;
use super::events::{EventBus, SyncEvent};
use super::remote::{ApiResponse, RemoteApi, RequestOptions};
use super::SingleFlight;
use crate::config::{EngineConfig, RunMode};
use crate::db::{ConflictRepository, MutationQueueRepository, QueueFilter, RecordStore};
use crate::error::{with_deadline, Result, SyncError};
use crate::models::{
    ConflictRecord, ConflictStrategy, MutationOperation, MutationQueueItem, MutationStatus,
    NewMutation,
};

/// Connectivity is re-checked after this many dispatched items.
const CONNECTIVITY_CHECK_INTERVAL: usize = 5;
/// Rows fetched per round while draining.
const DRAIN_PAGE_SIZE: usize = 100;

/// Retry and dispatch tuning.
#[derive(Debug, Clone)]
pub struct QueueSettings {
    pub max_retries: u32,
    pub base_backoff: Duration,
    pub max_backoff: Duration,
    /// How long completed items are kept before being purged.
    pub audit_retention: Duration,
    pub request_timeout: Duration,
    pub compress: bool,
}

impl Default for QueueSettings {
    fn default() -> Self {
        Self {
            max_retries: 5,
            base_backoff: Duration::from_secs(1),
            max_backoff: Duration::from_secs(300),
            audit_retention: Duration::ZERO,
            request_timeout: Duration::from_secs(30),
            compress: true,
        }
    }
}

impl QueueSettings {
    pub fn from_config(config: &EngineConfig) -> Self {
        Self {
            max_retries: config.queue.max_retries,
            base_backoff: Duration::from_millis(config.queue.base_backoff_ms),
            max_backoff: Duration::from_millis(config.queue.max_backoff_ms),
            audit_retention: config.queue.audit_retention(),
            request_timeout: config.network_timeout(),
            compress: config.compression_enabled,
        }
    }
}

/// Result of [`OfflineMutationQueue::execute_or_enqueue`].
#[derive(Debug, Clone)]
pub enum ExecuteOutcome {
    Sent(ApiResponse),
    Queued(MutationQueueItem),
}

pub struct OfflineMutationQueue {
    repo: MutationQueueRepository,
    conflicts: ConflictRepository,
    remote: Arc<dyn RemoteApi>,
    connectivity: Arc<dyn Connectivity>,
    events: EventBus,
    settings: QueueSettings,
    run_mode: RunMode,
    flight: SingleFlight,
}

impl OfflineMutationQueue {
    pub fn new(
        store: RecordStore,
        remote: Arc<dyn RemoteApi>,
        connectivity: Arc<dyn Connectivity>,
        events: EventBus,
        settings: QueueSettings,
    ) -> Self {
        Self {
            repo: MutationQueueRepository::new(store.clone()),
            conflicts: ConflictRepository::new(store),
            remote,
            connectivity,
            events,
            settings,
            run_mode: RunMode::default(),
            flight: SingleFlight::new(),
        }
    }

    pub fn with_run_mode(mut self, run_mode: RunMode) -> Self {
        self.run_mode = run_mode;
        self
    }

    pub fn settings(&self) -> &QueueSettings {
        &self.settings
    }

    /// True while a drain is running.
    pub fn is_processing(&self) -> bool {
        self.flight.is_busy()
    }

    fn is_online(&self) -> bool {
        self.run_mode.allows_network() && self.connectivity.is_connected()
    }

    fn build_item(&self, mutation: NewMutation) -> Result<MutationQueueItem> {
        if mutation.endpoint.trim().is_empty() {
            return Err(SyncError::Validation("mutation endpoint is required".to_string()));
        }
        let operation = mutation
            .operation
            .ok_or_else(|| SyncError::Validation("mutation operation is required".to_string()))?;
        if mutation.table.trim().is_empty() {
            return Err(SyncError::Validation("mutation table is required".to_string()));
        }

        Ok(MutationQueueItem {
            id: Uuid::new_v4().to_string(),
            endpoint: mutation.endpoint,
            table: mutation.table,
            local_id: mutation.local_id,
            remote_id: mutation.remote_id,
            operation,
            payload: mutation.payload,
            priority: mutation
                .priority
                .unwrap_or_else(NewMutation::default_priority),
            status: MutationStatus::Pending,
            retries: 0,
            max_retries: mutation.max_retries.unwrap_or(self.settings.max_retries),
            created_at: Utc::now(),
            last_attempt_at: None,
            next_attempt_at: None,
            error_message: None,
            conflict_resolution: mutation.conflict_resolution.unwrap_or_default(),
        })
    }

    /// Validates and persists a mutation. The item is durable once this returns.
    pub async fn enqueue(&self, mutation: NewMutation) -> Result<MutationQueueItem> {
        let item = self.build_item(mutation)?;
        self.repo.insert(&item).await?;
        tracing::debug!(
            id = %item.id,
            operation = %item.operation,
            endpoint = %item.endpoint,
            priority = item.priority,
            "Mutation enqueued"
        );
        Ok(item)
    }

    /// Items in dispatch order: lowest priority rank first, then oldest.
    /// A lower `priority` number means more urgent, so `1` goes before `3`.
    ///
    /// With no status, pending items are returned (plus failed ones when
    /// `force_all`). Exhausted items are excluded unless `force_all`.
    pub async fn dequeue_batch(
        &self,
        status: Option<MutationStatus>,
        limit: usize,
        force_all: bool,
    ) -> Result<Vec<MutationQueueItem>> {
        let statuses = match status {
            Some(status) => vec![status],
            None if force_all => vec![MutationStatus::Pending, MutationStatus::Failed],
            None => vec![MutationStatus::Pending],
        };
        self.repo
            .select(&QueueFilter {
                statuses,
                limit,
                include_exhausted: force_all,
                due_at: None,
                exclude_ids: Vec::new(),
            })
            .await
    }

    pub async fn get(&self, id: &str) -> Result<Option<MutationQueueItem>> {
        self.repo.get(id).await
    }

    pub async fn mark_processing(&self, id: &str) -> Result<()> {
        if !self.repo.set_processing(id, Utc::now()).await? {
            return Err(SyncError::NotFound(format!("mutation {}", id)));
        }
        Ok(())
    }

    pub async fn mark_completed(&self, id: &str, remote_id: Option<&str>) -> Result<()> {
        if !self.repo.set_completed(id, remote_id).await? {
            return Err(SyncError::NotFound(format!("mutation {}", id)));
        }
        Ok(())
    }

    /// Records a failed attempt and schedules the next one.
    pub async fn mark_failed(&self, id: &str, error: &str) -> Result<MutationQueueItem> {
        let current = self.repo.require(id).await?;
        let delay = self.backoff_delay(current.retries + 1);
        let next_attempt_at =
            Utc::now() + chrono::Duration::milliseconds(delay.as_millis() as i64);

        let item = self.repo.record_failure(id, error, next_attempt_at).await?;
        if item.status == MutationStatus::Failed {
            tracing::warn!(id, retries = item.retries, error, "Mutation failed permanently");
        } else {
            tracing::debug!(id, retries = item.retries, ?delay, "Mutation will be retried");
        }
        Ok(item)
    }

    /// `base * 2^(attempt-1)`, capped, plus up to 25% jitter.
    fn backoff_delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(20);
        let base = self
            .settings
            .base_backoff
            .saturating_mul(1u32 << exponent)
            .min(self.settings.max_backoff);
        let spread = (base.as_millis() / 4) as u64;
        let jitter = if spread > 0 {
            rand::rng().random_range(0..=spread)
        } else {
            0
        };
        (base + Duration::from_millis(jitter)).min(self.settings.max_backoff.max(base))
    }

    fn request_options(&self) -> RequestOptions {
        RequestOptions::default()
            .with_timeout(self.settings.request_timeout)
            .compressed(self.settings.compress)
    }

    async fn dispatch(&self, item: &MutationQueueItem) -> Result<ApiResponse> {
        let opts = self.request_options();
        let endpoint = item.endpoint.as_str();
        let call = async {
            match item.operation {
                MutationOperation::Create | MutationOperation::Custom => {
                    self.remote.post(endpoint, &item.payload, &opts).await
                }
                MutationOperation::Update => self.remote.put(endpoint, &item.payload, &opts).await,
                MutationOperation::Delete => self.remote.delete(endpoint, &opts).await,
            }
        };
        with_deadline(self.settings.request_timeout, endpoint, call).await
    }

    /// Drains the queue. Returns the number of successfully dispatched items.
    ///
    /// Only one drain runs at a time; a concurrent call returns 0 at once.
    /// Connectivity is checked up front and every few items. When it drops
    /// the drain stops and the remaining items stay pending.
    pub async fn process_queue(&self, force_all: bool) -> Result<usize> {
        let Some(_guard) = self.flight.try_acquire() else {
            tracing::debug!("Queue drain already running");
            return Ok(0);
        };

        if !self.is_online() {
            tracing::debug!("Offline, queue drain skipped");
            return Ok(0);
        }

        let statuses = if force_all {
            vec![MutationStatus::Pending, MutationStatus::Failed]
        } else {
            vec![MutationStatus::Pending]
        };

        let mut seen = HashSet::new();
        let mut attempted = 0usize;
        let mut succeeded = 0usize;

        'drain: loop {
            let batch = self
                .repo
                .select(&QueueFilter {
                    statuses: statuses.clone(),
                    limit: DRAIN_PAGE_SIZE,
                    include_exhausted: force_all,
                    due_at: if force_all { None } else { Some(Utc::now()) },
                    exclude_ids: seen.iter().cloned().collect(),
                })
                .await?;
            if batch.is_empty() {
                break;
            }

            for item in batch {
                if attempted > 0
                    && attempted % CONNECTIVITY_CHECK_INTERVAL == 0
                    && !self.is_online()
                {
                    tracing::info!(attempted, succeeded, "Connectivity lost, pausing queue drain");
                    break 'drain;
                }
                seen.insert(item.id.clone());
                attempted += 1;

                self.mark_processing(&item.id).await?;
                match self.dispatch(&item).await {
                    Ok(response) => {
                        let remote_id = response.remote_id().or_else(|| item.remote_id.clone());
                        self.mark_completed(&item.id, remote_id.as_deref()).await?;
                        succeeded += 1;
                    }
                    Err(SyncError::Connectivity) => {
                        self.repo.revert_to_pending(&item.id).await?;
                        tracing::info!(id = %item.id, "Network unavailable, queue drain stopped");
                        break 'drain;
                    }
                    Err(err) if err.is_conflict() => {
                        let remote_payload = conflict_body(&err);
                        self.handle_conflict(&item, remote_payload).await?;
                    }
                    Err(err) => {
                        self.mark_failed(&item.id, &err.to_string()).await?;
                    }
                }
            }
        }

        self.purge_completed(self.settings.audit_retention).await?;
        tracing::info!(attempted, succeeded, "Queue drain finished");
        Ok(succeeded)
    }

    /// Persists a conflict for `item` and parks it.
    ///
    /// Unless the item asked for manual resolution, the conflict is resolved
    /// right away with the item's strategy.
    pub async fn handle_conflict(
        &self,
        item: &MutationQueueItem,
        remote_payload: Value,
    ) -> Result<ConflictRecord> {
        let record = ConflictRecord {
            id: Uuid::new_v4().to_string(),
            queue_item_id: Some(item.id.clone()),
            table: item.table.clone(),
            local_id: item.local_id.clone(),
            domain: None,
            local_payload: item.payload.clone(),
            remote_payload,
            resolution: None,
            created_at: Utc::now(),
            resolved_at: None,
        };
        self.conflicts.insert(&record).await?;
        self.repo
            .set_conflict(&item.id, "Remote version diverged")
            .await?;

        tracing::warn!(id = %item.id, table = %item.table, conflict = %record.id, "Mutation conflict");
        self.events.emit(SyncEvent::ConflictDetected {
            conflict_id: record.id.clone(),
            table: item.table.clone(),
            local_id: item.local_id.clone(),
        });

        if item.conflict_resolution == ConflictStrategy::Ask {
            return Ok(record);
        }
        self.resolve_conflict(&record.id, item.conflict_resolution)
            .await
    }

    /// Externally resolves a parked mutation conflict.
    pub async fn resolve_conflict(
        &self,
        conflict_id: &str,
        strategy: ConflictStrategy,
    ) -> Result<ConflictRecord> {
        let conflict = self
            .conflicts
            .get(conflict_id)
            .await?
            .ok_or_else(|| SyncError::NotFound(format!("conflict {}", conflict_id)))?;
        if conflict.is_resolved() {
            return Err(SyncError::Validation(format!(
                "conflict {} is already resolved",
                conflict_id
            )));
        }
        let item_id = conflict.queue_item_id.as_deref().ok_or_else(|| {
            SyncError::Validation(format!(
                "conflict {} is not attached to a queued mutation",
                conflict_id
            ))
        })?;
        let item = self.repo.require(item_id).await?;

        match strategy {
            ConflictStrategy::Remote => {
                let remote_id = conflict
                    .remote_payload
                    .get("id")
                    .and_then(Value::as_str)
                    .map(str::to_string);
                self.repo.set_completed(&item.id, remote_id.as_deref()).await?;
            }
            ConflictStrategy::Local => {
                let payload = rebase(&conflict.local_payload, &conflict.remote_payload);
                self.repo.requeue(&item.id, &payload, item.operation).await?;
            }
            ConflictStrategy::Merge => {
                let merged = merge_values(&conflict.local_payload, &conflict.remote_payload);
                let payload = rebase(&merged, &conflict.remote_payload);
                self.repo.requeue(&item.id, &payload, item.operation).await?;
            }
            ConflictStrategy::Ask => {
                return Err(SyncError::Validation(
                    "'ask' defers a conflict and cannot resolve one".to_string(),
                ));
            }
        }

        let now = Utc::now();
        self.conflicts.mark_resolved(conflict_id, strategy, now).await?;
        tracing::info!(conflict = conflict_id, %strategy, "Mutation conflict resolved");
        self.events.emit(SyncEvent::ConflictResolved {
            conflict_id: conflict_id.to_string(),
            resolution: strategy.to_string(),
        });

        Ok(ConflictRecord {
            resolution: Some(strategy),
            resolved_at: Some(now),
            ..conflict
        })
    }

    /// Sends directly when online; queues when offline or on a transient failure.
    pub async fn execute_or_enqueue(&self, mutation: NewMutation) -> Result<ExecuteOutcome> {
        let item = self.build_item(mutation)?;

        if !self.is_online() {
            self.repo.insert(&item).await?;
            tracing::debug!(id = %item.id, "Offline, mutation queued");
            return Ok(ExecuteOutcome::Queued(item));
        }

        match self.dispatch(&item).await {
            Ok(response) => Ok(ExecuteOutcome::Sent(response)),
            Err(err) if err.is_transient() => {
                tracing::info!(endpoint = %item.endpoint, error = %err, "Direct call failed, mutation queued");
                self.repo.insert(&item).await?;
                Ok(ExecuteOutcome::Queued(item))
            }
            Err(err) if err.is_conflict() => {
                self.repo.insert(&item).await?;
                self.handle_conflict(&item, conflict_body(&err)).await?;
                let parked = self.repo.require(&item.id).await?;
                Ok(ExecuteOutcome::Queued(parked))
            }
            Err(err) => Err(err),
        }
    }

    /// Startup recovery for items a killed process left in `processing`.
    pub async fn recover_interrupted(&self) -> Result<u64> {
        let recovered = self.repo.reset_processing().await?;
        if recovered > 0 {
            tracing::info!(recovered, "Recovered interrupted mutations");
        }
        Ok(recovered)
    }

    /// Drops completed items older than `retention`.
    pub async fn purge_completed(&self, retention: Duration) -> Result<u64> {
        let cutoff: DateTime<Utc> =
            Utc::now() - chrono::Duration::milliseconds(retention.as_millis() as i64);
        self.repo.delete_completed(cutoff).await
    }

    /// Number of stored items in any status.
    pub async fn len(&self) -> Result<u64> {
        self.repo.count().await
    }

    pub async fn is_empty(&self) -> Result<bool> {
        Ok(self.len().await? == 0)
    }

    pub async fn count_by_status(&self) -> Result<HashMap<MutationStatus, u64>> {
        self.repo.count_by_status().await
    }

    /// Gives permanently failed items a fresh retry budget.
    pub async fn retry_failed(&self) -> Result<u64> {
        self.repo.reset_failed().await
    }

    pub async fn open_conflicts(&self) -> Result<Vec<ConflictRecord>> {
        self.conflicts.list_open().await
    }
}

/// A 409 body is the server's current version of the resource.
fn conflict_body(err: &SyncError) -> Value {
    match err {
        SyncError::Remote { body, .. } => {
            serde_json::from_str(body).unwrap_or_else(|_| Value::String(body.clone()))
        }
        _ => Value::Null,
    }
}

/// Points a re-queued payload at the remote version it now supersedes.
fn rebase(payload: &Value, remote: &Value) -> Value {
    let mut payload = payload.clone();
    if let (Value::Object(map), Some(version)) = (&mut payload, remote.get("version")) {
        map.insert("baseVersion".to_string(), version.clone());
    }
    payload
}
