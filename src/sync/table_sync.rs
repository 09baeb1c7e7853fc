//! Generic domain service over a set of entity tables that share the
//! record envelope (`local_id`, `remote_id`, `version`, `dirty`, ...).

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

use super::conflict::{detect_create_collision, detect_record_conflict, ConflictResolver, Resolution};
use super::connectivity::Connectivity;
use super::events::{EventBus, SyncEvent};
use super::remote::{with_query, ApiResponse, RemoteApi, RequestOptions};
use super::service::{DomainSyncService, RunContext};
use crate::config::RunMode;
use crate::db::{ApplyOutcome, CheckpointRepository, ConflictRepository, RecordRepository, RecordStore};
use crate::error::{with_deadline, Result, SyncError};
use crate::models::{
    ConflictRecord, ConflictStrategy, DomainServiceDescriptor, Payload, RemoteRecord,
    SyncCheckpoint, SyncableRecord,
};

const PUSH_PAGE_SIZE: usize = 200;

/// Collaborators shared by every domain service.
#[derive(Clone)]
pub struct ServiceDeps {
    pub store: RecordStore,
    pub remote: Arc<dyn RemoteApi>,
    pub connectivity: Arc<dyn Connectivity>,
    pub resolver: Arc<ConflictResolver>,
    pub events: EventBus,
    pub run_mode: RunMode,
    pub request_timeout: Duration,
    pub compress: bool,
}

/// One synced table and its REST resource.
#[derive(Debug, Clone)]
pub struct EntityTable {
    pub table: String,
    pub endpoint: String,
    /// Payload field that identifies the record on both sides before it has
    /// a remote id.
    pub natural_key: Option<String>,
    /// Overrides the resolver's strategy for this table.
    pub strategy: Option<ConflictStrategy>,
}

impl EntityTable {
    pub fn new(table: impl Into<String>, endpoint: impl Into<String>) -> Self {
        Self {
            table: table.into(),
            endpoint: endpoint.into(),
            natural_key: None,
            strategy: None,
        }
    }

    pub fn with_natural_key(mut self, field: impl Into<String>) -> Self {
        self.natural_key = Some(field.into());
        self
    }

    pub fn with_strategy(mut self, strategy: ConflictStrategy) -> Self {
        self.strategy = Some(strategy);
        self
    }

    fn record_endpoint(&self, remote_id: &str) -> String {
        format!(
            "{}/{}",
            self.endpoint.trim_end_matches('/'),
            urlencoding::encode(remote_id)
        )
    }
}

/// What happened to one pushed record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PushOutcome {
    Synced,
    /// Left dirty for a later run.
    Retry,
    /// Parked until an external resolution call.
    Deferred,
}

pub struct TableSyncService {
    descriptor: DomainServiceDescriptor,
    tables: Vec<EntityTable>,
    records: RecordRepository,
    checkpoints: CheckpointRepository,
    conflicts: ConflictRepository,
    deps: ServiceDeps,
}

impl TableSyncService {
    /// The descriptor's entity list is replaced by the table names.
    pub fn new(descriptor: DomainServiceDescriptor, tables: Vec<EntityTable>, deps: ServiceDeps) -> Self {
        let descriptor = descriptor.with_entities(tables.iter().map(|t| t.table.clone()));
        Self {
            descriptor,
            records: RecordRepository::new(deps.store.clone()),
            checkpoints: CheckpointRepository::new(deps.store.clone()),
            conflicts: ConflictRepository::new(deps.store.clone()),
            tables,
            deps,
        }
    }

    pub fn tables(&self) -> &[EntityTable] {
        &self.tables
    }

    pub fn records(&self) -> &RecordRepository {
        &self.records
    }

    fn entity(&self, table: &str) -> Result<&EntityTable> {
        self.tables
            .iter()
            .find(|t| t.table == table)
            .ok_or_else(|| {
                SyncError::Validation(format!(
                    "table '{}' is not part of {}",
                    table,
                    self.service_name()
                ))
            })
    }

    fn is_online(&self) -> bool {
        self.deps.run_mode.allows_network() && self.deps.connectivity.is_connected()
    }

    fn options(&self, compress: bool) -> RequestOptions {
        RequestOptions::default()
            .with_timeout(self.deps.request_timeout)
            .compressed(compress)
    }

    fn strategy_for(&self, entity: &EntityTable) -> ConflictStrategy {
        entity.strategy.unwrap_or_else(|| {
            self.deps
                .resolver
                .strategy_for(self.descriptor.domain, &entity.table)
        })
    }

    /// Records a local create or edit. The record is pushed on the next sync.
    pub async fn save_local(
        &self,
        table: &str,
        local_id: Option<&str>,
        payload: Payload,
    ) -> Result<SyncableRecord> {
        let entity = self.entity(table)?;
        let natural_key = entity
            .natural_key
            .as_deref()
            .and_then(|field| payload.get(field))
            .map(|value| match value {
                Value::String(s) => s.clone(),
                other => other.to_string(),
            });
        self.records
            .save_local(table, local_id, &payload, natural_key.as_deref())
            .await
    }

    pub async fn delete_local(&self, table: &str, local_id: &str) -> Result<()> {
        self.entity(table)?;
        self.records.delete_local(table, local_id).await
    }

    async fn call<F>(&self, what: &str, fut: F) -> Result<ApiResponse>
    where
        F: Future<Output = Result<ApiResponse>> + Send,
    {
        with_deadline(self.deps.request_timeout, what, fut).await
    }

    /// Pushes one record and settles its local state.
    async fn push_record(
        &self,
        entity: &EntityTable,
        record: &SyncableRecord,
        compress: bool,
    ) -> Result<PushOutcome> {
        let opts = self.options(compress);

        if record.deleted {
            if let Some(remote_id) = &record.remote_id {
                let endpoint = entity.record_endpoint(remote_id);
                match self
                    .call(&endpoint, self.deps.remote.delete(&endpoint, &opts))
                    .await
                {
                    Ok(_) | Err(SyncError::Remote { status: 404, .. }) => {}
                    Err(err) => return Err(err),
                }
            }
            self.records.remove(&entity.table, &record.local_id).await?;
            return Ok(PushOutcome::Synced);
        }

        let result = match &record.remote_id {
            None => {
                let body = Value::Object(record.payload.clone());
                self.call(&entity.endpoint, self.deps.remote.post(&entity.endpoint, &body, &opts))
                    .await
            }
            Some(remote_id) => {
                let endpoint = entity.record_endpoint(remote_id);
                let body = versioned_body(&record.payload, record.base_version);
                self.call(&endpoint, self.deps.remote.put(&endpoint, &body, &opts))
                    .await
            }
        };

        match result {
            Ok(response) => {
                let remote = remote_from_response(&response, record);
                self.records
                    .mark_synced(
                        &entity.table,
                        &record.local_id,
                        &remote.id,
                        remote.version,
                        remote.updated_at,
                        record.updated_at,
                    )
                    .await?;
                Ok(PushOutcome::Synced)
            }
            Err(err) if err.is_conflict() => {
                let remote = match &err {
                    SyncError::Remote { body, .. } => serde_json::from_str::<Value>(body)
                        .ok()
                        .and_then(|v| RemoteRecord::from_value(v).ok()),
                    _ => None,
                };
                let Some(remote) = remote else {
                    tracing::warn!(table = %entity.table, local_id = %record.local_id, "Conflict without a remote record body");
                    self.records.mark_failed(&entity.table, &record.local_id).await?;
                    return Ok(PushOutcome::Retry);
                };

                let diverged = if record.is_new() {
                    detect_create_collision(entity.natural_key.as_deref(), &record.payload, &remote)
                        || entity.natural_key.is_none()
                } else {
                    detect_record_conflict(record, &remote)
                };
                if !diverged {
                    tracing::warn!(table = %entity.table, local_id = %record.local_id, "Server rejected a push that does not diverge");
                    self.records.mark_failed(&entity.table, &record.local_id).await?;
                    return Ok(PushOutcome::Retry);
                }

                self.handle_conflict(entity, record, &remote, compress).await
            }
            Err(err) => Err(err),
        }
    }

    async fn handle_conflict(
        &self,
        entity: &EntityTable,
        record: &SyncableRecord,
        remote: &RemoteRecord,
        compress: bool,
    ) -> Result<PushOutcome> {
        let strategy = self.strategy_for(entity);
        let conflict = ConflictRecord {
            id: Uuid::new_v4().to_string(),
            queue_item_id: None,
            table: entity.table.clone(),
            local_id: Some(record.local_id.clone()),
            domain: Some(self.descriptor.domain.to_string()),
            local_payload: Value::Object(record.payload.clone()),
            remote_payload: serde_json::to_value(remote)?,
            resolution: None,
            created_at: Utc::now(),
            resolved_at: None,
        };
        self.conflicts.insert(&conflict).await?;

        tracing::warn!(
            table = %entity.table,
            local_id = %record.local_id,
            remote_id = %remote.id,
            %strategy,
            "Sync conflict detected"
        );
        self.deps.events.emit(SyncEvent::ConflictDetected {
            conflict_id: conflict.id.clone(),
            table: entity.table.clone(),
            local_id: Some(record.local_id.clone()),
        });

        let outcome = match self.resolve_conflict(record, remote, strategy) {
            Resolution::Deferred(_) => {
                self.records
                    .mark_conflict(&entity.table, &record.local_id)
                    .await?;
                return Ok(PushOutcome::Deferred);
            }
            Resolution::Resolved { payload, push: false } => {
                self.records
                    .apply_resolution(&entity.table, &record.local_id, &payload, remote, false)
                    .await?;
                PushOutcome::Synced
            }
            Resolution::Resolved { payload, push: true } => {
                self.records
                    .apply_resolution(&entity.table, &record.local_id, &payload, remote, true)
                    .await?;
                self.repush(entity, &record.local_id, compress).await?
            }
        };

        self.conflicts
            .mark_resolved(&conflict.id, strategy, Utc::now())
            .await?;
        self.deps.events.emit(SyncEvent::ConflictResolved {
            conflict_id: conflict.id,
            resolution: strategy.to_string(),
        });
        Ok(outcome)
    }

    /// Second push of a resolved payload against the remote version.
    async fn repush(&self, entity: &EntityTable, local_id: &str, compress: bool) -> Result<PushOutcome> {
        let Some(record) = self.records.get(&entity.table, local_id).await? else {
            return Ok(PushOutcome::Synced);
        };
        let Some(remote_id) = record.remote_id.clone() else {
            return Ok(PushOutcome::Retry);
        };

        let endpoint = entity.record_endpoint(&remote_id);
        let body = versioned_body(&record.payload, record.base_version);
        let opts = self.options(compress);
        match self
            .call(&endpoint, self.deps.remote.put(&endpoint, &body, &opts))
            .await
        {
            Ok(response) => {
                let remote = remote_from_response(&response, &record);
                self.records
                    .mark_synced(
                        &entity.table,
                        &record.local_id,
                        &remote.id,
                        remote.version,
                        remote.updated_at,
                        record.updated_at,
                    )
                    .await?;
                Ok(PushOutcome::Synced)
            }
            Err(err) if err.is_conflict() || err.is_transient() => {
                tracing::info!(table = %entity.table, local_id, error = %err, "Resolved record left for the next run");
                Ok(PushOutcome::Retry)
            }
            Err(err) => Err(err),
        }
    }

    /// Push failures that should not abort the batch.
    async fn settle_failure(&self, entity: &EntityTable, record: &SyncableRecord, err: &SyncError) -> Result<()> {
        tracing::warn!(
            table = %entity.table,
            local_id = %record.local_id,
            error = %err,
            "Push failed, record stays dirty"
        );
        self.records
            .mark_failed(&entity.table, &record.local_id)
            .await
    }

    async fn all_unsynced(&self, table: &str) -> Result<Vec<SyncableRecord>> {
        let mut out = Vec::new();
        let mut cursor = 0;
        loop {
            let page = self.records.next_unsynced(table, cursor, PUSH_PAGE_SIZE).await?;
            let Some(last) = page.last() else { break };
            cursor = last.sequence;
            let full = page.len() == PUSH_PAGE_SIZE;
            out.extend(page);
            if !full {
                break;
            }
        }
        Ok(out)
    }

    async fn pull_entity(
        &self,
        entity: &EntityTable,
        since: Option<DateTime<Utc>>,
        compress: bool,
    ) -> Result<u64> {
        let endpoint = match since {
            Some(since) => with_query(&entity.endpoint, &[("updatedSince", since.to_rfc3339())]),
            None => entity.endpoint.clone(),
        };
        let opts = self.options(compress);
        let response = self
            .call(&endpoint, self.deps.remote.get(&endpoint, &opts))
            .await?;

        let mut changed = 0u64;
        let mut skipped_dirty = 0u64;
        for value in records_in(response.data) {
            let remote = match RemoteRecord::from_value(value) {
                Ok(remote) => remote,
                Err(e) => {
                    tracing::warn!(table = %entity.table, error = %e, "Skipping malformed remote record");
                    continue;
                }
            };
            match self
                .records
                .apply_remote(&entity.table, &remote, entity.natural_key.as_deref())
                .await?
            {
                ApplyOutcome::Inserted | ApplyOutcome::Updated | ApplyOutcome::Deleted => changed += 1,
                ApplyOutcome::SkippedDirty => skipped_dirty += 1,
                ApplyOutcome::Unchanged => {}
            }
        }

        tracing::debug!(table = %entity.table, changed, skipped_dirty, "Pulled remote records");
        Ok(changed)
    }

    async fn pull_all(&self, force_full_sync: bool, since: Option<DateTime<Utc>>, compress: bool) -> Result<u64> {
        let since = if force_full_sync { None } else { since };
        let mut total = 0;
        for entity in &self.tables {
            total += self.pull_entity(entity, since, compress).await?;
        }
        Ok(total)
    }
}

/// PUT body carrying the version the edit was based on.
fn versioned_body(payload: &Payload, base_version: i64) -> Value {
    let mut body = payload.clone();
    body.insert("baseVersion".to_string(), Value::from(base_version));
    Value::Object(body)
}

/// Reads the acknowledged record from a push response, falling back to what
/// is known locally when the server answers without a body.
fn remote_from_response(response: &ApiResponse, record: &SyncableRecord) -> RemoteRecord {
    RemoteRecord::from_value(response.data.clone())
        .ok()
        .unwrap_or_else(|| RemoteRecord {
            id: response
                .remote_id()
                .or_else(|| record.remote_id.clone())
                .unwrap_or_else(|| record.local_id.clone()),
            version: record.base_version + 1,
            updated_at: None,
            deleted: false,
            fields: Payload::new(),
        })
}

/// Accepts either a bare array or an envelope with `data` / `items`.
fn records_in(data: Value) -> Vec<Value> {
    match data {
        Value::Array(items) => items,
        Value::Object(mut map) => match map.remove("data").or_else(|| map.remove("items")) {
            Some(Value::Array(items)) => items,
            _ => Vec::new(),
        },
        _ => Vec::new(),
    }
}

#[async_trait]
impl DomainSyncService for TableSyncService {
    fn descriptor(&self) -> &DomainServiceDescriptor {
        &self.descriptor
    }

    fn checkpoints(&self) -> &CheckpointRepository {
        &self.checkpoints
    }

    async fn ensure_local_structure(&self) -> Result<()> {
        for entity in &self.tables {
            self.records.ensure_table(&entity.table).await?;
        }
        Ok(())
    }

    async fn pull_from_server(
        &self,
        force_full_sync: bool,
        last_sync_time: Option<DateTime<Utc>>,
    ) -> Result<u64> {
        if !self.is_online() {
            return Err(SyncError::Connectivity);
        }
        self.pull_all(force_full_sync, last_sync_time, self.deps.compress)
            .await
    }

    async fn push_to_server(&self, only_modified: bool) -> Result<u64> {
        if !self.is_online() {
            return Err(SyncError::Connectivity);
        }

        let mut pushed = 0;
        for entity in &self.tables {
            let candidates = if only_modified {
                self.all_unsynced(&entity.table).await?
            } else {
                self.records.list_live(&entity.table).await?
            };

            for record in candidates {
                if !self.is_online() {
                    tracing::info!(service = %self.service_name(), pushed, "Connectivity lost during push");
                    return Ok(pushed);
                }
                match self.push_record(entity, &record, self.deps.compress).await {
                    Ok(PushOutcome::Synced) => pushed += 1,
                    Ok(_) => {}
                    Err(SyncError::Connectivity) => return Ok(pushed),
                    Err(err) if err.is_transient() || matches!(err, SyncError::Remote { .. }) => {
                        self.settle_failure(entity, &record, &err).await?;
                    }
                    Err(err) => return Err(err),
                }
            }
        }
        Ok(pushed)
    }

    async fn synchronize(&self, force_full_sync: bool) -> Result<bool> {
        if !self.is_online() {
            return Ok(false);
        }

        let previous = self.load_checkpoint().await?;
        let pushed = self.push_to_server(true).await?;
        if !self.is_online() {
            return Ok(false);
        }

        let started = Utc::now();
        let since = previous.as_ref().and_then(|c| c.last_sync_time);
        let pulled = match self.pull_all(force_full_sync, since, self.deps.compress).await {
            Ok(pulled) => pulled,
            Err(err) if err.is_transient() => {
                tracing::info!(service = %self.service_name(), pushed, error = %err, "Pull interrupted");
                return Ok(false);
            }
            Err(err) => return Err(err),
        };

        let checkpoint = SyncCheckpoint {
            processed_count: pushed,
            pulled_count: pulled,
            last_sync_time: Some(started),
            completed: true,
            ..SyncCheckpoint::default()
        };
        self.save_checkpoint(&checkpoint).await?;
        tracing::info!(service = %self.service_name(), pushed, pulled, "Domain synchronized");
        Ok(true)
    }

    async fn synchronize_batch(
        &self,
        batch_index: u32,
        batch_size: usize,
        mut checkpoint: SyncCheckpoint,
        run: &RunContext,
    ) -> Result<SyncCheckpoint> {
        if checkpoint.completed {
            return Ok(checkpoint);
        }
        let batch_size = batch_size.max(1);
        let mut table_idx = checkpoint
            .entity
            .as_deref()
            .and_then(|name| self.tables.iter().position(|t| t.table == name))
            .unwrap_or(0);
        let mut processed = 0usize;

        while let Some(entity) = self.tables.get(table_idx) {
            if checkpoint.entity.as_deref() != Some(entity.table.as_str()) {
                checkpoint.entity = Some(entity.table.clone());
                checkpoint.cursor = 0;
            }

            let remaining = batch_size - processed;
            // One extra row tells us whether this table has more after the batch.
            let rows = self
                .records
                .next_unsynced(&entity.table, checkpoint.cursor, remaining + 1)
                .await?;
            let has_more = rows.len() > remaining;

            for record in rows.into_iter().take(remaining) {
                if run.cancel.is_cancelled() {
                    tracing::info!(service = %self.service_name(), "Batch cancelled");
                    return Ok(checkpoint);
                }
                if !self.is_online() {
                    tracing::info!(
                        service = %self.service_name(),
                        processed = checkpoint.processed_count,
                        "Connectivity lost mid-batch"
                    );
                    return Ok(checkpoint);
                }

                match self.push_record(entity, &record, run.compression_enabled).await {
                    Ok(PushOutcome::Synced) => checkpoint.processed_count += 1,
                    Ok(PushOutcome::Retry) => checkpoint.failed_count += 1,
                    Ok(PushOutcome::Deferred) => {}
                    Err(SyncError::Connectivity) => {
                        tracing::info!(service = %self.service_name(), "Network unavailable mid-batch");
                        return Ok(checkpoint);
                    }
                    Err(err) if err.is_transient() || matches!(err, SyncError::Remote { .. }) => {
                        self.settle_failure(entity, &record, &err).await?;
                        checkpoint.failed_count += 1;
                    }
                    Err(err) => return Err(err),
                }
                checkpoint.cursor = record.sequence;
                checkpoint.last_synced_id = Some(record.local_id.clone());
                processed += 1;
            }

            if has_more {
                break;
            }
            table_idx += 1;
        }

        if table_idx >= self.tables.len() {
            if run.cancel.is_cancelled() || !self.is_online() {
                return Ok(checkpoint);
            }
            let started = Utc::now();
            let pulled = match self
                .pull_all(run.force_full_sync, checkpoint.last_sync_time, run.compression_enabled)
                .await
            {
                Ok(pulled) => pulled,
                Err(err) if err.is_transient() => {
                    tracing::info!(
                        service = %self.service_name(),
                        processed = checkpoint.processed_count,
                        error = %err,
                        "Pull interrupted, batch left open"
                    );
                    return Ok(checkpoint);
                }
                Err(err) => return Err(err),
            };
            checkpoint.pulled_count += pulled;
            checkpoint.last_sync_time = Some(started);
            checkpoint.completed = true;
        }

        checkpoint.batch_index = checkpoint.batch_index.max(batch_index + 1);
        tracing::debug!(
            service = %self.service_name(),
            batch = batch_index,
            processed,
            completed = checkpoint.completed,
            "Batch finished"
        );
        Ok(checkpoint)
    }

    fn resolve_conflict(
        &self,
        local: &SyncableRecord,
        remote: &RemoteRecord,
        strategy: ConflictStrategy,
    ) -> Resolution {
        self.deps
            .resolver
            .resolve(&local.table, strategy, &local.payload, &remote.fields)
    }

    async fn resolve_record_conflict(
        &self,
        conflict_id: &str,
        strategy: ConflictStrategy,
    ) -> Result<()> {
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
        let entity = self.entity(&conflict.table)?;
        let local_id = conflict
            .local_id
            .as_deref()
            .ok_or_else(|| SyncError::Validation(format!("conflict {} has no local record", conflict_id)))?;
        let local = self
            .records
            .get(&entity.table, local_id)
            .await?
            .ok_or_else(|| SyncError::NotFound(format!("{}/{}", entity.table, local_id)))?;
        let remote = RemoteRecord::from_value(conflict.remote_payload.clone())?;

        match self.resolve_conflict(&local, &remote, strategy) {
            Resolution::Deferred(_) => {
                return Err(SyncError::Validation(
                    "'ask' defers a conflict and cannot resolve one".to_string(),
                ));
            }
            Resolution::Resolved { payload, push } => {
                self.records
                    .apply_resolution(&entity.table, local_id, &payload, &remote, push)
                    .await?;
            }
        }

        self.conflicts
            .mark_resolved(conflict_id, strategy, Utc::now())
            .await?;
        tracing::info!(conflict = conflict_id, %strategy, "Record conflict resolved");
        self.deps.events.emit(SyncEvent::ConflictResolved {
            conflict_id: conflict_id.to_string(),
            resolution: strategy.to_string(),
        });
        Ok(())
    }

    async fn pending_count(&self) -> Result<u64> {
        let mut total = 0;
        for entity in &self.tables {
            total += self.records.count_unsynced(&entity.table).await?;
        }
        Ok(total)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{BusinessDomain, SyncPriority, SyncStatus};
    use crate::testing::{test_store, FakeConnectivity, FakeRemote};
    use serde_json::json;

    struct Harness {
        service: TableSyncService,
        remote: Arc<FakeRemote>,
        connectivity: Arc<FakeConnectivity>,
        events: EventBus,
        _temp: tempfile::TempDir,
    }

    async fn harness(tables: Vec<EntityTable>, resolver: ConflictResolver) -> Harness {
        let (store, temp) = test_store().await;
        let remote = FakeRemote::new();
        let connectivity = FakeConnectivity::new(true);
        let events = EventBus::new();
        let deps = ServiceDeps {
            store,
            remote: remote.clone(),
            connectivity: connectivity.clone(),
            resolver: Arc::new(resolver),
            events: events.clone(),
            run_mode: RunMode::Normal,
            request_timeout: Duration::from_secs(5),
            compress: false,
        };
        let service = TableSyncService::new(
            DomainServiceDescriptor::new(BusinessDomain::Catalog, SyncPriority::Critical, "Catalog"),
            tables,
            deps,
        );
        service.ensure_local_structure().await.unwrap();
        Harness {
            service,
            remote,
            connectivity,
            events,
            _temp: temp,
        }
    }

    fn products() -> Vec<EntityTable> {
        vec![EntityTable::new("products", "/api/products").with_natural_key("sku")]
    }

    fn payload(value: Value) -> Payload {
        value.as_object().cloned().unwrap()
    }

    async fn seed(h: &Harness, n: usize) {
        for i in 0..n {
            h.service
                .save_local("products", None, payload(json!({ "sku": format!("SKU-{}", i) })))
                .await
                .unwrap();
        }
    }

    #[tokio::test]
    async fn test_ensure_local_structure_is_idempotent() {
        let h = harness(products(), ConflictResolver::default()).await;
        h.service.ensure_local_structure().await.unwrap();
        assert!(h.service.records().store().table_exists("products").await.unwrap());
        assert_eq!(h.service.business_entities(), &["products".to_string()]);
        assert_eq!(h.service.service_name(), "catalog:products");
    }

    #[tokio::test]
    async fn test_forced_full_sync_in_batches_of_two() {
        let h = harness(products(), ConflictResolver::default()).await;
        seed(&h, 5).await;
        let run = RunContext::new(true, false);

        let mut checkpoint = SyncCheckpoint::new();
        let mut sizes = Vec::new();
        let mut calls = 0;
        while !checkpoint.completed {
            let before = h.remote.calls_with("POST").len();
            checkpoint = h
                .service
                .synchronize_batch(checkpoint.batch_index, 2, checkpoint, &run)
                .await
                .unwrap();
            h.service.save_checkpoint(&checkpoint).await.unwrap();
            sizes.push(h.remote.calls_with("POST").len() - before);
            calls += 1;
            assert!(calls <= 5, "batch loop did not terminate");
        }

        assert_eq!(calls, 3);
        assert_eq!(sizes, vec![2, 2, 1]);
        assert_eq!(checkpoint.processed_count, 5);
        assert!(checkpoint.completed);
        assert_eq!(checkpoint.batch_index, 3);
        assert!(checkpoint.last_sync_time.is_some());
        assert_eq!(h.service.pending_count().await.unwrap(), 0);

        let stored = h.service.load_checkpoint().await.unwrap().unwrap();
        assert_eq!(stored, checkpoint);
    }

    #[tokio::test]
    async fn test_interrupted_batch_resumes_without_duplicates() {
        let h = harness(products(), ConflictResolver::default()).await;
        seed(&h, 5).await;
        let run = RunContext::new(false, false);

        // Two records get through before the network drops
        h.connectivity.go_offline_after(2);
        let partial = h
            .service
            .synchronize_batch(0, 10, SyncCheckpoint::new(), &run)
            .await
            .unwrap();
        assert!(!partial.completed);
        assert_eq!(partial.processed_count, 2);
        h.service.save_checkpoint(&partial).await.unwrap();

        h.connectivity.set_online(true);
        let resumed_from = h.service.load_checkpoint().await.unwrap().unwrap();
        assert!(resumed_from.is_resumable());
        let done = h
            .service
            .synchronize_batch(resumed_from.batch_index, 10, resumed_from, &run)
            .await
            .unwrap();

        assert!(done.completed);
        assert_eq!(done.processed_count, 5);
        let posts = h.remote.calls_with("POST");
        assert_eq!(posts.len(), 5);
        let mut skus: Vec<String> = posts
            .iter()
            .map(|c| c.payload["sku"].as_str().unwrap().to_string())
            .collect();
        skus.sort();
        skus.dedup();
        assert_eq!(skus.len(), 5);
    }

    #[tokio::test]
    async fn test_cancelled_batch_returns_progress() {
        let h = harness(products(), ConflictResolver::default()).await;
        seed(&h, 3).await;
        let run = RunContext::new(false, false);
        run.cancel.cancel();

        let cp = h
            .service
            .synchronize_batch(0, 10, SyncCheckpoint::new(), &run)
            .await
            .unwrap();
        assert!(!cp.completed);
        assert_eq!(cp.processed_count, 0);
        assert!(h.remote.calls().is_empty());
    }

    #[tokio::test]
    async fn test_batch_walks_every_table() {
        let tables = vec![
            EntityTable::new("products", "/api/products"),
            EntityTable::new("categories", "/api/categories"),
        ];
        let h = harness(tables, ConflictResolver::default()).await;
        h.service
            .save_local("products", None, payload(json!({"name": "p"})))
            .await
            .unwrap();
        for name in ["a", "b"] {
            h.service
                .save_local("categories", None, payload(json!({ "name": name })))
                .await
                .unwrap();
        }
        let run = RunContext::new(false, false);

        let first = h
            .service
            .synchronize_batch(0, 2, SyncCheckpoint::new(), &run)
            .await
            .unwrap();
        assert!(!first.completed);
        assert_eq!(first.processed_count, 2);
        assert_eq!(first.entity.as_deref(), Some("categories"));

        let second = h
            .service
            .synchronize_batch(first.batch_index, 2, first, &run)
            .await
            .unwrap();
        assert!(second.completed);
        assert_eq!(second.processed_count, 3);
    }

    #[tokio::test]
    async fn test_pull_is_idempotent_and_skips_dirty() {
        let h = harness(products(), ConflictResolver::default()).await;
        h.remote.set_records(vec![
            json!({"id": "srv-1", "version": 1, "sku": "A", "name": "Alpha"}),
            json!({"id": "srv-2", "version": 1, "sku": "B", "name": "Beta"}),
        ]);

        assert_eq!(h.service.pull_from_server(true, None).await.unwrap(), 2);
        let first = h.service.records().list_live("products").await.unwrap();
        assert_eq!(h.service.pull_from_server(true, None).await.unwrap(), 0);
        let second = h.service.records().list_live("products").await.unwrap();
        assert_eq!(first.len(), 2);
        assert_eq!(
            first.iter().map(|r| (&r.local_id, &r.payload)).collect::<Vec<_>>(),
            second.iter().map(|r| (&r.local_id, &r.payload)).collect::<Vec<_>>()
        );

        // Local edit, then the server sends a newer version
        let alpha = h
            .service
            .records()
            .find_by_remote_id("products", "srv-1")
            .await
            .unwrap()
            .unwrap();
        h.service
            .save_local("products", Some(&alpha.local_id), payload(json!({"sku": "A", "name": "Mine"})))
            .await
            .unwrap();
        h.remote.set_records(vec![json!({"id": "srv-1", "version": 2, "sku": "A", "name": "Theirs"})]);
        h.service.pull_from_server(false, None).await.unwrap();

        let after = h.service.records().get("products", &alpha.local_id).await.unwrap().unwrap();
        assert!(after.dirty);
        assert_eq!(after.payload["name"], "Mine");
    }

    #[tokio::test]
    async fn test_incremental_pull_sends_updated_since() {
        let h = harness(products(), ConflictResolver::default()).await;
        let since = Utc::now();
        h.service.pull_from_server(false, Some(since)).await.unwrap();
        h.service.pull_from_server(true, Some(since)).await.unwrap();

        let gets = h.remote.calls_with("GET");
        assert!(gets[0].endpoint.starts_with("/api/products?updatedSince="));
        assert_eq!(gets[1].endpoint, "/api/products");
    }

    #[tokio::test]
    async fn test_synchronize_pushes_then_pulls() {
        let h = harness(products(), ConflictResolver::default()).await;
        seed(&h, 2).await;

        assert!(h.service.synchronize(false).await.unwrap());
        let methods: Vec<&str> = h.remote.calls().iter().map(|c| c.method).collect();
        assert_eq!(methods, vec!["POST", "POST", "GET"]);

        let records = h.service.records().list_live("products").await.unwrap();
        assert!(records.iter().all(|r| !r.dirty && r.remote_id.is_some()));
        assert!(records.iter().all(|r| r.sync_status == SyncStatus::Synced));

        h.connectivity.set_online(false);
        assert!(!h.service.synchronize(false).await.unwrap());
    }

    #[tokio::test]
    async fn test_update_conflict_merges_and_repushes() {
        let h = harness(products(), ConflictResolver::new(ConflictStrategy::Merge)).await;
        let mut events = h.events.subscribe();
        let record = h
            .service
            .save_local("products", None, payload(json!({"sku": "A", "name": "Mine"})))
            .await
            .unwrap();
        h.service.push_to_server(true).await.unwrap();
        let synced = h.service.records().get("products", &record.local_id).await.unwrap().unwrap();
        let remote_id = synced.remote_id.clone().unwrap();

        h.service
            .save_local("products", Some(&record.local_id), payload(json!({"sku": "A", "name": "Edited"})))
            .await
            .unwrap();
        h.remote.fail_with_conflict(json!({
            "id": remote_id, "version": 5, "sku": "A", "name": "Server", "price": 12
        }));

        // The conflicted PUT fails, and the re-push fails too while the fake stays in conflict mode
        h.service.push_to_server(true).await.unwrap();
        assert_eq!(events.recv().await.unwrap().name(), "SYNC_CONFLICT_DETECTED");
        assert_eq!(events.recv().await.unwrap().name(), "SYNC_CONFLICT_RESOLVED");

        let merged = h.service.records().get("products", &record.local_id).await.unwrap().unwrap();
        assert!(merged.dirty);
        assert_eq!(merged.payload["name"], "Edited");
        assert_eq!(merged.payload["price"], 12);
        assert_eq!(merged.base_version, 5);

        h.remote.succeed();
        assert_eq!(h.service.push_to_server(true).await.unwrap(), 1);
        let last_put = h.remote.calls_with("PUT").pop().unwrap();
        assert_eq!(last_put.payload["baseVersion"], 5);
        let clean = h.service.records().get("products", &record.local_id).await.unwrap().unwrap();
        assert!(!clean.dirty);
    }

    #[tokio::test]
    async fn test_ask_strategy_parks_record_until_resolved() {
        let tables = vec![EntityTable::new("products", "/api/products")
            .with_natural_key("sku")
            .with_strategy(ConflictStrategy::Ask)];
        let h = harness(tables, ConflictResolver::default()).await;
        let record = h
            .service
            .save_local("products", None, payload(json!({"sku": "A", "name": "Mine"})))
            .await
            .unwrap();
        h.remote.fail_with_conflict(json!({"id": "srv-9", "version": 3, "sku": "A", "name": "Theirs"}));

        let cp = h
            .service
            .synchronize_batch(0, 10, SyncCheckpoint::new(), &RunContext::default())
            .await
            .unwrap();
        assert!(cp.completed);
        assert_eq!(cp.processed_count, 0);

        let parked = h.service.records().get("products", &record.local_id).await.unwrap().unwrap();
        assert_eq!(parked.sync_status, SyncStatus::Conflict);
        assert!(parked.dirty);
        assert_eq!(h.service.pending_count().await.unwrap(), 0);

        let conflict = h
            .service
            .conflicts
            .find_open_for_record("products", &record.local_id)
            .await
            .unwrap()
            .unwrap();
        h.service
            .resolve_record_conflict(&conflict.id, ConflictStrategy::Remote)
            .await
            .unwrap();

        let adopted = h.service.records().get("products", &record.local_id).await.unwrap().unwrap();
        assert_eq!(adopted.sync_status, SyncStatus::Synced);
        assert!(!adopted.dirty);
        assert_eq!(adopted.remote_id.as_deref(), Some("srv-9"));
        assert_eq!(adopted.payload["name"], "Theirs");

        assert!(h
            .service
            .resolve_record_conflict(&conflict.id, ConflictStrategy::Local)
            .await
            .is_err());
    }

    #[tokio::test]
    async fn test_delete_pushes_tombstone() {
        let h = harness(products(), ConflictResolver::default()).await;
        let record = h
            .service
            .save_local("products", None, payload(json!({"sku": "A"})))
            .await
            .unwrap();
        h.service.push_to_server(true).await.unwrap();
        h.service.delete_local("products", &record.local_id).await.unwrap();

        assert_eq!(h.service.push_to_server(true).await.unwrap(), 1);
        let delete = h.remote.calls_with("DELETE").pop().unwrap();
        assert_eq!(delete.endpoint, "/api/products/srv-1");
        assert!(h.service.records().get("products", &record.local_id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_remote_failure_keeps_record_dirty() {
        let h = harness(products(), ConflictResolver::default()).await;
        seed(&h, 1).await;
        h.remote.fail_with_status(500);

        let cp = h
            .service
            .synchronize_batch(0, 10, SyncCheckpoint::new(), &RunContext::default())
            .await
            .unwrap();
        // The final pull fails too while the fake answers 500
        assert!(!cp.completed);
        assert_eq!(cp.failed_count, 1);
        assert_eq!(h.service.pending_count().await.unwrap(), 1);
        let record = &h.service.records().list_live("products").await.unwrap()[0];
        assert_eq!(record.sync_status, SyncStatus::Failed);
        assert_eq!(record.retries, 1);
    }

    #[tokio::test]
    async fn test_network_loss_during_pull_leaves_batch_open() {
        let h = harness(products(), ConflictResolver::default()).await;
        seed(&h, 2).await;
        let run = RunContext::default();

        let pushed = h
            .service
            .synchronize_batch(0, 10, SyncCheckpoint::new(), &run)
            .await
            .unwrap();
        assert!(pushed.completed);

        // Nothing left to push, so the only remote call is the pull
        h.remote.fail_with_connectivity();
        let cp = h
            .service
            .synchronize_batch(0, 10, SyncCheckpoint::next_run(Some(&pushed)), &run)
            .await
            .unwrap();
        assert!(!cp.completed);
        assert_eq!(cp.batch_index, 0);
        assert_eq!(cp.pulled_count, 0);
        assert_eq!(cp.last_sync_time, pushed.last_sync_time);

        assert!(!h.service.synchronize(false).await.unwrap());
        assert_eq!(h.remote.calls_with("POST").len(), 2);
    }

    #[tokio::test]
    async fn test_save_local_rejects_unknown_table() {
        let h = harness(products(), ConflictResolver::default()).await;
        assert!(matches!(
            h.service.save_local("sales", None, Payload::new()).await,
            Err(SyncError::Validation(_))
        ));
    }
}
