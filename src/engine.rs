//! Wires the store, transport, queue, domain services and orchestrator
//! together from one [`EngineConfig`].

use std::sync::Arc;
use tokio::task::JoinHandle;

use crate::config::{EngineConfig, RunMode, SyncOptions};
use crate::db::{ConflictRepository, RecordStore};
use crate::error::{Result, SyncError};
use crate::models::{
    BusinessDomain, ConflictRecord, ConflictStrategy, MutationQueueItem, NewMutation, Payload,
    SyncableRecord,
};
use crate::sync::{
    standard_resolver, standard_services, ConnectivityMonitor, DisconnectedApi, DomainSyncService,
    EventBus, ExecuteOutcome, HttpApiClient, OfflineMutationQueue, QueueSettings, RemoteApi,
    ServiceDeps, SyncOrchestrator, SyncReport, TableSyncService,
};

pub struct SyncEngine {
    config: EngineConfig,
    store: RecordStore,
    connectivity: Arc<ConnectivityMonitor>,
    events: EventBus,
    queue: Arc<OfflineMutationQueue>,
    services: Vec<Arc<TableSyncService>>,
    conflicts: ConflictRepository,
    orchestrator: Arc<SyncOrchestrator>,
}

impl SyncEngine {
    /// Opens the local store and builds the HTTP client from `config.api`.
    ///
    /// Without a configured base URL the engine runs offline-only: writes
    /// are queued and sync runs are skipped.
    pub async fn open(config: EngineConfig) -> Result<Self> {
        if config.api.is_configured() {
            let remote = Arc::new(HttpApiClient::from_config(&config.api, config.network_timeout())?);
            let run_mode = config.run_mode.value;
            Self::build(config, remote, run_mode).await
        } else {
            tracing::warn!("No api.base_url configured, running offline-only");
            Self::build(config, Arc::new(DisconnectedApi), RunMode::OfflineOnly).await
        }
    }

    /// Uses a caller-supplied transport. `api.base_url` is not consulted.
    pub async fn open_with_remote(config: EngineConfig, remote: Arc<dyn RemoteApi>) -> Result<Self> {
        let run_mode = config.run_mode.value;
        Self::build(config, remote, run_mode).await
    }

    async fn build(
        config: EngineConfig,
        remote: Arc<dyn RemoteApi>,
        run_mode: RunMode,
    ) -> Result<Self> {
        let store = RecordStore::open(&config.database_path.value, config.db_timeout()).await?;
        let connectivity = Arc::new(ConnectivityMonitor::new(false));
        let events = EventBus::new();

        let queue = Arc::new(
            OfflineMutationQueue::new(
                store.clone(),
                remote.clone(),
                connectivity.clone(),
                events.clone(),
                QueueSettings::from_config(&config),
            )
            .with_run_mode(run_mode),
        );
        let recovered = queue.recover_interrupted().await?;
        if recovered > 0 {
            tracing::info!(recovered, "Recovered interrupted queue items");
        }

        let deps = ServiceDeps {
            store: store.clone(),
            remote,
            connectivity: connectivity.clone(),
            resolver: Arc::new(standard_resolver(config.default_conflict_strategy)),
            events: events.clone(),
            run_mode,
            request_timeout: config.network_timeout(),
            compress: config.compression_enabled,
        };
        let services = standard_services(&deps);
        for service in &services {
            service.ensure_local_structure().await?;
        }

        let orchestrator = Arc::new(
            SyncOrchestrator::new(connectivity.clone(), events.clone())
                .with_services(
                    services
                        .iter()
                        .map(|s| s.clone() as Arc<dyn DomainSyncService>),
                )
                .with_queue(queue.clone())
                .with_run_mode(run_mode),
        );

        tracing::info!(
            database = %config.database_path.value.display(),
            ?run_mode,
            services = services.len(),
            "Sync engine ready"
        );

        Ok(Self {
            conflicts: ConflictRepository::new(store.clone()),
            config,
            store,
            connectivity,
            events,
            queue,
            services,
            orchestrator,
        })
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn store(&self) -> &RecordStore {
        &self.store
    }

    /// Fed by the host platform's network callbacks.
    pub fn connectivity(&self) -> &ConnectivityMonitor {
        &self.connectivity
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    pub fn queue(&self) -> &Arc<OfflineMutationQueue> {
        &self.queue
    }

    pub fn orchestrator(&self) -> &Arc<SyncOrchestrator> {
        &self.orchestrator
    }

    pub fn services(&self) -> &[Arc<TableSyncService>] {
        &self.services
    }

    pub fn service(&self, domain: BusinessDomain) -> Option<&Arc<TableSyncService>> {
        self.services.iter().find(|s| s.business_domain() == domain)
    }

    fn service_for_table(&self, table: &str) -> Result<&Arc<TableSyncService>> {
        self.services
            .iter()
            .find(|s| s.tables().iter().any(|t| t.table == table))
            .ok_or_else(|| SyncError::Validation(format!("unknown table '{}'", table)))
    }

    pub async fn synchronize_all(&self, options: SyncOptions) -> SyncReport {
        self.orchestrator.synchronize_all(options).await
    }

    /// Runs with the batch size and compression from the configuration.
    pub async fn synchronize(&self) -> SyncReport {
        self.synchronize_all(SyncOptions::from_config(&self.config))
            .await
    }

    pub fn cancel(&self) -> bool {
        self.orchestrator.cancel()
    }

    /// Drains the queue and resumes sync whenever connectivity returns.
    pub fn spawn_reconnect_listener(&self) -> JoinHandle<()> {
        self.orchestrator
            .clone()
            .spawn_reconnect_listener(SyncOptions::from_config(&self.config))
    }

    pub async fn save_local(
        &self,
        table: &str,
        local_id: Option<&str>,
        payload: Payload,
    ) -> Result<SyncableRecord> {
        self.service_for_table(table)?
            .save_local(table, local_id, payload)
            .await
    }

    pub async fn delete_local(&self, table: &str, local_id: &str) -> Result<()> {
        self.service_for_table(table)?
            .delete_local(table, local_id)
            .await
    }

    pub async fn execute_or_enqueue(&self, mutation: NewMutation) -> Result<ExecuteOutcome> {
        self.queue.execute_or_enqueue(mutation).await
    }

    pub async fn enqueue(&self, mutation: NewMutation) -> Result<MutationQueueItem> {
        self.queue.enqueue(mutation).await
    }

    /// Every conflict still waiting for an explicit resolution.
    pub async fn open_conflicts(&self) -> Result<Vec<ConflictRecord>> {
        self.conflicts.list_open().await
    }

    /// Resolves a conflict parked under `ask`, whether it belongs to a queued
    /// mutation or to a table record.
    pub async fn resolve_conflict(&self, conflict_id: &str, strategy: ConflictStrategy) -> Result<()> {
        let conflict = self
            .conflicts
            .get(conflict_id)
            .await?
            .ok_or_else(|| SyncError::NotFound(format!("conflict {}", conflict_id)))?;
        if conflict.queue_item_id.is_some() {
            self.queue.resolve_conflict(conflict_id, strategy).await?;
            return Ok(());
        }
        self.service_for_table(&conflict.table)?
            .resolve_record_conflict(conflict_id, strategy)
            .await
    }

    /// Unsynced records across every domain.
    pub async fn pending_count(&self) -> Result<u64> {
        let mut total = 0;
        for service in &self.services {
            total += service.pending_count().await?;
        }
        Ok(total)
    }
}
