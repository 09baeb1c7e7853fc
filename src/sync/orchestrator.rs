//! Drives every registered domain service through one sync run.

use serde::Serialize;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::connectivity::Connectivity;
use super::events::{EventBus, SyncEvent};
use super::queue::OfflineMutationQueue;
use super::service::{DomainSyncService, RunContext};
use super::SingleFlight;
use crate::config::{RunMode, SyncOptions};
use crate::error::Result;
use crate::models::{BusinessDomain, SyncCheckpoint};

/// Why a run did not start.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SkipReason {
    AlreadyRunning,
    Offline,
}

/// Aggregated outcome for one business domain.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DomainResult {
    pub domain: BusinessDomain,
    /// At least one service of the domain finished and none failed.
    pub success: bool,
    pub services: Vec<String>,
    pub synced_entities: Vec<String>,
    pub processed: u64,
    pub errors: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct SyncReport {
    pub success: bool,
    pub skipped: Option<SkipReason>,
    pub cancelled: bool,
    /// Records pushed across all services.
    pub processed: u64,
    pub pulled: u64,
    pub failed: u64,
    /// Queue items dispatched by the post-run drain.
    pub queue_processed: usize,
    pub domains: Vec<DomainResult>,
    pub errors: Vec<String>,
    pub duration: Duration,
}

impl SyncReport {
    fn skipped(reason: SkipReason) -> Self {
        Self {
            skipped: Some(reason),
            ..Self::default()
        }
    }

    pub fn domain(&self, domain: BusinessDomain) -> Option<&DomainResult> {
        self.domains.iter().find(|d| d.domain == domain)
    }
}

enum ServiceOutcome {
    Completed,
    /// Connectivity loss or cancellation. Progress is checkpointed.
    Interrupted,
    Failed(String),
}

struct ServiceRun {
    service: Arc<dyn DomainSyncService>,
    outcome: ServiceOutcome,
    processed: u64,
    pulled: u64,
    failed: u64,
}

/// Percentage that only ever moves forward and stays within 0..=100.
struct Progress {
    total: u64,
    processed: u64,
    last: f64,
}

impl Progress {
    fn new(total: u64) -> Self {
        Self {
            total,
            processed: 0,
            last: 0.0,
        }
    }

    fn advance(&mut self, processed: u64) -> f64 {
        self.processed += processed;
        let raw = if self.total == 0 {
            0.0
        } else {
            self.processed as f64 / self.total as f64 * 100.0
        };
        self.last = raw.clamp(0.0, 100.0).max(self.last);
        self.last
    }

    fn finish(&mut self) -> f64 {
        self.last = 100.0;
        self.last
    }
}

pub struct SyncOrchestrator {
    services: Vec<Arc<dyn DomainSyncService>>,
    queue: Option<Arc<OfflineMutationQueue>>,
    connectivity: Arc<dyn Connectivity>,
    events: EventBus,
    run_mode: RunMode,
    flight: SingleFlight,
    current: Mutex<Option<CancellationToken>>,
}

impl SyncOrchestrator {
    pub fn new(connectivity: Arc<dyn Connectivity>, events: EventBus) -> Self {
        Self {
            services: Vec::new(),
            queue: None,
            connectivity,
            events,
            run_mode: RunMode::default(),
            flight: SingleFlight::new(),
            current: Mutex::new(None),
        }
    }

    /// Registration order breaks priority ties.
    pub fn with_service(mut self, service: Arc<dyn DomainSyncService>) -> Self {
        self.services.push(service);
        self
    }

    pub fn with_services<I>(mut self, services: I) -> Self
    where
        I: IntoIterator<Item = Arc<dyn DomainSyncService>>,
    {
        self.services.extend(services);
        self
    }

    pub fn with_queue(mut self, queue: Arc<OfflineMutationQueue>) -> Self {
        self.queue = Some(queue);
        self
    }

    pub fn with_run_mode(mut self, run_mode: RunMode) -> Self {
        self.run_mode = run_mode;
        self
    }

    pub fn registered_services(&self) -> &[Arc<dyn DomainSyncService>] {
        &self.services
    }

    pub fn is_running(&self) -> bool {
        self.flight.is_busy()
    }

    /// Stops the current run at the next record boundary.
    /// Returns false if nothing is running.
    pub fn cancel(&self) -> bool {
        let current = self.current.lock().unwrap_or_else(|e| e.into_inner());
        match current.as_ref() {
            Some(token) => {
                tracing::info!("Cancelling sync run");
                token.cancel();
                true
            }
            None => false,
        }
    }

    fn is_online(&self) -> bool {
        self.run_mode.allows_network() && self.connectivity.is_connected()
    }

    fn set_current(&self, token: Option<CancellationToken>) {
        *self.current.lock().unwrap_or_else(|e| e.into_inner()) = token;
    }

    /// Services matching the filters, stably sorted by ascending priority.
    fn working_set(&self, options: &SyncOptions) -> Vec<Arc<dyn DomainSyncService>> {
        let mut selected: Vec<Arc<dyn DomainSyncService>> = self
            .services
            .iter()
            .filter(|s| options.domains.is_empty() || options.domains.contains(&s.business_domain()))
            .filter(|s| {
                options.entities.is_empty()
                    || s.business_entities().iter().any(|e| options.entities.contains(e))
            })
            .cloned()
            .collect();
        selected.sort_by_key(|s| s.priority());
        selected
    }

    /// Runs one full sync. Never fails: every outcome, including a rejected
    /// start, is described by the returned report.
    pub async fn synchronize_all(&self, options: SyncOptions) -> SyncReport {
        let Some(_guard) = self.flight.try_acquire() else {
            tracing::info!("Sync already running, request rejected");
            return SyncReport::skipped(SkipReason::AlreadyRunning);
        };
        if !self.is_online() {
            tracing::info!("Offline, sync skipped");
            return SyncReport::skipped(SkipReason::Offline);
        }

        let started = Instant::now();
        let run = RunContext::new(options.force_full_sync, options.compression_enabled);
        self.set_current(Some(run.cancel.clone()));

        let services = self.working_set(&options);
        self.events.emit(SyncEvent::Started {
            services: services.iter().map(|s| s.service_name()).collect(),
        });
        tracing::info!(
            services = services.len(),
            batch_mode = options.batch_mode,
            force_full_sync = options.force_full_sync,
            "Sync run started"
        );

        let mut total = 0;
        for service in &services {
            total += service.pending_count().await.unwrap_or(0);
        }
        let mut progress = Progress::new(total);

        let mut runs = Vec::with_capacity(services.len());
        for service in &services {
            if run.cancel.is_cancelled() || !self.is_online() {
                runs.push(ServiceRun {
                    service: service.clone(),
                    outcome: ServiceOutcome::Interrupted,
                    processed: 0,
                    pulled: 0,
                    failed: 0,
                });
                continue;
            }

            let result = self
                .run_service(service, &options, &run, &mut progress)
                .await;
            let service_run = match result {
                Ok(service_run) => service_run,
                Err(err) => {
                    tracing::error!(service = %service.service_name(), error = %err, "Domain sync failed");
                    ServiceRun {
                        service: service.clone(),
                        outcome: ServiceOutcome::Failed(err.to_string()),
                        processed: 0,
                        pulled: 0,
                        failed: 0,
                    }
                }
            };
            if let ServiceOutcome::Failed(message) = &service_run.outcome {
                self.events.emit(SyncEvent::Error {
                    service: service.service_name(),
                    message: message.clone(),
                });
            }
            runs.push(service_run);
        }

        let mut report = SyncReport {
            cancelled: run.cancel.is_cancelled(),
            ..SyncReport::default()
        };

        if let Some(queue) = &self.queue {
            if !report.cancelled && self.is_online() {
                match queue.process_queue(false).await {
                    Ok(n) => report.queue_processed = n,
                    Err(err) => {
                        tracing::warn!(error = %err, "Queue drain after sync failed");
                        report.errors.push(format!("queue: {}", err));
                    }
                }
            }
        }

        for service_run in &runs {
            report.processed += service_run.processed;
            report.pulled += service_run.pulled;
            report.failed += service_run.failed;
            if let ServiceOutcome::Failed(message) = &service_run.outcome {
                report
                    .errors
                    .push(format!("{}: {}", service_run.service.service_name(), message));
            }
        }
        report.domains = group_by_domain(&runs);
        report.success = !runs.is_empty()
            && runs
                .iter()
                .all(|r| matches!(r.outcome, ServiceOutcome::Completed))
            && report.errors.is_empty();
        report.duration = started.elapsed();

        if report.success {
            self.events.emit(SyncEvent::Progress {
                service: "all".to_string(),
                percent: progress.finish(),
                processed: report.processed,
                total,
            });
        }
        self.events.emit(SyncEvent::Completed {
            success: report.success,
            processed: report.processed,
        });
        tracing::info!(
            success = report.success,
            processed = report.processed,
            pulled = report.pulled,
            cancelled = report.cancelled,
            duration_ms = report.duration.as_millis() as u64,
            "Sync run finished"
        );

        self.set_current(None);
        report
    }

    async fn run_service(
        &self,
        service: &Arc<dyn DomainSyncService>,
        options: &SyncOptions,
        run: &RunContext,
        progress: &mut Progress,
    ) -> Result<ServiceRun> {
        let name = service.service_name();
        service.ensure_local_structure().await?;

        if !options.batch_mode {
            let done = service.synchronize(options.force_full_sync).await?;
            let checkpoint = service.load_checkpoint().await?.unwrap_or_default();
            let processed = if done { checkpoint.processed_count } else { 0 };
            self.emit_progress(&name, progress, processed);
            return Ok(ServiceRun {
                service: service.clone(),
                outcome: if done {
                    ServiceOutcome::Completed
                } else {
                    ServiceOutcome::Interrupted
                },
                processed,
                pulled: if done { checkpoint.pulled_count } else { 0 },
                failed: 0,
            });
        }

        let mut checkpoint = self.starting_checkpoint(service, options).await?;
        let start = checkpoint.clone();
        let batch_size = options.batch_size.max(1);

        let outcome = loop {
            let before = checkpoint.clone();
            checkpoint = service
                .synchronize_batch(before.batch_index, batch_size, before.clone(), run)
                .await?;
            service.save_checkpoint(&checkpoint).await?;

            let advanced = checkpoint.processed_count.saturating_sub(before.processed_count);
            self.emit_progress(&name, progress, advanced);

            if checkpoint.completed {
                break ServiceOutcome::Completed;
            }
            if run.cancel.is_cancelled() || !self.is_online() || checkpoint == before {
                tracing::info!(service = %name, batch = checkpoint.batch_index, "Domain sync interrupted");
                break ServiceOutcome::Interrupted;
            }
        };

        Ok(ServiceRun {
            service: service.clone(),
            outcome,
            processed: checkpoint.processed_count.saturating_sub(start.processed_count),
            pulled: checkpoint.pulled_count.saturating_sub(start.pulled_count),
            failed: checkpoint.failed_count.saturating_sub(start.failed_count),
        })
    }

    /// Resumes an interrupted run, otherwise starts fresh keeping only the
    /// incremental pull marker. A forced full sync discards the checkpoint.
    async fn starting_checkpoint(
        &self,
        service: &Arc<dyn DomainSyncService>,
        options: &SyncOptions,
    ) -> Result<SyncCheckpoint> {
        if options.force_full_sync {
            service.reset_checkpoint().await?;
            return Ok(SyncCheckpoint::new());
        }
        let stored = service.load_checkpoint().await?;
        match stored {
            Some(checkpoint) if options.resume_from_checkpoint && checkpoint.is_resumable() => {
                tracing::info!(
                    service = %service.service_name(),
                    batch = checkpoint.batch_index,
                    processed = checkpoint.processed_count,
                    "Resuming from checkpoint"
                );
                Ok(checkpoint)
            }
            previous => Ok(SyncCheckpoint::next_run(previous.as_ref())),
        }
    }

    fn emit_progress(&self, service: &str, progress: &mut Progress, processed: u64) {
        let percent = progress.advance(processed);
        self.events.emit(SyncEvent::Progress {
            service: service.to_string(),
            percent,
            processed: progress.processed,
            total: progress.total,
        });
    }

    /// Drains the queue and resumes sync on every offline to online transition.
    pub fn spawn_reconnect_listener(self: Arc<Self>, options: SyncOptions) -> JoinHandle<()> {
        let mut rx = self.connectivity.subscribe();
        let mut was_online = *rx.borrow_and_update();
        tokio::spawn(async move {
            while rx.changed().await.is_ok() {
                let online = *rx.borrow_and_update();
                if online && !was_online {
                    tracing::info!("Back online, resuming sync");
                    if let Some(queue) = &self.queue {
                        if let Err(err) = queue.process_queue(false).await {
                            tracing::warn!(error = %err, "Queue drain on reconnect failed");
                        }
                    }
                    let report = self
                        .synchronize_all(SyncOptions {
                            resume_from_checkpoint: true,
                            ..options.clone()
                        })
                        .await;
                    tracing::debug!(success = report.success, skipped = ?report.skipped, "Reconnect sync finished");
                }
                was_online = online;
            }
        })
    }
}

fn group_by_domain(runs: &[ServiceRun]) -> Vec<DomainResult> {
    let mut results: Vec<DomainResult> = Vec::new();
    for run in runs {
        let domain = run.service.business_domain();
        let idx = match results.iter().position(|r| r.domain == domain) {
            Some(idx) => idx,
            None => {
                results.push(DomainResult {
                    domain,
                    success: false,
                    services: Vec::new(),
                    synced_entities: Vec::new(),
                    processed: 0,
                    errors: Vec::new(),
                });
                results.len() - 1
            }
        };
        let entry = &mut results[idx];
        entry.services.push(run.service.service_name());
        entry.processed += run.processed;
        match &run.outcome {
            ServiceOutcome::Completed => entry
                .synced_entities
                .extend(run.service.business_entities().iter().cloned()),
            ServiceOutcome::Failed(message) => entry.errors.push(message.clone()),
            ServiceOutcome::Interrupted => {}
        }
    }
    for entry in &mut results {
        entry.success = !entry.synced_entities.is_empty() && entry.errors.is_empty();
    }
    results
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{CheckpointRepository, RecordStore};
    use crate::error::SyncError;
    use crate::models::{
        ConflictStrategy, DomainServiceDescriptor, MutationOperation, NewMutation, Payload,
        RemoteRecord, SyncPriority, SyncableRecord,
    };
    use crate::sync::conflict::{ConflictResolver, Resolution};
    use crate::sync::queue::QueueSettings;
    use crate::sync::table_sync::{EntityTable, ServiceDeps, TableSyncService};
    use crate::testing::{test_store, FakeConnectivity, FakeRemote};
    use async_trait::async_trait;
    use chrono::{DateTime, Utc};
    use serde_json::json;

    struct Harness {
        store: RecordStore,
        remote: Arc<FakeRemote>,
        connectivity: Arc<FakeConnectivity>,
        events: EventBus,
        _temp: tempfile::TempDir,
    }

    impl Harness {
        async fn new() -> Self {
            let (store, temp) = test_store().await;
            Self {
                store,
                remote: FakeRemote::new(),
                connectivity: FakeConnectivity::new(true),
                events: EventBus::new(),
                _temp: temp,
            }
        }

        fn deps(&self) -> ServiceDeps {
            ServiceDeps {
                store: self.store.clone(),
                remote: self.remote.clone(),
                connectivity: self.connectivity.clone(),
                resolver: Arc::new(ConflictResolver::default()),
                events: self.events.clone(),
                run_mode: RunMode::Normal,
                request_timeout: Duration::from_secs(5),
                compress: false,
            }
        }

        async fn table_service(
            &self,
            domain: BusinessDomain,
            priority: SyncPriority,
            table: &str,
            records: usize,
        ) -> Arc<TableSyncService> {
            let service = Arc::new(TableSyncService::new(
                DomainServiceDescriptor::new(domain, priority, table),
                vec![EntityTable::new(table, format!("/api/{}", table))],
                self.deps(),
            ));
            service.ensure_local_structure().await.unwrap();
            for i in 0..records {
                let payload: Payload = json!({ "n": i }).as_object().cloned().unwrap();
                service.save_local(table, None, payload).await.unwrap();
            }
            service
        }

        fn orchestrator(&self) -> SyncOrchestrator {
            SyncOrchestrator::new(self.connectivity.clone(), self.events.clone())
        }
    }

    /// Fails every batch call.
    struct BrokenService {
        descriptor: DomainServiceDescriptor,
        checkpoints: CheckpointRepository,
    }

    #[async_trait]
    impl DomainSyncService for BrokenService {
        fn descriptor(&self) -> &DomainServiceDescriptor {
            &self.descriptor
        }

        fn checkpoints(&self) -> &CheckpointRepository {
            &self.checkpoints
        }

        async fn ensure_local_structure(&self) -> Result<()> {
            Ok(())
        }

        async fn pull_from_server(&self, _: bool, _: Option<DateTime<Utc>>) -> Result<u64> {
            Ok(0)
        }

        async fn push_to_server(&self, _: bool) -> Result<u64> {
            Ok(0)
        }

        async fn synchronize(&self, _: bool) -> Result<bool> {
            Err(SyncError::Validation("broken".to_string()))
        }

        async fn synchronize_batch(
            &self,
            _: u32,
            _: usize,
            _: SyncCheckpoint,
            _: &RunContext,
        ) -> Result<SyncCheckpoint> {
            Err(SyncError::Validation("broken".to_string()))
        }

        fn resolve_conflict(
            &self,
            local: &SyncableRecord,
            _: &RemoteRecord,
            _: ConflictStrategy,
        ) -> Resolution {
            Resolution::Resolved {
                payload: local.payload.clone(),
                push: true,
            }
        }

        async fn resolve_record_conflict(&self, _: &str, _: ConflictStrategy) -> Result<()> {
            Ok(())
        }

        async fn pending_count(&self) -> Result<u64> {
            Ok(0)
        }
    }

    fn options(batch_size: usize) -> SyncOptions {
        SyncOptions {
            batch_size,
            compression_enabled: false,
            ..SyncOptions::default()
        }
    }

    #[tokio::test]
    async fn test_services_run_in_priority_order() {
        let h = Harness::new().await;
        let low = h.table_service(BusinessDomain::Accounting, SyncPriority::Low, "ledger_entries", 1).await;
        let critical = h.table_service(BusinessDomain::Catalog, SyncPriority::Critical, "products", 1).await;
        let medium = h.table_service(BusinessDomain::Inventory, SyncPriority::Medium, "stock_levels", 1).await;
        let orchestrator = h
            .orchestrator()
            .with_service(low)
            .with_service(critical)
            .with_service(medium);

        let report = orchestrator.synchronize_all(options(10)).await;
        assert!(report.success);
        assert_eq!(report.processed, 3);

        let order: Vec<String> = h
            .remote
            .calls_with("POST")
            .into_iter()
            .map(|c| c.endpoint)
            .collect();
        assert_eq!(order, vec!["/api/products", "/api/stock_levels", "/api/ledger_entries"]);
    }

    #[tokio::test]
    async fn test_equal_priority_keeps_registration_order() {
        let h = Harness::new().await;
        let sales = h.table_service(BusinessDomain::Transactions, SyncPriority::High, "sales", 1).await;
        let customers = h.table_service(BusinessDomain::Customers, SyncPriority::High, "customers", 1).await;
        let orchestrator = h.orchestrator().with_service(sales).with_service(customers);

        orchestrator.synchronize_all(options(10)).await;
        let order: Vec<String> = h.remote.calls_with("POST").into_iter().map(|c| c.endpoint).collect();
        assert_eq!(order, vec!["/api/sales", "/api/customers"]);
    }

    #[tokio::test]
    async fn test_rejected_when_offline_or_busy() {
        let h = Harness::new().await;
        let orchestrator = h.orchestrator();

        let guard = orchestrator.flight.try_acquire().unwrap();
        assert!(orchestrator.is_running());
        let busy = orchestrator.synchronize_all(options(10)).await;
        assert_eq!(busy.skipped, Some(SkipReason::AlreadyRunning));
        drop(guard);

        h.connectivity.set_online(false);
        let offline = orchestrator.synchronize_all(options(10)).await;
        assert_eq!(offline.skipped, Some(SkipReason::Offline));
        assert!(!offline.success);
        assert!(!orchestrator.is_running());
    }

    #[tokio::test]
    async fn test_offline_run_mode_skips() {
        let h = Harness::new().await;
        let orchestrator = h.orchestrator().with_run_mode(RunMode::OfflineOnly);
        let report = orchestrator.synchronize_all(options(10)).await;
        assert_eq!(report.skipped, Some(SkipReason::Offline));
    }

    #[tokio::test]
    async fn test_failing_service_does_not_block_others() {
        let h = Harness::new().await;
        let broken = Arc::new(BrokenService {
            descriptor: DomainServiceDescriptor::new(BusinessDomain::Catalog, SyncPriority::Critical, "Broken")
                .with_entities(["products"]),
            checkpoints: CheckpointRepository::new(h.store.clone()),
        });
        let sales = h.table_service(BusinessDomain::Transactions, SyncPriority::High, "sales", 2).await;
        let mut events = h.events.subscribe();
        let orchestrator = h.orchestrator().with_service(broken).with_service(sales);

        let report = orchestrator.synchronize_all(options(10)).await;
        assert!(!report.success);
        assert_eq!(report.processed, 2);
        assert_eq!(report.errors.len(), 1);

        let catalog = report.domain(BusinessDomain::Catalog).unwrap();
        assert!(!catalog.success);
        assert_eq!(catalog.errors.len(), 1);
        let transactions = report.domain(BusinessDomain::Transactions).unwrap();
        assert!(transactions.success);
        assert_eq!(transactions.synced_entities, vec!["sales".to_string()]);

        let mut names = Vec::new();
        while let Ok(event) = events.try_recv() {
            names.push(event.name());
        }
        assert_eq!(names.first(), Some(&"SYNC_STARTED"));
        assert!(names.contains(&"SYNC_ERROR"));
        assert_eq!(names.last(), Some(&"SYNC_COMPLETED"));
    }

    #[tokio::test]
    async fn test_filters_select_working_set() {
        let h = Harness::new().await;
        let products = h.table_service(BusinessDomain::Catalog, SyncPriority::Critical, "products", 1).await;
        let sales = h.table_service(BusinessDomain::Transactions, SyncPriority::High, "sales", 1).await;
        let orchestrator = h.orchestrator().with_service(products).with_service(sales);

        let by_domain = orchestrator
            .synchronize_all(SyncOptions {
                domains: vec![BusinessDomain::Transactions],
                ..options(10)
            })
            .await;
        assert_eq!(by_domain.domains.len(), 1);
        assert_eq!(h.remote.calls_with("POST").len(), 1);

        let by_entity = orchestrator
            .synchronize_all(SyncOptions {
                entities: vec!["products".to_string()],
                ..options(10)
            })
            .await;
        assert_eq!(by_entity.domains[0].domain, BusinessDomain::Catalog);
        assert_eq!(h.remote.calls_with("POST").len(), 2);
    }

    #[tokio::test]
    async fn test_progress_is_monotonic_and_clamped() {
        let h = Harness::new().await;
        let products = h.table_service(BusinessDomain::Catalog, SyncPriority::Critical, "products", 5).await;
        let mut events = h.events.subscribe();
        let orchestrator = h.orchestrator().with_service(products);

        let report = orchestrator.synchronize_all(options(2)).await;
        assert!(report.success);

        let mut percents = Vec::new();
        while let Ok(event) = events.try_recv() {
            if let SyncEvent::Progress { percent, .. } = event {
                percents.push(percent);
            }
        }
        assert!(percents.len() >= 3);
        assert!(percents.windows(2).all(|w| w[0] <= w[1]));
        assert!(percents.iter().all(|p| (0.0..=100.0).contains(p)));
        assert_eq!(percents.last(), Some(&100.0));
    }

    #[tokio::test]
    async fn test_network_loss_during_pull_is_not_an_error() {
        let h = Harness::new().await;
        let products = h.table_service(BusinessDomain::Catalog, SyncPriority::Critical, "products", 0).await;
        let mut events = h.events.subscribe();
        let orchestrator = h.orchestrator().with_service(products.clone());
        h.remote.fail_with_connectivity();

        let report = orchestrator.synchronize_all(options(10)).await;
        assert!(!report.success);
        assert!(report.errors.is_empty(), "{:?}", report.errors);
        let catalog = report.domain(BusinessDomain::Catalog).unwrap();
        assert!(catalog.errors.is_empty());
        assert!(catalog.synced_entities.is_empty());
        assert!(!products.load_checkpoint().await.unwrap().unwrap().completed);

        let mut names = Vec::new();
        while let Ok(event) = events.try_recv() {
            names.push(event.name());
        }
        assert!(!names.contains(&"SYNC_ERROR"));

        h.remote.succeed();
        let retried = orchestrator.synchronize_all(options(10)).await;
        assert!(retried.success, "{:?}", retried.errors);
    }

    #[tokio::test]
    async fn test_interrupted_run_resumes_from_checkpoint() {
        let h = Harness::new().await;
        let products = h.table_service(BusinessDomain::Catalog, SyncPriority::Critical, "products", 4).await;
        let orchestrator = h.orchestrator().with_service(products.clone());

        // Online for the run start, the service loop and two records
        h.connectivity.go_offline_after(4);
        let first = orchestrator.synchronize_all(options(10)).await;
        assert!(!first.success);
        assert_eq!(first.processed, 2);
        let stored = products.load_checkpoint().await.unwrap().unwrap();
        assert!(!stored.completed);

        h.connectivity.set_online(true);
        let second = orchestrator.synchronize_all(options(10)).await;
        assert!(second.success);
        assert_eq!(second.processed, 2);
        assert_eq!(h.remote.calls_with("POST").len(), 4);
        assert!(products.load_checkpoint().await.unwrap().unwrap().completed);
    }

    #[tokio::test]
    async fn test_non_batch_mode_calls_synchronize() {
        let h = Harness::new().await;
        let products = h.table_service(BusinessDomain::Catalog, SyncPriority::Critical, "products", 3).await;
        let orchestrator = h.orchestrator().with_service(products);

        let report = orchestrator
            .synchronize_all(SyncOptions {
                batch_mode: false,
                ..options(1)
            })
            .await;
        assert!(report.success);
        assert_eq!(report.processed, 3);
    }

    #[tokio::test]
    async fn test_cancel_without_run() {
        let h = Harness::new().await;
        assert!(!h.orchestrator().cancel());
    }

    #[tokio::test]
    async fn test_drains_queue_after_services() {
        let h = Harness::new().await;
        let queue = Arc::new(OfflineMutationQueue::new(
            h.store.clone(),
            h.remote.clone(),
            h.connectivity.clone(),
            h.events.clone(),
            QueueSettings::default(),
        ));
        queue
            .enqueue(NewMutation::new("/api/sales", MutationOperation::Create, "sales"))
            .await
            .unwrap();
        let orchestrator = h.orchestrator().with_queue(queue.clone());

        let report = orchestrator.synchronize_all(options(10)).await;
        assert_eq!(report.queue_processed, 1);
        assert!(queue.is_empty().await.unwrap());
    }

    #[tokio::test]
    async fn test_reconnect_listener_resumes_sync() {
        let h = Harness::new().await;
        h.connectivity.set_online(false);
        let products = h.table_service(BusinessDomain::Catalog, SyncPriority::Critical, "products", 2).await;
        let orchestrator = Arc::new(h.orchestrator().with_service(products.clone()));
        let handle = orchestrator.clone().spawn_reconnect_listener(options(10));

        h.connectivity.set_online(true);
        let mut waited = 0;
        while products.pending_count().await.unwrap() > 0 {
            tokio::time::sleep(Duration::from_millis(20)).await;
            waited += 1;
            assert!(waited < 250, "reconnect sync did not run");
        }
        assert_eq!(h.remote.calls_with("POST").len(), 2);
        handle.abort();
    }
}
