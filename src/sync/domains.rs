//! The built-in business domains and their tables.

use std::sync::Arc;

use super::conflict::{ConflictResolver, LedgerMergePolicy};
use super::table_sync::{EntityTable, ServiceDeps, TableSyncService};
use crate::models::{BusinessDomain, ConflictStrategy, DomainServiceDescriptor, SyncPriority};

fn table(name: &str) -> EntityTable {
    EntityTable::new(name, format!("/api/{}", name))
}

fn service(
    domain: BusinessDomain,
    priority: SyncPriority,
    display_name: &str,
    description: &str,
    tables: Vec<EntityTable>,
    deps: &ServiceDeps,
) -> Arc<TableSyncService> {
    let descriptor =
        DomainServiceDescriptor::new(domain, priority, display_name).with_description(description);
    Arc::new(TableSyncService::new(descriptor, tables, deps.clone()))
}

/// One service per business domain, in no particular order.
///
/// Ledger merges go through [`LedgerMergePolicy`] only if the caller
/// registered it on `deps.resolver`; see [`standard_resolver`].
pub fn standard_services(deps: &ServiceDeps) -> Vec<Arc<TableSyncService>> {
    vec![
        service(
            BusinessDomain::Catalog,
            SyncPriority::Critical,
            "Product catalog",
            "Products and categories",
            vec![table("products").with_natural_key("sku"), table("categories")],
            deps,
        ),
        service(
            BusinessDomain::Customers,
            SyncPriority::High,
            "Customers",
            "Customer accounts",
            vec![table("customers").with_natural_key("email")],
            deps,
        ),
        service(
            BusinessDomain::Transactions,
            SyncPriority::High,
            "Sales",
            "Completed sales",
            vec![table("sales")],
            deps,
        ),
        service(
            BusinessDomain::Inventory,
            SyncPriority::Medium,
            "Inventory",
            "Stock levels per location",
            vec![table("stock_levels")],
            deps,
        ),
        service(
            BusinessDomain::Accounting,
            SyncPriority::Low,
            "Accounting",
            "Ledger entries",
            vec![table("ledger_entries")],
            deps,
        ),
        service(
            BusinessDomain::Analytics,
            SyncPriority::Background,
            "Analytics",
            "Usage events",
            // Events are append-only; the device copy is authoritative.
            vec![table("usage_events").with_strategy(ConflictStrategy::Local)],
            deps,
        ),
    ]
}

/// Resolver with the ledger merge policy registered.
pub fn standard_resolver(default_strategy: ConflictStrategy) -> ConflictResolver {
    ConflictResolver::new(default_strategy)
        .with_merge_policy("ledger_entries", Arc::new(LedgerMergePolicy::default()))
}
