//! Conflict detection and resolution
//!
//! Every function here is a pure function of its inputs, so resolving the
//! same conflict twice yields the same payload.

use chrono::{DateTime, Utc};
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use crate::models::{BusinessDomain, ConflictStrategy, Payload, RemoteRecord, SyncableRecord};

/// Outcome of applying a strategy.
#[derive(Debug, Clone, PartialEq)]
pub enum Resolution {
    /// `push` is false when the remote state was adopted and nothing needs
    /// to go back to the server.
    Resolved { payload: Payload, push: bool },
    /// Needs an explicit external resolution call.
    Deferred(ConflictDescriptor),
}

/// Both sides of an unresolved conflict.
#[derive(Debug, Clone, PartialEq)]
pub struct ConflictDescriptor {
    pub local: Payload,
    pub remote: Payload,
}

/// Domain-specific merge for entities with invariant-sensitive fields.
pub trait FieldMergePolicy: Send + Sync {
    fn merge(&self, local: &Payload, remote: &Payload) -> Payload;
}

/// Ledger entries: balances are computed server-side, so they always come
/// from the remote copy. Everything else follows the shallow merge.
#[derive(Debug, Clone)]
pub struct LedgerMergePolicy {
    protected: Vec<String>,
}

impl LedgerMergePolicy {
    pub fn new<I, S>(protected: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            protected: protected.into_iter().map(Into::into).collect(),
        }
    }

    fn is_protected(&self, key: &str) -> bool {
        key.ends_with("_balance") || self.protected.iter().any(|p| p == key)
    }
}

impl Default for LedgerMergePolicy {
    fn default() -> Self {
        Self::new(["balance", "posted", "posted_at"])
    }
}

impl FieldMergePolicy for LedgerMergePolicy {
    fn merge(&self, local: &Payload, remote: &Payload) -> Payload {
        let mut merged = shallow_merge(local, remote);
        merged.retain(|key, _| !self.is_protected(key) || remote.contains_key(key));
        for (key, value) in remote {
            if self.is_protected(key) {
                merged.insert(key.clone(), value.clone());
            }
        }
        merged
    }
}

/// Remote is the base, local wins on key collision.
pub fn shallow_merge(local: &Payload, remote: &Payload) -> Payload {
    let mut merged = remote.clone();
    for (key, value) in local {
        merged.insert(key.clone(), value.clone());
    }
    merged
}

/// [`shallow_merge`] over arbitrary JSON; non-objects prefer local.
pub fn merge_values(local: &Value, remote: &Value) -> Value {
    match (local, remote) {
        (Value::Object(l), Value::Object(r)) => Value::Object(shallow_merge(l, r)),
        (Value::Null, other) => other.clone(),
        _ => local.clone(),
    }
}

/// Update-path detection against the version the local edit was based on.
pub fn detect_conflict(
    base_version: i64,
    base_updated_at: Option<DateTime<Utc>>,
    remote: &RemoteRecord,
) -> bool {
    if remote.version != base_version {
        return true;
    }
    matches!(
        (remote.updated_at, base_updated_at),
        (Some(remote_at), Some(base_at)) if remote_at > base_at
    )
}

pub fn detect_record_conflict(local: &SyncableRecord, remote: &RemoteRecord) -> bool {
    detect_conflict(local.base_version, local.base_updated_at, remote)
}

/// Create-path detection: both sides hold a record under the same natural key.
pub fn detect_create_collision(
    natural_key_field: Option<&str>,
    local: &Payload,
    remote: &RemoteRecord,
) -> bool {
    match natural_key_field {
        Some(field) => matches!(
            (local.get(field), remote.fields.get(field)),
            (Some(l), Some(r)) if l == r && !l.is_null()
        ),
        None => false,
    }
}

/// Applies `strategy` with the shallow merge.
pub fn resolve(strategy: ConflictStrategy, local: &Payload, remote: &Payload) -> Resolution {
    resolve_with(strategy, local, remote, None)
}

fn resolve_with(
    strategy: ConflictStrategy,
    local: &Payload,
    remote: &Payload,
    policy: Option<&dyn FieldMergePolicy>,
) -> Resolution {
    match strategy {
        ConflictStrategy::Local => Resolution::Resolved {
            payload: local.clone(),
            push: true,
        },
        ConflictStrategy::Remote => Resolution::Resolved {
            payload: remote.clone(),
            push: false,
        },
        ConflictStrategy::Merge => Resolution::Resolved {
            payload: match policy {
                Some(policy) => policy.merge(local, remote),
                None => shallow_merge(local, remote),
            },
            push: true,
        },
        ConflictStrategy::Ask => Resolution::Deferred(ConflictDescriptor {
            local: local.clone(),
            remote: remote.clone(),
        }),
    }
}

/// Strategy selection: per-entity override, then per-domain, then the default.
#[derive(Clone, Default)]
pub struct ConflictResolver {
    default_strategy: ConflictStrategy,
    domain_overrides: HashMap<BusinessDomain, ConflictStrategy>,
    entity_overrides: HashMap<String, ConflictStrategy>,
    merge_policies: HashMap<String, Arc<dyn FieldMergePolicy>>,
}

impl fmt::Debug for ConflictResolver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConflictResolver")
            .field("default_strategy", &self.default_strategy)
            .field("domain_overrides", &self.domain_overrides)
            .field("entity_overrides", &self.entity_overrides)
            .field("merge_policies", &self.merge_policies.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl ConflictResolver {
    pub fn new(default_strategy: ConflictStrategy) -> Self {
        Self {
            default_strategy,
            ..Default::default()
        }
    }

    pub fn with_domain_strategy(mut self, domain: BusinessDomain, strategy: ConflictStrategy) -> Self {
        self.domain_overrides.insert(domain, strategy);
        self
    }

    pub fn with_entity_strategy(mut self, entity: impl Into<String>, strategy: ConflictStrategy) -> Self {
        self.entity_overrides.insert(entity.into(), strategy);
        self
    }

    pub fn with_merge_policy(
        mut self,
        entity: impl Into<String>,
        policy: Arc<dyn FieldMergePolicy>,
    ) -> Self {
        self.merge_policies.insert(entity.into(), policy);
        self
    }

    pub fn default_strategy(&self) -> ConflictStrategy {
        self.default_strategy
    }

    pub fn strategy_for(&self, domain: BusinessDomain, entity: &str) -> ConflictStrategy {
        self.entity_overrides
            .get(entity)
            .or_else(|| self.domain_overrides.get(&domain))
            .copied()
            .unwrap_or(self.default_strategy)
    }

    /// Like [`resolve`], using the entity's field-aware merge if registered.
    pub fn resolve(
        &self,
        entity: &str,
        strategy: ConflictStrategy,
        local: &Payload,
        remote: &Payload,
    ) -> Resolution {
        let policy = self.merge_policies.get(entity).map(|p| p.as_ref());
        resolve_with(strategy, local, remote, policy)
    }
}
