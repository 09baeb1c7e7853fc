use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::str::FromStr;

use super::conflict::ConflictStrategy;
use super::domain::SyncPriority;

/// Kind of write a queued mutation replays against the server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MutationOperation {
    Create,
    Update,
    Delete,
    Custom,
}

impl fmt::Display for MutationOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MutationOperation::Create => write!(f, "create"),
            MutationOperation::Update => write!(f, "update"),
            MutationOperation::Delete => write!(f, "delete"),
            MutationOperation::Custom => write!(f, "custom"),
        }
    }
}

impl FromStr for MutationOperation {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "create" => Ok(MutationOperation::Create),
            "update" => Ok(MutationOperation::Update),
            "delete" => Ok(MutationOperation::Delete),
            "custom" => Ok(MutationOperation::Custom),
            _ => Err(format!(
                "Invalid operation '{}'. Valid options: create, update, delete, custom",
                s
            )),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MutationStatus {
    Pending,
    Processing,
    Failed,
    Completed,
    Conflict,
}

impl MutationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            MutationStatus::Pending => "pending",
            MutationStatus::Processing => "processing",
            MutationStatus::Failed => "failed",
            MutationStatus::Completed => "completed",
            MutationStatus::Conflict => "conflict",
        }
    }
}

impl fmt::Display for MutationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MutationStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "pending" => Ok(MutationStatus::Pending),
            "processing" => Ok(MutationStatus::Processing),
            "failed" => Ok(MutationStatus::Failed),
            "completed" => Ok(MutationStatus::Completed),
            "conflict" => Ok(MutationStatus::Conflict),
            _ => Err(format!("Invalid mutation status '{}'", s)),
        }
    }
}

/// A mutation as submitted by a caller, before it is persisted.
///
/// `operation` is optional so that a malformed submission can be rejected
/// with a validation error instead of failing to construct.
#[derive(Debug, Clone, Default)]
pub struct NewMutation {
    pub endpoint: String,
    pub operation: Option<MutationOperation>,
    pub table: String,
    pub local_id: Option<String>,
    pub remote_id: Option<String>,
    pub payload: Value,
    pub priority: Option<i32>,
    pub max_retries: Option<u32>,
    pub conflict_resolution: Option<ConflictStrategy>,
}

impl NewMutation {
    pub fn new(
        endpoint: impl Into<String>,
        operation: MutationOperation,
        table: impl Into<String>,
    ) -> Self {
        Self {
            endpoint: endpoint.into(),
            operation: Some(operation),
            table: table.into(),
            payload: Value::Object(Default::default()),
            ..Default::default()
        }
    }

    pub fn with_payload(mut self, payload: Value) -> Self {
        self.payload = payload;
        self
    }

    pub fn with_priority(mut self, priority: impl Into<i32>) -> Self {
        self.priority = Some(priority.into());
        self
    }

    pub fn with_local_id(mut self, local_id: impl Into<String>) -> Self {
        self.local_id = Some(local_id.into());
        self
    }

    pub fn with_remote_id(mut self, remote_id: impl Into<String>) -> Self {
        self.remote_id = Some(remote_id.into());
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = Some(max_retries);
        self
    }

    pub fn with_conflict_resolution(mut self, strategy: ConflictStrategy) -> Self {
        self.conflict_resolution = Some(strategy);
        self
    }

    pub(crate) fn default_priority() -> i32 {
        SyncPriority::Medium.value()
    }
}

/// A persisted, retryable mutation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MutationQueueItem {
    pub id: String,
    pub endpoint: String,
    pub table: String,
    pub local_id: Option<String>,
    pub remote_id: Option<String>,
    pub operation: MutationOperation,
    pub payload: Value,
    /// Urgency rank; 1 is dispatched before 2.
    pub priority: i32,
    pub status: MutationStatus,
    pub retries: u32,
    pub max_retries: u32,
    pub created_at: DateTime<Utc>,
    pub last_attempt_at: Option<DateTime<Utc>>,
    pub next_attempt_at: Option<DateTime<Utc>>,
    pub error_message: Option<String>,
    pub conflict_resolution: ConflictStrategy,
}

impl MutationQueueItem {
    /// True once the item has used up its retry budget.
    pub fn is_exhausted(&self) -> bool {
        self.retries >= self.max_retries
    }

    /// Whether the backoff window has elapsed at `now`.
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.next_attempt_at.map_or(true, |at| at <= now)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_operation_from_str() {
        assert_eq!(
            MutationOperation::from_str("CREATE").unwrap(),
            MutationOperation::Create
        );
        assert_eq!(
            MutationOperation::from_str("custom").unwrap(),
            MutationOperation::Custom
        );
        assert!(MutationOperation::from_str("upsert").is_err());
    }

    #[test]
    fn test_status_roundtrip_text() {
        for status in [
            MutationStatus::Pending,
            MutationStatus::Processing,
            MutationStatus::Failed,
            MutationStatus::Completed,
            MutationStatus::Conflict,
        ] {
            assert_eq!(MutationStatus::from_str(status.as_str()).unwrap(), status);
        }
    }

    #[test]
    fn test_new_mutation_builder() {
        let m = NewMutation::new("/api/products", MutationOperation::Update, "products")
            .with_priority(SyncPriority::Critical)
            .with_local_id("local-1")
            .with_max_retries(2);

        assert_eq!(m.operation, Some(MutationOperation::Update));
        assert_eq!(m.priority, Some(1));
        assert_eq!(m.local_id.as_deref(), Some("local-1"));
        assert_eq!(m.max_retries, Some(2));
        assert!(m.payload.is_object());
    }

    #[test]
    fn test_is_due() {
        let now = Utc::now();
        let mut item = MutationQueueItem {
            id: "1".into(),
            endpoint: "/x".into(),
            table: "t".into(),
            local_id: None,
            remote_id: None,
            operation: MutationOperation::Create,
            payload: Value::Null,
            priority: 3,
            status: MutationStatus::Pending,
            retries: 0,
            max_retries: 3,
            created_at: now,
            last_attempt_at: None,
            next_attempt_at: None,
            error_message: None,
            conflict_resolution: ConflictStrategy::Merge,
        };
        assert!(item.is_due(now));

        item.next_attempt_at = Some(now + chrono::Duration::seconds(30));
        assert!(!item.is_due(now));
        assert!(item.is_due(now + chrono::Duration::seconds(31)));
    }
}
