use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::str::FromStr;

/// How to reconcile a record whose local and remote versions diverged.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConflictStrategy {
    /// Keep the local version and push it again.
    Local,
    /// Drop the pending local change and adopt the server's version.
    Remote,
    /// Shallow merge, local fields win on key collision.
    Merge,
    /// Persist the conflict and wait for an explicit resolution.
    Ask,
}

impl ConflictStrategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConflictStrategy::Local => "local",
            ConflictStrategy::Remote => "remote",
            ConflictStrategy::Merge => "merge",
            ConflictStrategy::Ask => "ask",
        }
    }
}

impl Default for ConflictStrategy {
    fn default() -> Self {
        ConflictStrategy::Merge
    }
}

impl fmt::Display for ConflictStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ConflictStrategy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "local" => Ok(ConflictStrategy::Local),
            "remote" => Ok(ConflictStrategy::Remote),
            "merge" => Ok(ConflictStrategy::Merge),
            "ask" => Ok(ConflictStrategy::Ask),
            _ => Err(format!(
                "Invalid conflict strategy '{}'. Valid options: local, remote, merge, ask",
                s
            )),
        }
    }
}

/// A persisted divergence between a local change and the server state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConflictRecord {
    pub id: String,
    /// Set when the conflict came from the mutation queue.
    pub queue_item_id: Option<String>,
    pub table: String,
    /// Set when the conflict came from a table record push.
    pub local_id: Option<String>,
    pub domain: Option<String>,
    pub local_payload: Value,
    pub remote_payload: Value,
    pub resolution: Option<ConflictStrategy>,
    pub created_at: DateTime<Utc>,
    pub resolved_at: Option<DateTime<Utc>>,
}

impl ConflictRecord {
    pub fn is_resolved(&self) -> bool {
        self.resolved_at.is_some()
    }
}
