use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use std::str::FromStr;

/// Field map carried by every syncable record.
pub type Payload = Map<String, Value>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncStatus {
    Pending,
    Synced,
    Conflict,
    Failed,
}

impl SyncStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncStatus::Pending => "pending",
            SyncStatus::Synced => "synced",
            SyncStatus::Conflict => "conflict",
            SyncStatus::Failed => "failed",
        }
    }
}

impl fmt::Display for SyncStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SyncStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "pending" => Ok(SyncStatus::Pending),
            "synced" => Ok(SyncStatus::Synced),
            "conflict" => Ok(SyncStatus::Conflict),
            "failed" => Ok(SyncStatus::Failed),
            _ => Err(format!("Invalid sync status '{}'", s)),
        }
    }
}

/// A locally stored row in one of the entity tables.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncableRecord {
    pub local_id: String,
    pub remote_id: Option<String>,
    pub table: String,
    pub natural_key: Option<String>,
    pub payload: Payload,
    pub version: i64,
    pub updated_at: DateTime<Utc>,
    /// Remote version the local edit was made against.
    pub base_version: i64,
    pub base_updated_at: Option<DateTime<Utc>>,
    pub sync_status: SyncStatus,
    pub dirty: bool,
    pub deleted: bool,
    pub retries: u32,
    /// Monotonic insertion order, used as the batch cursor.
    pub sequence: i64,
}

impl SyncableRecord {
    /// True until the server has acknowledged the record at least once.
    pub fn is_new(&self) -> bool {
        self.remote_id.is_none()
    }
}

/// A record as returned by the server.
///
/// Everything besides the envelope fields lands in `fields`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemoteRecord {
    pub id: String,
    #[serde(default)]
    pub version: i64,
    #[serde(rename = "updatedAt", default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub deleted: bool,
    #[serde(flatten)]
    pub fields: Payload,
}

impl RemoteRecord {
    pub fn from_value(value: Value) -> Result<Self, serde_json::Error> {
        serde_json::from_value(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_remote_record_splits_envelope() {
        let remote = RemoteRecord::from_value(json!({
            "id": "srv-1",
            "version": 3,
            "updatedAt": "2024-05-01T10:00:00Z",
            "name": "Widget",
            "price": 12.5
        }))
        .unwrap();

        assert_eq!(remote.id, "srv-1");
        assert_eq!(remote.version, 3);
        assert!(remote.updated_at.is_some());
        assert!(!remote.deleted);
        assert_eq!(remote.fields.len(), 2);
        assert_eq!(remote.fields["name"], "Widget");
    }

    #[test]
    fn test_remote_record_defaults() {
        let remote = RemoteRecord::from_value(json!({"id": "x"})).unwrap();
        assert_eq!(remote.version, 0);
        assert_eq!(remote.updated_at, None);
        assert!(remote.fields.is_empty());
    }

    #[test]
    fn test_sync_status_from_str() {
        assert_eq!(SyncStatus::from_str("SYNCED").unwrap(), SyncStatus::Synced);
        assert!(SyncStatus::from_str("unsynced").is_err());
    }
}
