mod checkpoint;
mod conflict;
mod domain;
mod mutation;
mod record;

pub use checkpoint::SyncCheckpoint;
pub use conflict::{ConflictRecord, ConflictStrategy};
pub use domain::{BusinessDomain, DomainServiceDescriptor, SyncPriority};
pub use mutation::{MutationOperation, MutationQueueItem, MutationStatus, NewMutation};
pub use record::{Payload, RemoteRecord, SyncStatus, SyncableRecord};

use chrono::{DateTime, SecondsFormat, Utc};

use crate::error::{Result, SyncError};

/// Formats a timestamp for storage.
///
/// Fixed microsecond precision keeps the stored strings lexically ordered,
/// which the queue relies on for `ORDER BY created_at`.
pub(crate) fn format_ts(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

pub(crate) fn parse_ts(value: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| SyncError::Validation(format!("Invalid timestamp '{}': {}", value, e)))
}

pub(crate) fn parse_opt_ts(value: Option<&str>) -> Result<Option<DateTime<Utc>>> {
    value.map(parse_ts).transpose()
}
