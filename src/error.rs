//! Error types shared by the queue, the domain services and the orchestrator.

use std::future::Future;
use std::time::Duration;

use thiserror::Error;

/// Crate-wide result type
pub type Result<T> = std::result::Result<T, SyncError>;

/// Everything that can go wrong while queueing or synchronizing.
#[derive(Error, Debug)]
pub enum SyncError {
    /// A mutation or table definition is malformed.
    #[error("Validation error: {0}")]
    Validation(String),

    /// No network at call time.
    #[error("No network connectivity")]
    Connectivity,

    /// A deadline expired before the call completed.
    #[error("Timed out after {0:?} during {1}")]
    Timeout(Duration, String),

    /// The server answered with a non-success status.
    #[error("Remote error {status}: {body}")]
    Remote { status: u16, body: String },

    /// Local and remote versions diverged. Not a failure: the caller resolves it.
    #[error("Conflict detected on {table}/{id}")]
    ConflictDetected { table: String, id: String },

    #[error("Storage error: {0}")]
    Storage(#[from] sqlx::Error),

    #[error("Migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// The HTTP layer failed before a status was received.
    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Sync run cancelled")]
    Cancelled,

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl SyncError {
    /// Errors worth retrying later rather than reporting as hard failures.
    pub fn is_transient(&self) -> bool {
        match self {
            SyncError::Connectivity | SyncError::Timeout(..) | SyncError::Transport(_) => true,
            SyncError::Remote { status, .. } => *status == 408 || *status == 429 || *status >= 500,
            _ => false,
        }
    }

    /// True for both a detected divergence and an HTTP 409 from the server.
    pub fn is_conflict(&self) -> bool {
        matches!(
            self,
            SyncError::ConflictDetected { .. } | SyncError::Remote { status: 409, .. }
        )
    }

    pub fn remote(status: u16, body: impl Into<String>) -> Self {
        SyncError::Remote {
            status,
            body: body.into(),
        }
    }
}

/// Runs `fut` under an explicit deadline, mapping expiry to [`SyncError::Timeout`].
pub async fn with_deadline<T, F>(limit: Duration, what: &str, fut: F) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    match tokio::time::timeout(limit, fut).await {
        Ok(result) => result,
        Err(_) => Err(SyncError::Timeout(limit, what.to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_classification() {
        assert!(SyncError::Connectivity.is_transient());
        assert!(SyncError::Timeout(Duration::from_secs(1), "get".into()).is_transient());
        assert!(SyncError::remote(503, "unavailable").is_transient());
        assert!(SyncError::remote(429, "slow down").is_transient());
        assert!(!SyncError::remote(400, "bad").is_transient());
        assert!(!SyncError::Validation("missing endpoint".into()).is_transient());
    }

    #[test]
    fn test_conflict_classification() {
        assert!(SyncError::remote(409, "{}").is_conflict());
        assert!(SyncError::ConflictDetected {
            table: "products".into(),
            id: "p-1".into()
        }
        .is_conflict());
        assert!(!SyncError::remote(500, "").is_conflict());
    }

    #[tokio::test]
    async fn test_with_deadline_expires() {
        let result: Result<()> = with_deadline(Duration::from_millis(10), "sleep", async {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok(())
        })
        .await;

        match result {
            Err(SyncError::Timeout(_, what)) => assert_eq!(what, "sleep"),
            other => panic!("expected timeout, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_with_deadline_passes_through() {
        let value = with_deadline(Duration::from_secs(1), "noop", async { Ok::<_, SyncError>(7) })
            .await
            .unwrap();
        assert_eq!(value, 7);
    }
}
