use chrono::Utc;

use super::RecordStore;
use crate::error::{Result, SyncError};
use crate::models::{format_ts, SyncCheckpoint};

/// One serialized checkpoint per domain service name.
#[derive(Clone, Debug)]
pub struct CheckpointRepository {
    store: RecordStore,
}

impl CheckpointRepository {
    pub fn new(store: RecordStore) -> Self {
        Self { store }
    }

    pub async fn save(&self, service_name: &str, checkpoint: &SyncCheckpoint) -> Result<()> {
        let json = serde_json::to_string(checkpoint)?;
        let now = format_ts(&Utc::now());

        self.store
            .timed("save checkpoint", async {
                sqlx::query(
                    r#"
                    INSERT INTO sync_checkpoints (service_name, checkpoint, updated_at)
                    VALUES (?, ?, ?)
                    ON CONFLICT(service_name) DO UPDATE SET
                        checkpoint = excluded.checkpoint,
                        updated_at = excluded.updated_at
                    "#,
                )
                .bind(service_name)
                .bind(&json)
                .bind(&now)
                .execute(self.store.pool())
                .await?;
                Ok::<_, SyncError>(())
            })
            .await
    }

    pub async fn load(&self, service_name: &str) -> Result<Option<SyncCheckpoint>> {
        let json: Option<String> = self
            .store
            .timed("load checkpoint", async {
                Ok::<_, SyncError>(
                    sqlx::query_scalar(
                        "SELECT checkpoint FROM sync_checkpoints WHERE service_name = ?",
                    )
                    .bind(service_name)
                    .fetch_optional(self.store.pool())
                    .await?,
                )
            })
            .await?;

        match json {
            Some(json) => Ok(Some(serde_json::from_str(&json)?)),
            None => Ok(None),
        }
    }

    pub async fn delete(&self, service_name: &str) -> Result<bool> {
        let affected = self
            .store
            .timed("reset checkpoint", async {
                Ok::<_, SyncError>(
                    sqlx::query("DELETE FROM sync_checkpoints WHERE service_name = ?")
                        .bind(service_name)
                        .execute(self.store.pool())
                        .await?
                        .rows_affected(),
                )
            })
            .await?;
        Ok(affected > 0)
    }
}
