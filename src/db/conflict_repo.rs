use chrono::{DateTime, Utc};

use super::RecordStore;
use crate::error::{Result, SyncError};
use crate::models::{format_ts, parse_opt_ts, parse_ts, ConflictRecord, ConflictStrategy};

#[derive(Clone, Debug)]
pub struct ConflictRepository {
    store: RecordStore,
}

#[derive(sqlx::FromRow)]
struct ConflictRow {
    id: String,
    queue_item_id: Option<String>,
    table_name: String,
    local_id: Option<String>,
    domain: Option<String>,
    local_payload: String,
    remote_payload: String,
    resolution: Option<String>,
    created_at: String,
    resolved_at: Option<String>,
}

impl ConflictRow {
    fn into_record(self) -> Result<ConflictRecord> {
        Ok(ConflictRecord {
            local_payload: serde_json::from_str(&self.local_payload)?,
            remote_payload: serde_json::from_str(&self.remote_payload)?,
            resolution: self
                .resolution
                .as_deref()
                .map(str::parse::<ConflictStrategy>)
                .transpose()
                .map_err(SyncError::Validation)?,
            created_at: parse_ts(&self.created_at)?,
            resolved_at: parse_opt_ts(self.resolved_at.as_deref())?,
            id: self.id,
            queue_item_id: self.queue_item_id,
            table: self.table_name,
            local_id: self.local_id,
            domain: self.domain,
        })
    }
}

impl ConflictRepository {
    pub fn new(store: RecordStore) -> Self {
        Self { store }
    }

    pub async fn insert(&self, conflict: &ConflictRecord) -> Result<()> {
        let local = serde_json::to_string(&conflict.local_payload)?;
        let remote = serde_json::to_string(&conflict.remote_payload)?;
        let created_at = format_ts(&conflict.created_at);

        self.store
            .timed("record conflict", async {
                sqlx::query(
                    r#"
                    INSERT INTO sync_conflicts (id, queue_item_id, table_name, local_id, domain,
                                                local_payload, remote_payload, created_at)
                    VALUES (?, ?, ?, ?, ?, ?, ?, ?)
                    "#,
                )
                .bind(&conflict.id)
                .bind(&conflict.queue_item_id)
                .bind(&conflict.table)
                .bind(&conflict.local_id)
                .bind(&conflict.domain)
                .bind(&local)
                .bind(&remote)
                .bind(&created_at)
                .execute(self.store.pool())
                .await?;
                Ok::<_, SyncError>(())
            })
            .await
    }

    pub async fn get(&self, id: &str) -> Result<Option<ConflictRecord>> {
        let row: Option<ConflictRow> = self
            .store
            .timed("get conflict", async {
                Ok::<_, SyncError>(
                    sqlx::query_as("SELECT * FROM sync_conflicts WHERE id = ?")
                        .bind(id)
                        .fetch_optional(self.store.pool())
                        .await?,
                )
            })
            .await?;
        row.map(ConflictRow::into_record).transpose()
    }

    /// Unresolved conflicts, oldest first.
    pub async fn list_open(&self) -> Result<Vec<ConflictRecord>> {
        let rows: Vec<ConflictRow> = self
            .store
            .timed("list conflicts", async {
                Ok::<_, SyncError>(
                    sqlx::query_as(
                        "SELECT * FROM sync_conflicts WHERE resolved_at IS NULL ORDER BY created_at",
                    )
                    .fetch_all(self.store.pool())
                    .await?,
                )
            })
            .await?;
        rows.into_iter().map(ConflictRow::into_record).collect()
    }

    /// Open conflict for a table record, if any.
    pub async fn find_open_for_record(
        &self,
        table: &str,
        local_id: &str,
    ) -> Result<Option<ConflictRecord>> {
        let row: Option<ConflictRow> = self
            .store
            .timed("find conflict", async {
                Ok::<_, SyncError>(
                    sqlx::query_as(
                        r#"
                        SELECT * FROM sync_conflicts
                        WHERE table_name = ? AND local_id = ? AND resolved_at IS NULL
                        ORDER BY created_at DESC LIMIT 1
                        "#,
                    )
                    .bind(table)
                    .bind(local_id)
                    .fetch_optional(self.store.pool())
                    .await?,
                )
            })
            .await?;
        row.map(ConflictRow::into_record).transpose()
    }

    pub async fn mark_resolved(
        &self,
        id: &str,
        resolution: ConflictStrategy,
        at: DateTime<Utc>,
    ) -> Result<bool> {
        let at = format_ts(&at);
        let affected = self
            .store
            .timed("resolve conflict", async {
                Ok::<_, SyncError>(
                    sqlx::query(
                        "UPDATE sync_conflicts SET resolution = ?, resolved_at = ? WHERE id = ? AND resolved_at IS NULL",
                    )
                    .bind(resolution.as_str())
                    .bind(&at)
                    .bind(id)
                    .execute(self.store.pool())
                    .await?
                    .rows_affected(),
                )
            })
            .await?;
        Ok(affected > 0)
    }
}
