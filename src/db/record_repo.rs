use chrono::{DateTime, Utc};
use uuid::Uuid;

use super::{validate_identifier, RecordStore};
use crate::error::{Result, SyncError};
use crate::models::{format_ts, parse_opt_ts, parse_ts, Payload, RemoteRecord, SyncStatus, SyncableRecord};

/// Column layout shared by every entity table.
pub const ENTITY_COLUMNS: &str = "\
    seq INTEGER PRIMARY KEY AUTOINCREMENT, \
    local_id TEXT NOT NULL UNIQUE, \
    remote_id TEXT UNIQUE, \
    natural_key TEXT, \
    payload TEXT NOT NULL DEFAULT '{}', \
    version INTEGER NOT NULL DEFAULT 0, \
    updated_at TEXT NOT NULL, \
    base_version INTEGER NOT NULL DEFAULT 0, \
    base_updated_at TEXT, \
    sync_status TEXT NOT NULL DEFAULT 'pending', \
    dirty INTEGER NOT NULL DEFAULT 1, \
    deleted INTEGER NOT NULL DEFAULT 0, \
    retries INTEGER NOT NULL DEFAULT 0";

/// What a pulled remote record did to local state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyOutcome {
    Inserted,
    Updated,
    Unchanged,
    /// The local copy has unpushed edits and was left alone.
    SkippedDirty,
    Deleted,
}

#[derive(sqlx::FromRow)]
struct RecordRow {
    seq: i64,
    local_id: String,
    remote_id: Option<String>,
    natural_key: Option<String>,
    payload: String,
    version: i64,
    updated_at: String,
    base_version: i64,
    base_updated_at: Option<String>,
    sync_status: String,
    dirty: i64,
    deleted: i64,
    retries: i64,
}

impl RecordRow {
    fn into_record(self, table: &str) -> Result<SyncableRecord> {
        Ok(SyncableRecord {
            local_id: self.local_id,
            remote_id: self.remote_id,
            table: table.to_string(),
            natural_key: self.natural_key,
            payload: serde_json::from_str(&self.payload)?,
            version: self.version,
            updated_at: parse_ts(&self.updated_at)?,
            base_version: self.base_version,
            base_updated_at: parse_opt_ts(self.base_updated_at.as_deref())?,
            sync_status: self.sync_status.parse().unwrap_or(SyncStatus::Pending),
            dirty: self.dirty != 0,
            deleted: self.deleted != 0,
            retries: self.retries.max(0) as u32,
            sequence: self.seq,
        })
    }
}

/// Generic access to the envelope columns of entity tables.
#[derive(Clone, Debug)]
pub struct RecordRepository {
    store: RecordStore,
}

impl RecordRepository {
    pub fn new(store: RecordStore) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &RecordStore {
        &self.store
    }

    /// Creates the entity table and its cursor index if missing.
    pub async fn ensure_table(&self, table: &str) -> Result<()> {
        self.store
            .create_table_if_not_exists(table, ENTITY_COLUMNS)
            .await?;
        let index = format!(
            "CREATE INDEX IF NOT EXISTS idx_{table}_dirty_seq ON {table}(dirty, seq)",
            table = table
        );
        self.store.execute(&index, &[]).await?;
        Ok(())
    }

    /// Records a local create or edit. The row becomes dirty until pushed.
    pub async fn save_local(
        &self,
        table: &str,
        local_id: Option<&str>,
        payload: &Payload,
        natural_key: Option<&str>,
    ) -> Result<SyncableRecord> {
        validate_identifier(table)?;
        let local_id = local_id
            .map(str::to_string)
            .unwrap_or_else(|| Uuid::new_v4().to_string());
        let payload_json = serde_json::to_string(payload)?;
        let now = format_ts(&Utc::now());

        let sql = format!(
            r#"
            INSERT INTO {table} (local_id, natural_key, payload, updated_at, sync_status, dirty)
            VALUES (?, ?, ?, ?, 'pending', 1)
            ON CONFLICT(local_id) DO UPDATE SET
                payload = excluded.payload,
                natural_key = COALESCE(excluded.natural_key, {table}.natural_key),
                updated_at = excluded.updated_at,
                dirty = 1,
                sync_status = CASE WHEN {table}.sync_status = 'conflict' THEN 'conflict' ELSE 'pending' END
            "#,
            table = table
        );

        self.store
            .timed("save local record", async {
                sqlx::query(&sql)
                    .bind(&local_id)
                    .bind(natural_key)
                    .bind(&payload_json)
                    .bind(&now)
                    .execute(self.store.pool())
                    .await?;
                Ok::<_, SyncError>(())
            })
            .await?;

        self.require(table, &local_id).await
    }

    /// Local delete: never-pushed rows vanish, pushed rows become tombstones.
    pub async fn delete_local(&self, table: &str, local_id: &str) -> Result<()> {
        validate_identifier(table)?;
        let remove = format!("DELETE FROM {} WHERE local_id = ? AND remote_id IS NULL", table);
        let tombstone = format!(
            "UPDATE {} SET deleted = 1, dirty = 1, sync_status = 'pending', updated_at = ? WHERE local_id = ?",
            table
        );
        let now = format_ts(&Utc::now());

        self.store
            .timed("delete local record", async {
                let mut tx = self.store.pool().begin().await?;
                let removed = sqlx::query(&remove)
                    .bind(local_id)
                    .execute(&mut *tx)
                    .await?
                    .rows_affected();
                if removed == 0 {
                    sqlx::query(&tombstone)
                        .bind(&now)
                        .bind(local_id)
                        .execute(&mut *tx)
                        .await?;
                }
                tx.commit().await?;
                Ok::<_, SyncError>(())
            })
            .await
    }

    pub async fn get(&self, table: &str, local_id: &str) -> Result<Option<SyncableRecord>> {
        self.fetch_one_where(table, "local_id = ?", local_id).await
    }

    pub async fn find_by_remote_id(
        &self,
        table: &str,
        remote_id: &str,
    ) -> Result<Option<SyncableRecord>> {
        self.fetch_one_where(table, "remote_id = ?", remote_id).await
    }

    pub async fn find_by_natural_key(
        &self,
        table: &str,
        natural_key: &str,
    ) -> Result<Option<SyncableRecord>> {
        self.fetch_one_where(table, "natural_key = ?", natural_key)
            .await
    }

    async fn require(&self, table: &str, local_id: &str) -> Result<SyncableRecord> {
        self.get(table, local_id)
            .await?
            .ok_or_else(|| SyncError::NotFound(format!("{}/{}", table, local_id)))
    }

    async fn fetch_one_where(
        &self,
        table: &str,
        condition: &str,
        value: &str,
    ) -> Result<Option<SyncableRecord>> {
        validate_identifier(table)?;
        let sql = format!("SELECT * FROM {} WHERE {} LIMIT 1", table, condition);
        let row: Option<RecordRow> = self
            .store
            .timed("fetch record", async {
                Ok::<_, SyncError>(sqlx::query_as(&sql)
                    .bind(value)
                    .fetch_optional(self.store.pool())
                    .await?)
            })
            .await?;
        row.map(|r| r.into_record(table)).transpose()
    }

    /// Dirty, non-conflicting rows after `after_seq`, in insertion order.
    pub async fn next_unsynced(
        &self,
        table: &str,
        after_seq: i64,
        limit: usize,
    ) -> Result<Vec<SyncableRecord>> {
        validate_identifier(table)?;
        let sql = format!(
            "SELECT * FROM {} WHERE dirty = 1 AND sync_status != 'conflict' AND seq > ? ORDER BY seq LIMIT ?",
            table
        );
        let rows: Vec<RecordRow> = self
            .store
            .timed("select unsynced", async {
                Ok::<_, SyncError>(sqlx::query_as(&sql)
                    .bind(after_seq)
                    .bind(limit as i64)
                    .fetch_all(self.store.pool())
                    .await?)
            })
            .await?;
        rows.into_iter().map(|r| r.into_record(table)).collect()
    }

    pub async fn count_unsynced(&self, table: &str) -> Result<u64> {
        validate_identifier(table)?;
        let sql = format!(
            "SELECT COUNT(*) FROM {} WHERE dirty = 1 AND sync_status != 'conflict'",
            table
        );
        let count: i64 = self
            .store
            .timed("count unsynced", async {
                Ok::<_, SyncError>(sqlx::query_scalar(&sql)
                    .fetch_one(self.store.pool())
                    .await?)
            })
            .await?;
        Ok(count.max(0) as u64)
    }

    /// Every non-conflicting row, dirty or not.
    pub async fn list_live(&self, table: &str) -> Result<Vec<SyncableRecord>> {
        validate_identifier(table)?;
        let sql = format!(
            "SELECT * FROM {} WHERE sync_status != 'conflict' ORDER BY seq",
            table
        );
        let rows: Vec<RecordRow> = self
            .store
            .timed("list records", async {
                Ok::<_, SyncError>(sqlx::query_as(&sql).fetch_all(self.store.pool()).await?)
            })
            .await?;
        rows.into_iter().map(|r| r.into_record(table)).collect()
    }

    /// Marks a pushed record as synced.
    ///
    /// The clean flag is only set if the row was not edited again after
    /// `pushed_at`; a newer local edit keeps it dirty.
    pub async fn mark_synced(
        &self,
        table: &str,
        local_id: &str,
        remote_id: &str,
        version: i64,
        remote_updated_at: Option<DateTime<Utc>>,
        pushed_at: DateTime<Utc>,
    ) -> Result<bool> {
        validate_identifier(table)?;
        let sql = format!(
            r#"
            UPDATE {} SET
                remote_id = ?,
                version = ?,
                base_version = ?,
                base_updated_at = ?,
                retries = 0,
                dirty = CASE WHEN updated_at = ? THEN 0 ELSE dirty END,
                sync_status = CASE WHEN updated_at = ? THEN 'synced' ELSE 'pending' END
            WHERE local_id = ?
            "#,
            table
        );
        let base_updated = remote_updated_at.map(|t| format_ts(&t));
        let pushed = format_ts(&pushed_at);

        self.store
            .timed("mark synced", async {
                sqlx::query(&sql)
                    .bind(remote_id)
                    .bind(version)
                    .bind(version)
                    .bind(&base_updated)
                    .bind(&pushed)
                    .bind(&pushed)
                    .bind(local_id)
                    .execute(self.store.pool())
                    .await?;
                Ok::<_, SyncError>(())
            })
            .await?;

        Ok(self
            .get(table, local_id)
            .await?
            .map(|r| !r.dirty)
            .unwrap_or(false))
    }

    pub async fn mark_failed(&self, table: &str, local_id: &str) -> Result<()> {
        self.set_status(table, local_id, SyncStatus::Failed, true).await
    }

    pub async fn mark_conflict(&self, table: &str, local_id: &str) -> Result<()> {
        self.set_status(table, local_id, SyncStatus::Conflict, false).await
    }

    async fn set_status(
        &self,
        table: &str,
        local_id: &str,
        status: SyncStatus,
        bump_retries: bool,
    ) -> Result<()> {
        validate_identifier(table)?;
        let sql = format!(
            "UPDATE {} SET sync_status = ?, retries = retries + ? WHERE local_id = ?",
            table
        );
        self.store
            .timed("set record status", async {
                sqlx::query(&sql)
                    .bind(status.as_str())
                    .bind(if bump_retries { 1i64 } else { 0 })
                    .bind(local_id)
                    .execute(self.store.pool())
                    .await?;
                Ok::<_, SyncError>(())
            })
            .await
    }

    /// Rewrites a record after a conflict resolution.
    ///
    /// `dirty=true` queues the resolved payload for the next push against
    /// the remote base; `dirty=false` means the remote state was adopted.
    pub async fn apply_resolution(
        &self,
        table: &str,
        local_id: &str,
        payload: &Payload,
        remote: &RemoteRecord,
        dirty: bool,
    ) -> Result<()> {
        validate_identifier(table)?;
        let sql = format!(
            r#"
            UPDATE {} SET
                payload = ?,
                remote_id = COALESCE(remote_id, ?),
                version = ?,
                base_version = ?,
                base_updated_at = ?,
                updated_at = ?,
                dirty = ?,
                deleted = 0,
                sync_status = ?
            WHERE local_id = ?
            "#,
            table
        );
        let payload_json = serde_json::to_string(payload)?;
        let remote_updated = remote.updated_at.map(|t| format_ts(&t));
        let updated_at = if dirty {
            format_ts(&Utc::now())
        } else {
            remote_updated
                .clone()
                .unwrap_or_else(|| format_ts(&Utc::now()))
        };
        let status = if dirty {
            SyncStatus::Pending
        } else {
            SyncStatus::Synced
        };

        self.store
            .timed("apply resolution", async {
                sqlx::query(&sql)
                    .bind(&payload_json)
                    .bind(&remote.id)
                    .bind(remote.version)
                    .bind(remote.version)
                    .bind(&remote_updated)
                    .bind(&updated_at)
                    .bind(if dirty { 1i64 } else { 0 })
                    .bind(status.as_str())
                    .bind(local_id)
                    .execute(self.store.pool())
                    .await?;
                Ok::<_, SyncError>(())
            })
            .await
    }

    /// Upserts a pulled record without ever touching a dirty local row.
    ///
    /// Applying the same remote record twice leaves identical state.
    pub async fn apply_remote(
        &self,
        table: &str,
        remote: &RemoteRecord,
        natural_key_field: Option<&str>,
    ) -> Result<ApplyOutcome> {
        validate_identifier(table)?;
        let natural_key = natural_key_field
            .and_then(|field| remote.fields.get(field))
            .map(value_as_key);

        let mut existing = self.find_by_remote_id(table, &remote.id).await?;
        if existing.is_none() {
            if let Some(key) = &natural_key {
                existing = self
                    .find_by_natural_key(table, key)
                    .await?
                    .filter(|r| r.remote_id.is_none() || r.remote_id.as_deref() == Some(remote.id.as_str()));
            }
        }

        if let Some(local) = &existing {
            if local.dirty {
                return Ok(ApplyOutcome::SkippedDirty);
            }
        }

        if remote.deleted {
            return match existing {
                Some(local) => {
                    let sql = format!("DELETE FROM {} WHERE local_id = ?", table);
                    self.store
                        .timed("apply remote delete", async {
                            sqlx::query(&sql)
                                .bind(&local.local_id)
                                .execute(self.store.pool())
                                .await?;
                            Ok::<_, SyncError>(())
                        })
                        .await?;
                    Ok(ApplyOutcome::Deleted)
                }
                None => Ok(ApplyOutcome::Unchanged),
            };
        }

        let payload_json = serde_json::to_string(&remote.fields)?;
        let remote_updated = remote.updated_at.map(|t| format_ts(&t));

        match existing {
            Some(local)
                if local.version == remote.version
                    && local.payload == remote.fields
                    && local.remote_id.as_deref() == Some(remote.id.as_str()) =>
            {
                Ok(ApplyOutcome::Unchanged)
            }
            Some(local) => {
                let sql = format!(
                    r#"
                    UPDATE {} SET
                        remote_id = ?, natural_key = COALESCE(?, natural_key), payload = ?,
                        version = ?, base_version = ?, updated_at = ?, base_updated_at = ?,
                        sync_status = 'synced', dirty = 0, retries = 0
                    WHERE local_id = ? AND dirty = 0
                    "#,
                    table
                );
                let updated_at = remote_updated
                    .clone()
                    .unwrap_or_else(|| format_ts(&local.updated_at));
                self.store
                    .timed("apply remote update", async {
                        sqlx::query(&sql)
                            .bind(&remote.id)
                            .bind(&natural_key)
                            .bind(&payload_json)
                            .bind(remote.version)
                            .bind(remote.version)
                            .bind(&updated_at)
                            .bind(&remote_updated)
                            .bind(&local.local_id)
                            .execute(self.store.pool())
                            .await?;
                        Ok::<_, SyncError>(())
                    })
                    .await?;
                Ok(ApplyOutcome::Updated)
            }
            None => {
                let sql = format!(
                    r#"
                    INSERT INTO {} (local_id, remote_id, natural_key, payload, version, updated_at,
                                    base_version, base_updated_at, sync_status, dirty)
                    VALUES (?, ?, ?, ?, ?, ?, ?, ?, 'synced', 0)
                    "#,
                    table
                );
                let local_id = Uuid::new_v4().to_string();
                let updated_at = remote_updated
                    .clone()
                    .unwrap_or_else(|| format_ts(&Utc::now()));
                self.store
                    .timed("apply remote insert", async {
                        sqlx::query(&sql)
                            .bind(&local_id)
                            .bind(&remote.id)
                            .bind(&natural_key)
                            .bind(&payload_json)
                            .bind(remote.version)
                            .bind(&updated_at)
                            .bind(remote.version)
                            .bind(&remote_updated)
                            .execute(self.store.pool())
                            .await?;
                        Ok::<_, SyncError>(())
                    })
                    .await?;
                Ok(ApplyOutcome::Inserted)
            }
        }
    }

    /// Hard delete, used once a tombstone has reached the server.
    pub async fn remove(&self, table: &str, local_id: &str) -> Result<()> {
        validate_identifier(table)?;
        let sql = format!("DELETE FROM {} WHERE local_id = ?", table);
        self.store
            .timed("remove record", async {
                sqlx::query(&sql)
                    .bind(local_id)
                    .execute(self.store.pool())
                    .await?;
                Ok::<_, SyncError>(())
            })
            .await
    }

    pub async fn count(&self, table: &str) -> Result<u64> {
        validate_identifier(table)?;
        let sql = format!("SELECT COUNT(*) FROM {}", table);
        let count: i64 = self
            .store
            .timed("count records", async {
                Ok::<_, SyncError>(sqlx::query_scalar(&sql)
                    .fetch_one(self.store.pool())
                    .await?)
            })
            .await?;
        Ok(count.max(0) as u64)
    }
}

fn value_as_key(value: &serde_json::Value) -> String {
    match value {
        serde_json::Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}
