use chrono::{DateTime, Utc};
use std::collections::HashMap;

use super::RecordStore;
use crate::error::{Result, SyncError};
use crate::models::{
    format_ts, parse_opt_ts, parse_ts, ConflictStrategy, MutationOperation, MutationQueueItem,
    MutationStatus,
};

/// Persistence for the offline mutation queue.
#[derive(Clone, Debug)]
pub struct MutationQueueRepository {
    store: RecordStore,
}

#[derive(sqlx::FromRow)]
struct QueueRow {
    id: String,
    endpoint: String,
    operation: String,
    payload: String,
    table_name: String,
    local_id: Option<String>,
    remote_id: Option<String>,
    status: String,
    retries: i64,
    max_retries: i64,
    priority: i64,
    created_at: String,
    last_attempt_at: Option<String>,
    next_attempt_at: Option<String>,
    error_message: Option<String>,
    conflict_resolution: String,
}

impl QueueRow {
    fn into_item(self) -> Result<MutationQueueItem> {
        Ok(MutationQueueItem {
            operation: self
                .operation
                .parse::<MutationOperation>()
                .map_err(SyncError::Validation)?,
            status: self
                .status
                .parse::<MutationStatus>()
                .map_err(SyncError::Validation)?,
            conflict_resolution: self
                .conflict_resolution
                .parse::<ConflictStrategy>()
                .unwrap_or_default(),
            payload: serde_json::from_str(&self.payload)?,
            created_at: parse_ts(&self.created_at)?,
            last_attempt_at: parse_opt_ts(self.last_attempt_at.as_deref())?,
            next_attempt_at: parse_opt_ts(self.next_attempt_at.as_deref())?,
            id: self.id,
            endpoint: self.endpoint,
            table: self.table_name,
            local_id: self.local_id,
            remote_id: self.remote_id,
            priority: self.priority as i32,
            retries: self.retries.max(0) as u32,
            max_retries: self.max_retries.max(0) as u32,
            error_message: self.error_message,
        })
    }
}

/// Filter for [`MutationQueueRepository::select`].
#[derive(Debug, Clone)]
pub struct QueueFilter {
    pub statuses: Vec<MutationStatus>,
    pub limit: usize,
    pub include_exhausted: bool,
    /// Only items whose backoff window has elapsed at this instant.
    pub due_at: Option<DateTime<Utc>>,
    /// Ids left out of the page, e.g. items already attempted in this drain.
    pub exclude_ids: Vec<String>,
}

const ORDER: &str = "ORDER BY priority ASC, created_at ASC, rowid ASC";

impl MutationQueueRepository {
    pub fn new(store: RecordStore) -> Self {
        Self { store }
    }

    pub async fn insert(&self, item: &MutationQueueItem) -> Result<()> {
        let payload = serde_json::to_string(&item.payload)?;
        let created_at = format_ts(&item.created_at);

        self.store
            .timed("enqueue mutation", async {
                sqlx::query(
                    r#"
                    INSERT INTO mutation_queue (id, endpoint, operation, payload, table_name, local_id, remote_id,
                                                status, retries, max_retries, priority, created_at, conflict_resolution)
                    VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
                    "#,
                )
                .bind(&item.id)
                .bind(&item.endpoint)
                .bind(item.operation.to_string())
                .bind(&payload)
                .bind(&item.table)
                .bind(&item.local_id)
                .bind(&item.remote_id)
                .bind(item.status.as_str())
                .bind(item.retries as i64)
                .bind(item.max_retries as i64)
                .bind(item.priority as i64)
                .bind(&created_at)
                .bind(item.conflict_resolution.as_str())
                .execute(self.store.pool())
                .await?;
                Ok::<_, SyncError>(())
            })
            .await
    }

    pub async fn get(&self, id: &str) -> Result<Option<MutationQueueItem>> {
        let row: Option<QueueRow> = self
            .store
            .timed("get mutation", async {
                Ok::<_, SyncError>(
                    sqlx::query_as("SELECT * FROM mutation_queue WHERE id = ?")
                        .bind(id)
                        .fetch_optional(self.store.pool())
                        .await?,
                )
            })
            .await?;
        row.map(QueueRow::into_item).transpose()
    }

    pub async fn require(&self, id: &str) -> Result<MutationQueueItem> {
        self.get(id)
            .await?
            .ok_or_else(|| SyncError::NotFound(format!("mutation {}", id)))
    }

    /// Items matching `filter`, most urgent (lowest `priority`) first.
    pub async fn select(&self, filter: &QueueFilter) -> Result<Vec<MutationQueueItem>> {
        if filter.statuses.is_empty() || filter.limit == 0 {
            return Ok(Vec::new());
        }

        let placeholders = vec!["?"; filter.statuses.len()].join(", ");
        let mut sql = format!(
            "SELECT * FROM mutation_queue WHERE status IN ({})",
            placeholders
        );
        if !filter.include_exhausted {
            sql.push_str(" AND retries < max_retries");
        }
        if filter.due_at.is_some() {
            sql.push_str(" AND (next_attempt_at IS NULL OR next_attempt_at <= ?)");
        }
        if !filter.exclude_ids.is_empty() {
            let excluded = vec!["?"; filter.exclude_ids.len()].join(", ");
            sql.push_str(&format!(" AND id NOT IN ({})", excluded));
        }
        sql.push(' ');
        sql.push_str(ORDER);
        sql.push_str(" LIMIT ?");

        let due_at = filter.due_at.map(|t| format_ts(&t));
        let rows: Vec<QueueRow> = self
            .store
            .timed("dequeue batch", async {
                let mut query = sqlx::query_as(&sql);
                for status in &filter.statuses {
                    query = query.bind(status.as_str());
                }
                if let Some(due) = &due_at {
                    query = query.bind(due.as_str());
                }
                for id in &filter.exclude_ids {
                    query = query.bind(id.as_str());
                }
                Ok::<_, SyncError>(
                    query
                        .bind(filter.limit as i64)
                        .fetch_all(self.store.pool())
                        .await?,
                )
            })
            .await?;

        rows.into_iter().map(QueueRow::into_item).collect()
    }

    pub async fn set_processing(&self, id: &str, at: DateTime<Utc>) -> Result<bool> {
        let at = format_ts(&at);
        let affected = self
            .store
            .timed("mark processing", async {
                Ok::<_, SyncError>(
                    sqlx::query(
                        "UPDATE mutation_queue SET status = 'processing', last_attempt_at = ? WHERE id = ?",
                    )
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

    pub async fn set_completed(&self, id: &str, remote_id: Option<&str>) -> Result<bool> {
        let affected = self
            .store
            .timed("mark completed", async {
                Ok::<_, SyncError>(
                    sqlx::query(
                        r#"
                        UPDATE mutation_queue
                        SET status = 'completed', remote_id = COALESCE(?, remote_id),
                            error_message = NULL, next_attempt_at = NULL
                        WHERE id = ?
                        "#,
                    )
                    .bind(remote_id)
                    .bind(id)
                    .execute(self.store.pool())
                    .await?
                    .rows_affected(),
                )
            })
            .await?;
        Ok(affected > 0)
    }

    /// Consumes one retry. The item goes back to pending, or to failed once
    /// the budget is spent.
    pub async fn record_failure(
        &self,
        id: &str,
        error: &str,
        next_attempt_at: DateTime<Utc>,
    ) -> Result<MutationQueueItem> {
        let next = format_ts(&next_attempt_at);
        self.store
            .timed("mark failed", async {
                sqlx::query(
                    r#"
                    UPDATE mutation_queue SET
                        retries = retries + 1,
                        status = CASE WHEN retries + 1 >= max_retries THEN 'failed' ELSE 'pending' END,
                        next_attempt_at = CASE WHEN retries + 1 >= max_retries THEN NULL ELSE ? END,
                        error_message = ?
                    WHERE id = ?
                    "#,
                )
                .bind(&next)
                .bind(error)
                .bind(id)
                .execute(self.store.pool())
                .await?;
                Ok::<_, SyncError>(())
            })
            .await?;
        self.require(id).await
    }

    /// Back to pending without consuming a retry.
    pub async fn revert_to_pending(&self, id: &str) -> Result<()> {
        self.store
            .timed("revert mutation", async {
                sqlx::query("UPDATE mutation_queue SET status = 'pending' WHERE id = ?")
                    .bind(id)
                    .execute(self.store.pool())
                    .await?;
                Ok::<_, SyncError>(())
            })
            .await
    }

    pub async fn set_conflict(&self, id: &str, message: &str) -> Result<()> {
        self.store
            .timed("mark conflict", async {
                sqlx::query(
                    "UPDATE mutation_queue SET status = 'conflict', error_message = ? WHERE id = ?",
                )
                .bind(message)
                .bind(id)
                .execute(self.store.pool())
                .await?;
                Ok::<_, SyncError>(())
            })
            .await
    }

    /// Puts an item back in line with a new payload and a fresh retry budget.
    pub async fn requeue(
        &self,
        id: &str,
        payload: &serde_json::Value,
        operation: MutationOperation,
    ) -> Result<()> {
        let payload = serde_json::to_string(payload)?;
        self.store
            .timed("requeue mutation", async {
                sqlx::query(
                    r#"
                    UPDATE mutation_queue SET
                        status = 'pending', payload = ?, operation = ?, retries = 0,
                        next_attempt_at = NULL, error_message = NULL
                    WHERE id = ?
                    "#,
                )
                .bind(&payload)
                .bind(operation.to_string())
                .bind(id)
                .execute(self.store.pool())
                .await?;
                Ok::<_, SyncError>(())
            })
            .await
    }

    /// Resets rows left in `processing` by a process that died mid-dispatch.
    pub async fn reset_processing(&self) -> Result<u64> {
        self.store
            .timed("recover queue", async {
                Ok::<_, SyncError>(
                    sqlx::query("UPDATE mutation_queue SET status = 'pending' WHERE status = 'processing'")
                        .execute(self.store.pool())
                        .await?
                        .rows_affected(),
                )
            })
            .await
    }

    /// Failed items get a fresh retry budget.
    pub async fn reset_failed(&self) -> Result<u64> {
        self.store
            .timed("retry failed", async {
                Ok::<_, SyncError>(
                    sqlx::query(
                        r#"
                        UPDATE mutation_queue
                        SET status = 'pending', retries = 0, next_attempt_at = NULL
                        WHERE status = 'failed'
                        "#,
                    )
                    .execute(self.store.pool())
                    .await?
                    .rows_affected(),
                )
            })
            .await
    }

    /// Deletes completed items whose last attempt is older than `before`.
    /// Items completed without any recorded attempt are always eligible.
    pub async fn delete_completed(&self, before: DateTime<Utc>) -> Result<u64> {
        let before = format_ts(&before);
        self.store
            .timed("purge completed", async {
                Ok::<_, SyncError>(
                    sqlx::query(
                        r#"
                        DELETE FROM mutation_queue
                        WHERE status = 'completed'
                          AND (last_attempt_at IS NULL OR last_attempt_at <= ?)
                        "#,
                    )
                    .bind(&before)
                    .execute(self.store.pool())
                    .await?
                    .rows_affected(),
                )
            })
            .await
    }

    pub async fn count(&self) -> Result<u64> {
        let count: i64 = self
            .store
            .timed("queue length", async {
                Ok::<_, SyncError>(
                    sqlx::query_scalar("SELECT COUNT(*) FROM mutation_queue")
                        .fetch_one(self.store.pool())
                        .await?,
                )
            })
            .await?;
        Ok(count.max(0) as u64)
    }

    pub async fn count_by_status(&self) -> Result<HashMap<MutationStatus, u64>> {
        let rows: Vec<(String, i64)> = self
            .store
            .timed("queue stats", async {
                Ok::<_, SyncError>(
                    sqlx::query_as("SELECT status, COUNT(*) FROM mutation_queue GROUP BY status")
                        .fetch_all(self.store.pool())
                        .await?,
                )
            })
            .await?;

        let mut counts = HashMap::new();
        for (status, count) in rows {
            if let Ok(status) = status.parse::<MutationStatus>() {
                counts.insert(status, count.max(0) as u64);
            }
        }
        Ok(counts)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::test_store;
    use serde_json::json;

    fn item(id: &str, priority: i32, created_at: DateTime<Utc>) -> MutationQueueItem {
        MutationQueueItem {
            id: id.to_string(),
            endpoint: "/api/products".to_string(),
            table: "products".to_string(),
            local_id: None,
            remote_id: None,
            operation: MutationOperation::Create,
            payload: json!({"name": id}),
            priority,
            status: MutationStatus::Pending,
            retries: 0,
            max_retries: 2,
            created_at,
            last_attempt_at: None,
            next_attempt_at: None,
            error_message: None,
            conflict_resolution: ConflictStrategy::Merge,
        }
    }

    fn pending(limit: usize) -> QueueFilter {
        QueueFilter {
            statuses: vec![MutationStatus::Pending],
            limit,
            include_exhausted: false,
            due_at: None,
            exclude_ids: Vec::new(),
        }
    }

    #[tokio::test]
    async fn test_select_orders_by_priority_then_age() {
        let (store, _temp) = test_store().await;
        let repo = MutationQueueRepository::new(store);
        let t0 = Utc::now();

        repo.insert(&item("late-urgent", 1, t0 + chrono::Duration::seconds(5)))
            .await
            .unwrap();
        repo.insert(&item("old-low", 4, t0)).await.unwrap();
        repo.insert(&item("early-urgent", 1, t0)).await.unwrap();

        let ids: Vec<String> = repo
            .select(&pending(10))
            .await
            .unwrap()
            .into_iter()
            .map(|i| i.id)
            .collect();
        assert_eq!(ids, vec!["early-urgent", "late-urgent", "old-low"]);
    }

    #[tokio::test]
    async fn test_select_skips_excluded_ids() {
        let (store, _temp) = test_store().await;
        let repo = MutationQueueRepository::new(store);
        let t0 = Utc::now();
        repo.insert(&item("a", 1, t0)).await.unwrap();
        repo.insert(&item("b", 1, t0 + chrono::Duration::seconds(1))).await.unwrap();
        repo.insert(&item("c", 2, t0)).await.unwrap();

        let filter = QueueFilter {
            exclude_ids: vec!["a".to_string(), "b".to_string()],
            ..pending(2)
        };
        let ids: Vec<String> = repo
            .select(&filter)
            .await
            .unwrap()
            .into_iter()
            .map(|i| i.id)
            .collect();
        assert_eq!(ids, vec!["c"]);
    }

    #[tokio::test]
    async fn test_record_failure_exhausts_budget() {
        let (store, _temp) = test_store().await;
        let repo = MutationQueueRepository::new(store);
        repo.insert(&item("m1", 3, Utc::now())).await.unwrap();

        let after_first = repo.record_failure("m1", "boom", Utc::now()).await.unwrap();
        assert_eq!(after_first.status, MutationStatus::Pending);
        assert_eq!(after_first.retries, 1);
        assert!(after_first.next_attempt_at.is_some());

        let after_second = repo.record_failure("m1", "boom", Utc::now()).await.unwrap();
        assert_eq!(after_second.status, MutationStatus::Failed);
        assert_eq!(after_second.error_message.as_deref(), Some("boom"));
    }

    #[tokio::test]
    async fn test_select_due_filter() {
        let (store, _temp) = test_store().await;
        let repo = MutationQueueRepository::new(store);
        let now = Utc::now();
        repo.insert(&item("m1", 3, now)).await.unwrap();
        repo.record_failure("m1", "later", now + chrono::Duration::minutes(5))
            .await
            .unwrap();

        let mut filter = pending(10);
        filter.due_at = Some(now);
        assert!(repo.select(&filter).await.unwrap().is_empty());

        filter.due_at = None;
        assert_eq!(repo.select(&filter).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_counts_and_purge() {
        let (store, _temp) = test_store().await;
        let repo = MutationQueueRepository::new(store);
        repo.insert(&item("a", 3, Utc::now())).await.unwrap();
        repo.insert(&item("b", 3, Utc::now())).await.unwrap();
        repo.set_completed("a", Some("srv-a")).await.unwrap();

        let counts = repo.count_by_status().await.unwrap();
        assert_eq!(counts.get(&MutationStatus::Completed), Some(&1));
        assert_eq!(counts.get(&MutationStatus::Pending), Some(&1));

        assert_eq!(repo.delete_completed(Utc::now()).await.unwrap(), 1);
        assert_eq!(repo.count().await.unwrap(), 1);
    }
}
