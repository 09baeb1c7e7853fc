//! Local record store: SQLite through sqlx.
//!
//! Core tables (queue, checkpoints, conflicts) come from the embedded
//! migrations; entity tables are created on demand by the domain services.

mod checkpoint_repo;
mod conflict_repo;
mod queue_repo;
mod record_repo;

pub use checkpoint_repo::CheckpointRepository;
pub use conflict_repo::ConflictRepository;
pub use queue_repo::{MutationQueueRepository, QueueFilter};
pub use record_repo::{ApplyOutcome, RecordRepository, ENTITY_COLUMNS};

use serde_json::{Map, Value};
use sqlx::query::Query;
use sqlx::sqlite::{
    SqliteArguments, SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions,
    SqliteRow, SqliteSynchronous,
};
use sqlx::{Column, Row, Sqlite, TypeInfo, ValueRef};
use std::future::Future;
use std::path::Path;
use std::time::Duration;

use crate::error::{with_deadline, Result, SyncError};

/// Initialize the database connection pool and run migrations
pub async fn init_db(path: &Path) -> Result<SqlitePool> {
    // Ensure parent directory exists
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }

    // Full sync + WAL: an enqueue that returned survives a crash.
    let options = SqliteConnectOptions::new()
        .filename(path)
        .create_if_missing(true)
        .foreign_keys(true)
        .journal_mode(SqliteJournalMode::Wal)
        .synchronous(SqliteSynchronous::Full);

    let pool = SqlitePoolOptions::new()
        .max_connections(5)
        .connect_with(options)
        .await?;

    // Run migrations
    sqlx::migrate!("./migrations").run(&pool).await?;

    Ok(pool)
}

/// Shared handle to the local store. Every call runs under the DB deadline.
#[derive(Clone, Debug)]
pub struct RecordStore {
    pool: SqlitePool,
    timeout: Duration,
}

impl RecordStore {
    pub fn new(pool: SqlitePool, timeout: Duration) -> Self {
        Self { pool, timeout }
    }

    /// Opens (or creates) the database file and runs migrations.
    pub async fn open(path: &Path, timeout: Duration) -> Result<Self> {
        let pool = with_deadline(timeout, "open database", init_db(path)).await?;
        Ok(Self::new(pool, timeout))
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Runs a store operation under the configured deadline.
    pub async fn timed<T, F>(&self, what: &str, fut: F) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        with_deadline(self.timeout, what, fut).await
    }

    /// Idempotent table bootstrap. `columns` is the column list inside `CREATE TABLE (...)`.
    pub async fn create_table_if_not_exists(&self, name: &str, columns: &str) -> Result<()> {
        validate_identifier(name)?;
        let sql = format!("CREATE TABLE IF NOT EXISTS {} ({})", name, columns);
        self.timed("create table", async {
            sqlx::query(&sql).execute(&self.pool).await?;
            Ok::<_, SyncError>(())
        })
        .await
    }

    pub async fn table_exists(&self, name: &str) -> Result<bool> {
        self.timed("table exists", async {
            let count: i64 = sqlx::query_scalar(
                "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name = ?",
            )
            .bind(name)
            .fetch_one(&self.pool)
            .await?;
            Ok::<_, SyncError>(count > 0)
        })
        .await
    }

    /// Executes a parametrized statement, returning the affected row count.
    pub async fn execute(&self, sql: &str, params: &[Value]) -> Result<u64> {
        self.timed("execute", async {
            let mut query = sqlx::query(sql);
            for param in params {
                query = bind_json(query, param);
            }
            let result = query.execute(&self.pool).await?;
            Ok::<_, SyncError>(result.rows_affected())
        })
        .await
    }

    /// Runs a parametrized query, returning each row as a column -> value map.
    pub async fn query(&self, sql: &str, params: &[Value]) -> Result<Vec<Map<String, Value>>> {
        self.timed("query", async {
            let mut query = sqlx::query(sql);
            for param in params {
                query = bind_json(query, param);
            }
            let rows = query.fetch_all(&self.pool).await?;
            rows.iter().map(row_to_json).collect::<Result<Vec<_>>>()
        })
        .await
    }

    /// Runs several statements atomically.
    pub async fn execute_batch(&self, statements: &[(&str, Vec<Value>)]) -> Result<u64> {
        self.timed("transaction", async {
            let mut tx = self.pool.begin().await?;
            let mut affected = 0;
            for (sql, params) in statements {
                let mut query = sqlx::query(sql);
                for param in params {
                    query = bind_json(query, param);
                }
                affected += query.execute(&mut *tx).await?.rows_affected();
            }
            tx.commit().await?;
            Ok::<_, SyncError>(affected)
        })
        .await
    }
}

/// Table names are interpolated into SQL, so only `[a-z_][a-z0-9_]*` is allowed.
pub fn validate_identifier(name: &str) -> Result<()> {
    let mut chars = name.chars();
    let valid = match chars.next() {
        Some(c) if c.is_ascii_lowercase() || c == '_' => {
            chars.all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_')
        }
        _ => false,
    };

    if valid {
        Ok(())
    } else {
        Err(SyncError::Validation(format!(
            "Invalid table name '{}'",
            name
        )))
    }
}

fn bind_json<'q>(
    query: Query<'q, Sqlite, SqliteArguments<'q>>,
    value: &Value,
) -> Query<'q, Sqlite, SqliteArguments<'q>> {
    match value {
        Value::Null => query.bind(Option::<String>::None),
        Value::Bool(b) => query.bind(*b),
        Value::Number(n) if n.is_i64() => query.bind(n.as_i64()),
        Value::Number(n) => query.bind(n.as_f64()),
        Value::String(s) => query.bind(s.clone()),
        other => query.bind(other.to_string()),
    }
}

fn row_to_json(row: &SqliteRow) -> Result<Map<String, Value>> {
    let mut map = Map::new();
    for column in row.columns() {
        let idx = column.ordinal();
        let (is_null, type_name) = {
            let raw = row.try_get_raw(idx)?;
            (raw.is_null(), raw.type_info().name().to_string())
        };

        let value = if is_null {
            Value::Null
        } else {
            match type_name.as_str() {
                "INTEGER" => Value::from(row.try_get::<i64, _>(idx)?),
                "BOOLEAN" => Value::Bool(row.try_get::<bool, _>(idx)?),
                "REAL" => serde_json::Number::from_f64(row.try_get::<f64, _>(idx)?)
                    .map(Value::Number)
                    .unwrap_or(Value::Null),
                "BLOB" => {
                    let bytes: Vec<u8> = row.try_get(idx)?;
                    Value::String(String::from_utf8_lossy(&bytes).into_owned())
                }
                _ => Value::String(row.try_get::<String, _>(idx)?),
            }
        };
        map.insert(column.name().to_string(), value);
    }
    Ok(map)
}
