use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use sha2::{Digest, Sha256};
use sqlx::{Pool, Row, Sqlite};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::RwLock;

use crate::usage::{
    EndpointAggregate, UsageKind, UsageRecord, UsageReport, aggregate_records, build_report,
    format_timestamp,
};

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("api key already registered")]
    DuplicateKey,
    #[error("invalid stored value: {0}")]
    Corrupt(String),
    #[error("{0}")]
    Setup(String),
}

/// Resolved identity of an API consumer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Caller {
    pub id: i64,
    pub name: String,
    pub is_admin: bool,
}

/// Lookup and append-only accounting interface the proxy pipeline consumes.
///
/// Implementations must tolerate concurrent appends from many requests and
/// must not hold a connection between calls.
#[async_trait]
pub trait KeyStore: Send + Sync {
    async fn lookup(&self, api_key: &str) -> Result<Option<Caller>, StoreError>;
    async fn record_usage(&self, record: UsageRecord) -> Result<(), StoreError>;
    async fn usage_report(&self) -> Result<UsageReport, StoreError>;
}

pub fn hash_api_key(api_key: &str) -> String {
    hex::encode(Sha256::digest(api_key.as_bytes()))
}

fn key_prefix(api_key: &str) -> String {
    api_key.chars().take(8).collect()
}

#[derive(Default)]
struct MemoryInner {
    next_id: i64,
    callers: HashMap<String, Caller>,
    records: Vec<UsageRecord>,
}

/// Process-local store, used by tests and for throwaway deployments.
#[derive(Clone, Default)]
pub struct MemoryKeyStore {
    inner: Arc<RwLock<MemoryInner>>,
}

impl MemoryKeyStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn add_caller(
        &self,
        name: &str,
        api_key: &str,
        is_admin: bool,
    ) -> Result<Caller, StoreError> {
        let mut guard = self.inner.write().await;
        let hash = hash_api_key(api_key);
        if guard.callers.contains_key(&hash) {
            return Err(StoreError::DuplicateKey);
        }
        guard.next_id += 1;
        let caller = Caller {
            id: guard.next_id,
            name: name.to_string(),
            is_admin,
        };
        guard.callers.insert(hash, caller.clone());
        Ok(caller)
    }

    pub async fn records(&self) -> Vec<UsageRecord> {
        self.inner.read().await.records.clone()
    }
}

#[async_trait]
impl KeyStore for MemoryKeyStore {
    async fn lookup(&self, api_key: &str) -> Result<Option<Caller>, StoreError> {
        let guard = self.inner.read().await;
        Ok(guard.callers.get(&hash_api_key(api_key)).cloned())
    }

    async fn record_usage(&self, record: UsageRecord) -> Result<(), StoreError> {
        self.inner.write().await.records.push(record);
        Ok(())
    }

    async fn usage_report(&self) -> Result<UsageReport, StoreError> {
        let guard = self.inner.read().await;
        let mut callers: Vec<Caller> = guard.callers.values().cloned().collect();
        callers.sort_by_key(|c| c.id);
        Ok(build_report(&callers, &aggregate_records(&guard.records)))
    }
}

#[derive(Clone)]
pub struct SqliteKeyStore {
    pool: Pool<Sqlite>,
}

impl SqliteKeyStore {
    pub async fn new(pool: Pool<Sqlite>) -> Result<Self, StoreError> {
        sqlx::query(
            r#"CREATE TABLE IF NOT EXISTS callers (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                name TEXT NOT NULL,
                key_prefix TEXT NOT NULL,
                key_hash TEXT NOT NULL UNIQUE,
                is_admin INTEGER NOT NULL DEFAULT 0,
                created_at TEXT NOT NULL
            )"#,
        )
        .execute(&pool)
        .await?;

        sqlx::query(
            r#"CREATE TABLE IF NOT EXISTS usage_records (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                caller_id INTEGER,
                endpoint TEXT NOT NULL,
                tokens INTEGER NOT NULL DEFAULT 0,
                kind TEXT NOT NULL DEFAULT 'request',
                created_at TEXT NOT NULL,
                FOREIGN KEY (caller_id) REFERENCES callers(id) ON DELETE CASCADE
            )"#,
        )
        .execute(&pool)
        .await?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_usage_records_caller ON usage_records(caller_id, endpoint)",
        )
        .execute(&pool)
        .await?;

        Ok(Self { pool })
    }

    /// Opens (creating if needed) the database behind `dsn`.
    pub async fn connect(dsn: &str) -> Result<Self, StoreError> {
        ensure_sqlite_file(dsn).map_err(StoreError::Setup)?;
        let options = dsn
            .parse::<sqlx::sqlite::SqliteConnectOptions>()?
            .foreign_keys(true)
            .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal)
            .busy_timeout(std::time::Duration::from_secs(5));
        // In-memory databases are per-connection, so they get exactly one.
        let max_connections = if is_memory_dsn(dsn) { 1 } else { 5 };
        let pool = sqlx::sqlite::SqlitePoolOptions::new()
            .max_connections(max_connections)
            .connect_with(options)
            .await?;
        Self::new(pool).await
    }

    pub async fn add_caller(
        &self,
        name: &str,
        api_key: &str,
        is_admin: bool,
    ) -> Result<Caller, StoreError> {
        let result = sqlx::query(
            r#"INSERT INTO callers (name, key_prefix, key_hash, is_admin, created_at)
               VALUES (?, ?, ?, ?, ?)"#,
        )
        .bind(name)
        .bind(key_prefix(api_key))
        .bind(hash_api_key(api_key))
        .bind(if is_admin { 1 } else { 0 })
        .bind(format_timestamp(Utc::now()))
        .execute(&self.pool)
        .await
        .map_err(|err| {
            if let sqlx::Error::Database(db) = &err {
                if db.is_unique_violation() {
                    return StoreError::DuplicateKey;
                }
            }
            StoreError::Database(err)
        })?;

        Ok(Caller {
            id: result.last_insert_rowid(),
            name: name.to_string(),
            is_admin,
        })
    }

    pub async fn list_callers(&self) -> Result<Vec<Caller>, StoreError> {
        let rows = sqlx::query("SELECT id, name, is_admin FROM callers ORDER BY id")
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(row_to_caller).collect()
    }

    pub async fn caller_count(&self) -> Result<i64, StoreError> {
        let row = sqlx::query("SELECT COUNT(*) as count FROM callers")
            .fetch_one(&self.pool)
            .await?;
        Ok(row.try_get::<i64, _>("count")?)
    }

    async fn endpoint_aggregates(&self) -> Result<Vec<EndpointAggregate>, StoreError> {
        let rows = sqlx::query(
            r#"SELECT caller_id,
                      endpoint,
                      SUM(CASE WHEN kind = ? THEN 1 ELSE 0 END) AS request_count,
                      SUM(tokens) AS total_tokens,
                      MAX(created_at) AS last_request
               FROM usage_records
               WHERE caller_id IS NOT NULL
               GROUP BY caller_id, endpoint
               ORDER BY caller_id, endpoint"#,
        )
        .bind(UsageKind::Request.as_str())
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|row| -> Result<EndpointAggregate, StoreError> {
                let last_request: Option<String> = row.try_get("last_request")?;
                let last_request = last_request
                    .map(|s| parse_timestamp(&s))
                    .transpose()?;
                Ok(EndpointAggregate {
                    caller_id: row.try_get("caller_id")?,
                    endpoint: row.try_get("endpoint")?,
                    request_count: non_negative(row.try_get("request_count")?)?,
                    total_tokens: non_negative(row.try_get("total_tokens")?)?,
                    last_request,
                })
            })
            .collect()
    }
}

#[async_trait]
impl KeyStore for SqliteKeyStore {
    async fn lookup(&self, api_key: &str) -> Result<Option<Caller>, StoreError> {
        let row = sqlx::query("SELECT id, name, is_admin FROM callers WHERE key_hash = ?")
            .bind(hash_api_key(api_key))
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(row_to_caller).transpose()
    }

    async fn record_usage(&self, record: UsageRecord) -> Result<(), StoreError> {
        let tokens = i64::try_from(record.tokens)
            .map_err(|_| StoreError::Corrupt(format!("token count {} too large", record.tokens)))?;
        sqlx::query(
            r#"INSERT INTO usage_records (caller_id, endpoint, tokens, kind, created_at)
               VALUES (?, ?, ?, ?, ?)"#,
        )
        .bind(record.caller_id)
        .bind(&record.endpoint)
        .bind(tokens)
        .bind(record.kind.as_str())
        .bind(format_timestamp(record.created_at))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn usage_report(&self) -> Result<UsageReport, StoreError> {
        let callers = self.list_callers().await?;
        let aggregates = self.endpoint_aggregates().await?;
        Ok(build_report(&callers, &aggregates))
    }
}

fn row_to_caller(row: &sqlx::sqlite::SqliteRow) -> Result<Caller, StoreError> {
    Ok(Caller {
        id: row.try_get("id")?,
        name: row.try_get("name")?,
        is_admin: row.try_get::<i64, _>("is_admin")? != 0,
    })
}

fn parse_timestamp(raw: &str) -> Result<DateTime<Utc>, StoreError> {
    DateTime::parse_from_rfc3339(raw)
        .map(|d| d.with_timezone(&Utc))
        .map_err(|err| StoreError::Corrupt(format!("timestamp {raw:?}: {err}")))
}

fn non_negative(value: i64) -> Result<u64, StoreError> {
    u64::try_from(value).map_err(|_| StoreError::Corrupt(format!("negative aggregate {value}")))
}

fn is_memory_dsn(dsn: &str) -> bool {
    dsn.contains(":memory:") || dsn.contains("mode=memory")
}

pub(crate) fn ensure_sqlite_file(dsn: &str) -> Result<(), String> {
    let dsn = dsn.trim();
    if !dsn.starts_with("sqlite://") {
        return Ok(());
    }
    if is_memory_dsn(dsn) {
        return Ok(());
    }
    let path_part = dsn.trim_start_matches("sqlite://");
    let path_part = path_part.split('?').next().unwrap_or("");
    if path_part.is_empty() {
        return Ok(());
    }
    let path = PathBuf::from(path_part);
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)
                .map_err(|err| format!("sqlite_dir_create_failed: {err}"))?;
        }
    }
    if !path.exists() {
        std::fs::File::create(&path).map_err(|err| format!("sqlite_file_create_failed: {err}"))?;
    }
    Ok(())
}
