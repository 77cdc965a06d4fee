//! SQLite-backed [`Store`] shared by every process that opens the same file.
//!
//! Expiry is stored as epoch milliseconds and enforced in every statement's
//! predicate, so an expired row behaves exactly like a missing one even
//! before [`Store::purge_expired`] removes it. The conditional decrement is a
//! single `UPDATE … RETURNING` statement; SQLite serialises writers, so two
//! processes can never both take the last call.

use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::SqlitePool;
use tracing::info;

use super::{ttl_millis, Decrement, Store, StoreEntry, StoreError};

/// Schema applied on every connect (idempotent).
const SCHEMA: &str = include_str!("../../migrations/001_schema.sql");

/// How long a writer waits on a locked database before giving up.
const BUSY_TIMEOUT: Duration = Duration::from_secs(2);

/// Pool size for file-backed stores.
const MAX_CONNECTIONS: u32 = 8;

/// SQLite store over a [`SqlitePool`].
#[derive(Debug, Clone)]
pub struct SqliteStore {
    pool: SqlitePool,
}

fn now_millis() -> i64 {
    Utc::now().timestamp_millis()
}

fn expiry_millis(ttl: Option<Duration>) -> Option<i64> {
    ttl.map(|ttl| now_millis().saturating_add(ttl_millis(ttl)))
}

impl SqliteStore {
    /// Open (creating if missing) the database file at `path`.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if the file cannot be opened or the schema
    /// cannot be applied.
    pub async fn connect(path: &Path) -> Result<Self, StoreError> {
        let opts = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(BUSY_TIMEOUT);
        let pool = SqlitePoolOptions::new()
            .max_connections(MAX_CONNECTIONS)
            .acquire_timeout(BUSY_TIMEOUT)
            .connect_with(opts)
            .await?;
        info!(path = %path.display(), "sqlite store opened");
        Self::from_pool(pool).await
    }

    /// Private in-memory database (single connection), for tests and demos.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if the schema cannot be applied.
    pub async fn in_memory() -> Result<Self, StoreError> {
        let opts = SqliteConnectOptions::new()
            .filename(":memory:")
            .create_if_missing(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(opts)
            .await?;
        Self::from_pool(pool).await
    }

    /// Wrap an existing pool and apply the schema.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if the schema cannot be applied.
    pub async fn from_pool(pool: SqlitePool) -> Result<Self, StoreError> {
        sqlx::raw_sql(SCHEMA).execute(&pool).await?;
        Ok(Self { pool })
    }

    /// Close the pool, waiting for in-flight statements.
    pub async fn close(&self) {
        self.pool.close().await;
    }
}

#[async_trait]
impl Store for SqliteStore {
    async fn set(
        &self,
        key: &str,
        entry: StoreEntry,
        ttl: Option<Duration>,
    ) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO entries (key, value, counter, expires_at) VALUES (?, ?, ?, ?)
             ON CONFLICT(key) DO UPDATE SET
                 value = excluded.value,
                 counter = excluded.counter,
                 expires_at = excluded.expires_at",
        )
        .bind(key)
        .bind(&entry.value)
        .bind(entry.counter)
        .bind(expiry_millis(ttl))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn set_if_absent(
        &self,
        key: &str,
        entry: StoreEntry,
        ttl: Option<Duration>,
    ) -> Result<bool, StoreError> {
        // An expired row under the key counts as absent and is replaced.
        let result = sqlx::query(
            "INSERT INTO entries (key, value, counter, expires_at) VALUES (?, ?, ?, ?)
             ON CONFLICT(key) DO UPDATE SET
                 value = excluded.value,
                 counter = excluded.counter,
                 expires_at = excluded.expires_at
             WHERE entries.expires_at IS NOT NULL AND entries.expires_at <= ?",
        )
        .bind(key)
        .bind(&entry.value)
        .bind(entry.counter)
        .bind(expiry_millis(ttl))
        .bind(now_millis())
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn get(&self, key: &str) -> Result<Option<StoreEntry>, StoreError> {
        let row: Option<(String, Option<i64>)> = sqlx::query_as(
            "SELECT value, counter FROM entries
             WHERE key = ? AND (expires_at IS NULL OR expires_at > ?)",
        )
        .bind(key)
        .bind(now_millis())
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(|(value, counter)| StoreEntry { value, counter }))
    }

    async fn exists(&self, key: &str) -> Result<bool, StoreError> {
        let found: Option<i64> = sqlx::query_scalar(
            "SELECT 1 FROM entries
             WHERE key = ? AND (expires_at IS NULL OR expires_at > ?)",
        )
        .bind(key)
        .bind(now_millis())
        .fetch_optional(&self.pool)
        .await?;
        Ok(found.is_some())
    }

    async fn delete(&self, key: &str) -> Result<bool, StoreError> {
        let now = now_millis();
        let removed: Option<Option<i64>> =
            sqlx::query_scalar("DELETE FROM entries WHERE key = ? RETURNING expires_at")
                .bind(key)
                .fetch_optional(&self.pool)
                .await?;
        Ok(matches!(removed, Some(None)) || matches!(removed, Some(Some(at)) if at > now))
    }

    async fn decrement_if_positive(&self, key: &str) -> Result<Decrement, StoreError> {
        let now = now_millis();
        let remaining: Option<i64> = sqlx::query_scalar(
            "UPDATE entries SET counter = counter - 1
             WHERE key = ? AND counter > 0 AND (expires_at IS NULL OR expires_at > ?)
             RETURNING counter",
        )
        .bind(key)
        .bind(now)
        .fetch_optional(&self.pool)
        .await?;

        if let Some(remaining) = remaining {
            return Ok(Decrement::Applied { remaining });
        }
        // Classification only; the decrement itself already happened (or not)
        // in the statement above.
        if self.exists(key).await? {
            Ok(Decrement::Exhausted)
        } else {
            Ok(Decrement::Missing)
        }
    }

    async fn delete_prefix(&self, prefix: &str) -> Result<u64, StoreError> {
        let result = sqlx::query(
            "DELETE FROM entries
             WHERE substr(key, 1, length(?)) = ?
               AND (expires_at IS NULL OR expires_at > ?)",
        )
        .bind(prefix)
        .bind(prefix)
        .bind(now_millis())
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    async fn purge_expired(&self) -> Result<u64, StoreError> {
        let result =
            sqlx::query("DELETE FROM entries WHERE expires_at IS NOT NULL AND expires_at <= ?")
                .bind(now_millis())
                .execute(&self.pool)
                .await?;
        Ok(result.rows_affected())
    }
}
