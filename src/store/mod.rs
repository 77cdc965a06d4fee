//! Shared authorization store.
//!
//! Every piece of authorization state (leases, elevations, the governance
//! mode, redeemed nonces) lives behind the [`Store`] trait so that all server
//! instances pointing at the same backend agree on it. Nothing in the crate
//! keeps authoritative mutable state in-process.
//!
//! Key layout:
//!
//! | key                                 | value                     | TTL            |
//! |-------------------------------------|---------------------------|----------------|
//! | `lease:{len}:{client_id}:{tool_id}` | lease JSON + call counter | lease lifetime |
//! | `elevation:{scope_hash}`            | expiry, unix millis       | elevation TTL  |
//! | `governance:mode`                   | mode string               | none           |
//! | `nonce:{nonce}`                     | `"redeemed"`              | token lifetime |
//!
//! `{len}` is the byte length of `client_id`, so ids containing `:` cannot
//! collide.

pub mod guarded;
pub mod memory;
pub mod sqlite;

use std::time::Duration;

use async_trait::async_trait;

pub use self::guarded::{GuardedStore, RetryPolicy};
pub use self::memory::MemoryStore;
pub use self::sqlite::SqliteStore;

/// Prefix for lease keys.
pub const LEASE_PREFIX: &str = "lease:";

/// Prefix for elevation keys.
pub const ELEVATION_PREFIX: &str = "elevation:";

/// Prefix for redeemed token nonces.
pub const NONCE_PREFIX: &str = "nonce:";

/// Key holding the current governance mode.
pub const MODE_KEY: &str = "governance:mode";

/// Store key for the lease of `(client_id, tool_id)`.
pub fn lease_key(client_id: &str, tool_id: &str) -> String {
    format!("{LEASE_PREFIX}{}:{client_id}:{tool_id}", client_id.len())
}

/// Store key for an elevation scope hash.
pub fn elevation_key(scope_hash: &str) -> String {
    format!("{ELEVATION_PREFIX}{scope_hash}")
}

/// Store key for a redeemed nonce.
pub fn nonce_key(nonce: &str) -> String {
    format!("{NONCE_PREFIX}{nonce}")
}

// ---------------------------------------------------------------------------
// Entries and errors
// ---------------------------------------------------------------------------

/// A value held in the store.
///
/// The `counter` is kept beside the opaque value so that backends can
/// decrement it atomically without parsing the value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreEntry {
    /// Opaque value (JSON for leases, plain strings otherwise).
    pub value: String,
    /// Optional atomically-decrementable counter.
    pub counter: Option<i64>,
}

impl StoreEntry {
    /// Entry without a counter.
    pub fn plain(value: impl Into<String>) -> Self {
        Self {
            value: value.into(),
            counter: None,
        }
    }

    /// Entry with a counter.
    pub fn counted(value: impl Into<String>, counter: i64) -> Self {
        Self {
            value: value.into(),
            counter: Some(counter),
        }
    }
}

/// Result of [`Store::decrement_if_positive`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decrement {
    /// The counter was positive and has been decremented to `remaining`.
    Applied {
        /// Counter value after the decrement.
        remaining: i64,
    },
    /// The key exists but its counter is zero (or absent).
    Exhausted,
    /// No live entry under the key.
    Missing,
}

/// Store failures.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// The backend could not be reached; the operation was not applied.
    #[error("store connection failed: {0}")]
    Connection(String),

    /// The operation did not complete in time or retries were exhausted.
    /// Whether it was applied is unknown.
    #[error("store unavailable: {0}")]
    Unavailable(String),

    /// A stored value could not be interpreted.
    #[error("corrupt store entry under {key}: {reason}")]
    Corrupt {
        /// Key holding the bad entry.
        key: String,
        /// What was wrong with it.
        reason: String,
    },
}

impl StoreError {
    /// Whether the operation is known not to have been applied and may be
    /// retried.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Connection(_))
    }
}

impl From<sqlx::Error> for StoreError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::Io(_) | sqlx::Error::PoolClosed => Self::Connection(err.to_string()),
            sqlx::Error::PoolTimedOut => Self::Unavailable(err.to_string()),
            other => Self::Unavailable(other.to_string()),
        }
    }
}

// ---------------------------------------------------------------------------
// Store trait
// ---------------------------------------------------------------------------

/// Key-value store with per-entry TTL and an atomic conditional decrement.
///
/// Expired entries must be invisible to every read and write predicate,
/// regardless of whether the backend has physically removed them yet.
#[async_trait]
pub trait Store: Send + Sync {
    /// Insert or overwrite `key`. `ttl` of `None` means no expiry.
    async fn set(
        &self,
        key: &str,
        entry: StoreEntry,
        ttl: Option<Duration>,
    ) -> Result<(), StoreError>;

    /// Insert `key` only if no live entry exists. Returns `true` if inserted.
    async fn set_if_absent(
        &self,
        key: &str,
        entry: StoreEntry,
        ttl: Option<Duration>,
    ) -> Result<bool, StoreError>;

    /// Read a live entry.
    async fn get(&self, key: &str) -> Result<Option<StoreEntry>, StoreError>;

    /// Whether a live entry exists.
    async fn exists(&self, key: &str) -> Result<bool, StoreError>;

    /// Delete `key`. Returns `true` if a live entry was removed.
    async fn delete(&self, key: &str) -> Result<bool, StoreError>;

    /// Decrement the entry's counter by one if, and only if, it is currently
    /// positive. Must be a single atomic operation on the backend.
    async fn decrement_if_positive(&self, key: &str) -> Result<Decrement, StoreError>;

    /// Delete every live entry whose key starts with `prefix`.
    async fn delete_prefix(&self, prefix: &str) -> Result<u64, StoreError>;

    /// Physically remove expired entries. Returns the number removed.
    async fn purge_expired(&self) -> Result<u64, StoreError>;
}

/// Convert a TTL to whole milliseconds, saturating.
pub(crate) fn ttl_millis(ttl: Duration) -> i64 {
    i64::try_from(ttl.as_millis()).unwrap_or(i64::MAX)
}
