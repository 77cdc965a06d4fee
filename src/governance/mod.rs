//! Governance mode and scoped elevations, both held in the shared store.
//!
//! [`GovernanceState`] is an explicit handle passed to whoever needs it.
//! The mode may be cached locally, but never for longer than
//! [`MAX_MODE_STALENESS`]: a stale `bypass` read after a switch to
//! `read_only` is a security window, so the bound is hard.

pub mod approval;
pub mod scopes;

use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::Utc;
use sha2::{Digest, Sha256};
use tokio::time::Instant;
use tracing::{info, warn};

use crate::audit::{AuditEventType, AuditSink};
use crate::error::AccessError;
use crate::policy::GovernanceMode;
use crate::store::{elevation_key, Store, StoreEntry, StoreError, ELEVATION_PREFIX, MODE_KEY};

/// Upper bound on how stale a cached mode may be.
pub const MAX_MODE_STALENESS: Duration = Duration::from_secs(1);

/// Domain tag mixed into every elevation hash.
const SCOPE_HASH_TAG: &str = "elevation/v1";

/// Governance failures.
#[derive(Debug, thiserror::Error)]
pub enum GovernanceError {
    /// The store failed; gate as a denial.
    #[error(transparent)]
    Store(#[from] StoreError),
    /// The stored mode is not a known mode.
    #[error("stored governance mode is corrupt: {0:?}")]
    CorruptMode(String),
    /// An elevation was requested with a zero TTL.
    #[error("elevation ttl must be positive")]
    InvalidTtl,
    /// The scope tuple could not be canonicalised.
    #[error("scope canonicalisation failed: {0}")]
    Canonicalize(String),
}

impl GovernanceError {
    /// The access-error category for audit.
    pub fn access_error(&self) -> AccessError {
        match self {
            Self::Store(_) => AccessError::StoreUnavailable,
            Self::CorruptMode(_) | Self::InvalidTtl | Self::Canonicalize(_) => {
                AccessError::PolicyDenied
            }
        }
    }
}

/// Deterministic hash of an elevation scope.
///
/// SHA-256 over the canonical JSON array
/// `["elevation/v1", client_id, tool_name, context_key]`, hex encoded. The
/// array encoding keeps components containing `:` or other separators from
/// colliding.
///
/// # Errors
///
/// [`GovernanceError::Canonicalize`] if serialisation fails.
pub fn scope_hash(
    client_id: &str,
    tool_name: &str,
    context_key: &str,
) -> Result<String, GovernanceError> {
    let canonical = serde_jcs::to_vec(&[SCOPE_HASH_TAG, client_id, tool_name, context_key])
        .map_err(|e| GovernanceError::Canonicalize(e.to_string()))?;
    Ok(hex::encode(Sha256::digest(&canonical)))
}

#[derive(Debug, Clone, Copy)]
struct CachedMode {
    mode: GovernanceMode,
    fetched_at: Instant,
}

/// Handle on the shared governance state.
pub struct GovernanceState {
    store: Arc<dyn Store>,
    audit: Arc<dyn AuditSink>,
    default_mode: GovernanceMode,
    cache_ttl: Duration,
    cache: Mutex<Option<CachedMode>>,
}

impl std::fmt::Debug for GovernanceState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GovernanceState")
            .field("default_mode", &self.default_mode)
            .field("cache_ttl", &self.cache_ttl)
            .finish_non_exhaustive()
    }
}

impl GovernanceState {
    /// Create a handle. `cache_ttl` is clamped to [`MAX_MODE_STALENESS`];
    /// zero disables caching.
    pub fn new(
        store: Arc<dyn Store>,
        audit: Arc<dyn AuditSink>,
        default_mode: GovernanceMode,
        cache_ttl: Duration,
    ) -> Self {
        Self {
            store,
            audit,
            default_mode,
            cache_ttl: cache_ttl.min(MAX_MODE_STALENESS),
            cache: Mutex::new(None),
        }
    }

    /// Effective cache window.
    pub fn cache_ttl(&self) -> Duration {
        self.cache_ttl
    }

    /// Current mode, at most [`Self::cache_ttl`] stale.
    ///
    /// An unset mode is initialised to the configured default.
    ///
    /// # Errors
    ///
    /// [`GovernanceError::Store`] or [`GovernanceError::CorruptMode`]; both
    /// must gate as a denial, never as a fallback mode.
    pub async fn get_mode(&self) -> Result<GovernanceMode, GovernanceError> {
        if let Some(mode) = self.cached() {
            return Ok(mode);
        }
        let mode = self.read_mode().await?;
        self.remember(mode);
        Ok(mode)
    }

    /// Persist a new mode and audit the change.
    ///
    /// # Errors
    ///
    /// [`GovernanceError::Store`] if the write fails.
    pub async fn set_mode(&self, mode: GovernanceMode) -> Result<(), GovernanceError> {
        let previous = self.cached();
        self.store
            .set(MODE_KEY, StoreEntry::plain(mode.as_str()), None)
            .await?;
        self.remember(mode);
        info!(%mode, "governance mode changed");
        self.audit.log(
            AuditEventType::ModeChanged,
            serde_json::json!({
                "from": previous.map(GovernanceMode::as_str),
                "to": mode.as_str(),
            }),
        );
        Ok(())
    }

    /// Whether a live elevation exists for `scope_hash`.
    ///
    /// # Errors
    ///
    /// [`GovernanceError::Store`]; treat as "no elevation".
    pub async fn check_elevation(&self, scope_hash: &str) -> Result<bool, GovernanceError> {
        Ok(self.store.exists(&elevation_key(scope_hash)).await?)
    }

    /// Time left on the elevation for `scope_hash`, or `None` if there is
    /// no live one.
    ///
    /// # Errors
    ///
    /// [`GovernanceError::Store`] if the read fails or the stored expiry is
    /// unreadable; treat as "no elevation".
    pub async fn elevation_remaining(
        &self,
        scope_hash: &str,
    ) -> Result<Option<Duration>, GovernanceError> {
        let key = elevation_key(scope_hash);
        let Some(entry) = self.store.get(&key).await? else {
            return Ok(None);
        };
        let expires_at: i64 = entry.value.parse().map_err(|_| StoreError::Corrupt {
            key: key.clone(),
            reason: format!("elevation expiry is not a timestamp: {:?}", entry.value),
        })?;
        let left = expires_at.saturating_sub(Utc::now().timestamp_millis());
        Ok(u64::try_from(left)
            .ok()
            .filter(|&ms| ms > 0)
            .map(Duration::from_millis))
    }

    /// Grant an elevation for `ttl`.
    ///
    /// # Errors
    ///
    /// [`GovernanceError::InvalidTtl`] for a zero TTL, or a store failure.
    pub async fn grant_elevation(
        &self,
        scope_hash: &str,
        ttl: Duration,
    ) -> Result<(), GovernanceError> {
        if ttl.is_zero() {
            return Err(GovernanceError::InvalidTtl);
        }
        let ttl_ms = i64::try_from(ttl.as_millis()).map_err(|_| GovernanceError::InvalidTtl)?;
        let expires_at = Utc::now()
            .timestamp_millis()
            .checked_add(ttl_ms)
            .ok_or(GovernanceError::InvalidTtl)?;
        self.store
            .set(
                &elevation_key(scope_hash),
                StoreEntry::plain(expires_at.to_string()),
                Some(ttl),
            )
            .await?;
        info!(scope_hash, ttl_secs = ttl.as_secs(), "elevation granted");
        self.audit.log(
            AuditEventType::ElevationGranted,
            serde_json::json!({ "scope_hash": scope_hash, "ttl_seconds": ttl.as_secs() }),
        );
        Ok(())
    }

    /// Remove an elevation. Idempotent.
    ///
    /// # Errors
    ///
    /// [`GovernanceError::Store`] if the delete fails.
    pub async fn revoke_elevation(&self, scope_hash: &str) -> Result<(), GovernanceError> {
        if self.store.delete(&elevation_key(scope_hash)).await? {
            self.audit.log(
                AuditEventType::ElevationsRevoked,
                serde_json::json!({ "scope_hash": scope_hash, "count": 1 }),
            );
        }
        Ok(())
    }

    /// Remove every elevation. Returns how many were live.
    ///
    /// # Errors
    ///
    /// [`GovernanceError::Store`] if the delete fails.
    pub async fn revoke_all_elevations(&self) -> Result<u64, GovernanceError> {
        let count = self.store.delete_prefix(ELEVATION_PREFIX).await?;
        info!(count, "all elevations revoked");
        self.audit.log(
            AuditEventType::ElevationsRevoked,
            serde_json::json!({ "scope_hash": null, "count": count }),
        );
        Ok(count)
    }

    fn cached(&self) -> Option<GovernanceMode> {
        if self.cache_ttl.is_zero() {
            return None;
        }
        let guard = self.cache.lock().ok()?;
        let cached = (*guard)?;
        (cached.fetched_at.elapsed() < self.cache_ttl).then_some(cached.mode)
    }

    fn remember(&self, mode: GovernanceMode) {
        if let Ok(mut guard) = self.cache.lock() {
            *guard = Some(CachedMode {
                mode,
                fetched_at: Instant::now(),
            });
        }
    }

    async fn read_mode(&self) -> Result<GovernanceMode, GovernanceError> {
        let raw = match self.store.get(MODE_KEY).await? {
            Some(entry) => entry.value,
            None => {
                let default = self.default_mode.as_str();
                if self
                    .store
                    .set_if_absent(MODE_KEY, StoreEntry::plain(default), None)
                    .await?
                {
                    info!(mode = default, "governance mode initialised");
                    return Ok(self.default_mode);
                }
                // Another instance initialised it first.
                self.store
                    .get(MODE_KEY)
                    .await?
                    .map(|e| e.value)
                    .unwrap_or_default()
            }
        };
        raw.parse().map_err(|_| {
            warn!(stored = %raw, "corrupt governance mode in store");
            GovernanceError::CorruptMode(raw)
        })
    }
}
