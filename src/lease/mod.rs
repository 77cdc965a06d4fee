//! Leases: time- and count-bounded tickets scoping one client to one tool.
//!
//! A lease lives under [`lease_key`] with a store TTL equal to its
//! lifetime. The record is JSON; the remaining call count is the entry's
//! counter, which the store decrements atomically. The JSON's own
//! `calls_remaining` is overwritten with the counter on every read.
//!
//! Because the store drops the entry at the same instant the lease expires,
//! a lease that ran out its lifetime reads as [`LeaseError::NotFound`].
//! [`LeaseError::Expired`] only surfaces when a record is still held past
//! its own `expires_at` (clock skew between instances, or a backend that
//! keeps entries a little longer). Both are the same denial.
//!
//! [`LeaseManager`] is the only component that writes leases.

pub mod budget;

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::audit::{AuditEventType, AuditSink, NullAuditSink};
use crate::error::AccessError;
use crate::policy::GovernanceMode;
use crate::store::{lease_key, Decrement, Store, StoreEntry, StoreError};

pub use self::budget::{budget_alert, BudgetAlert};

/// A budgeted authorization ticket.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Lease {
    /// Caller the lease is issued to.
    pub client_id: String,
    /// Tool the lease covers.
    pub tool_id: String,
    /// When the lease was granted.
    pub granted_at: DateTime<Utc>,
    /// When the lease stops being valid.
    pub expires_at: DateTime<Utc>,
    /// Calls left at the time this snapshot was read.
    pub calls_remaining: u32,
    /// Budget the lease was granted with.
    pub initial_calls: u32,
    /// Governance mode in force when the lease was granted.
    pub mode_at_issue: GovernanceMode,
    /// Capability token issued alongside the lease, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub capability_token: Option<String>,
}

impl Lease {
    /// Current budget alert level for this snapshot.
    pub fn budget_alert(&self) -> BudgetAlert {
        budget_alert(self.calls_remaining, self.initial_calls)
    }
}

/// Everything needed to grant a lease.
#[derive(Debug, Clone)]
pub struct LeaseTerms {
    /// Caller to grant to.
    pub client_id: String,
    /// Tool to grant for.
    pub tool_id: String,
    /// Lifetime; must be non-zero.
    pub ttl: Duration,
    /// Call budget; must be non-zero.
    pub calls: u32,
    /// Mode recorded on the lease.
    pub mode_at_issue: GovernanceMode,
    /// Token to embed in the lease record.
    pub capability_token: Option<String>,
}

impl LeaseTerms {
    /// Terms without a capability token.
    pub fn new(
        client_id: impl Into<String>,
        tool_id: impl Into<String>,
        ttl: Duration,
        calls: u32,
        mode_at_issue: GovernanceMode,
    ) -> Self {
        Self {
            client_id: client_id.into(),
            tool_id: tool_id.into(),
            ttl,
            calls,
            mode_at_issue,
            capability_token: None,
        }
    }

    /// Attach a capability token.
    #[must_use]
    pub fn with_token(mut self, token: impl Into<String>) -> Self {
        self.capability_token = Some(token.into());
        self
    }
}

/// Outcome of [`LeaseManager::consume`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsumeOutcome {
    /// One call was taken; `remaining` are left.
    Consumed {
        /// Calls left after this one.
        remaining: u32,
    },
    /// The lease exists but had no calls left.
    Exhausted,
    /// No live lease for the pair.
    Missing,
}

impl ConsumeOutcome {
    /// Whether a call was actually taken from the budget.
    pub fn is_consumed(self) -> bool {
        matches!(self, Self::Consumed { .. })
    }
}

/// Lease failures.
#[derive(Debug, thiserror::Error)]
pub enum LeaseError {
    /// No live lease for the pair.
    #[error("lease not found")]
    NotFound,
    /// The lease record is past its expiry.
    #[error("lease expired")]
    Expired,
    /// The lease has no calls left.
    #[error("lease budget exhausted")]
    BudgetExhausted,
    /// Grant was called with a zero TTL or zero budget.
    #[error("invalid lease terms: {0}")]
    InvalidTerms(String),
    /// The store failed; the check must be treated as a denial.
    #[error(transparent)]
    StoreUnavailable(#[from] StoreError),
}

impl LeaseError {
    /// The access-error category for audit.
    pub fn access_error(&self) -> AccessError {
        match self {
            Self::NotFound => AccessError::LeaseNotFound,
            Self::Expired => AccessError::LeaseExpired,
            Self::BudgetExhausted => AccessError::LeaseBudgetExhausted,
            Self::InvalidTerms(_) => AccessError::PolicyDenied,
            Self::StoreUnavailable(_) => AccessError::StoreUnavailable,
        }
    }
}

/// Issues, validates and consumes leases against the shared store.
#[derive(Clone)]
pub struct LeaseManager {
    store: Arc<dyn Store>,
    bootstrap_tools: Arc<HashSet<String>>,
    audit: Arc<dyn AuditSink>,
}

impl std::fmt::Debug for LeaseManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LeaseManager")
            .field("bootstrap_tools", &self.bootstrap_tools)
            .finish_non_exhaustive()
    }
}

impl LeaseManager {
    /// Create a manager over `store`. `bootstrap_tools` bypass lease checks.
    pub fn new<I>(store: Arc<dyn Store>, bootstrap_tools: I) -> Self
    where
        I: IntoIterator,
        I::Item: Into<String>,
    {
        Self {
            store,
            bootstrap_tools: Arc::new(bootstrap_tools.into_iter().map(Into::into).collect()),
            audit: Arc::new(NullAuditSink),
        }
    }

    /// Record revocations to `audit`.
    #[must_use]
    pub fn with_audit(mut self, audit: Arc<dyn AuditSink>) -> Self {
        self.audit = audit;
        self
    }

    /// The store leases live in.
    pub fn store(&self) -> &Arc<dyn Store> {
        &self.store
    }

    /// Whether `tool_id` is a discovery operation that needs no lease.
    pub fn is_bootstrap(&self, tool_id: &str) -> bool {
        self.bootstrap_tools.contains(tool_id)
    }

    /// Create or overwrite the lease for `(client_id, tool_id)`.
    ///
    /// Any previous budget is discarded. A consume racing with the grant
    /// lands either on the old entry or the new one, never on both.
    ///
    /// # Errors
    ///
    /// [`LeaseError::InvalidTerms`] for a zero TTL or budget;
    /// [`LeaseError::StoreUnavailable`] if the write fails.
    pub async fn grant(&self, terms: LeaseTerms) -> Result<Lease, LeaseError> {
        if terms.ttl.is_zero() {
            return Err(LeaseError::InvalidTerms("ttl must be positive".to_owned()));
        }
        if terms.calls == 0 {
            return Err(LeaseError::InvalidTerms("calls must be positive".to_owned()));
        }
        let ttl = chrono::Duration::from_std(terms.ttl)
            .map_err(|e| LeaseError::InvalidTerms(format!("ttl out of range: {e}")))?;

        let granted_at = Utc::now();
        let lease = Lease {
            client_id: terms.client_id,
            tool_id: terms.tool_id,
            granted_at,
            expires_at: granted_at
                .checked_add_signed(ttl)
                .ok_or_else(|| LeaseError::InvalidTerms("ttl out of range".to_owned()))?,
            calls_remaining: terms.calls,
            initial_calls: terms.calls,
            mode_at_issue: terms.mode_at_issue,
            capability_token: terms.capability_token,
        };

        let key = lease_key(&lease.client_id, &lease.tool_id);
        let value = serde_json::to_string(&lease).map_err(|e| StoreError::Corrupt {
            key: key.clone(),
            reason: e.to_string(),
        })?;
        self.store
            .set(
                &key,
                StoreEntry::counted(value, i64::from(terms.calls)),
                Some(terms.ttl),
            )
            .await?;

        info!(
            client_id = %lease.client_id,
            tool_id = %lease.tool_id,
            calls = lease.initial_calls,
            ttl_secs = terms.ttl.as_secs(),
            "lease granted"
        );
        Ok(lease)
    }

    /// Return the lease if it is present, unexpired and has calls left.
    ///
    /// # Errors
    ///
    /// Every error is a denial. [`LeaseError::StoreUnavailable`] marks an
    /// infrastructure failure rather than a missing or spent lease.
    pub async fn validate(&self, client_id: &str, tool_id: &str) -> Result<Lease, LeaseError> {
        let lease = match self.read(client_id, tool_id).await {
            Ok(Some(lease)) => lease,
            Ok(None) => return Err(LeaseError::NotFound),
            Err(err) => {
                warn!(%client_id, %tool_id, error = %err, "lease validation failed closed");
                return Err(err.into());
            }
        };
        if lease.expires_at <= Utc::now() {
            return Err(LeaseError::Expired);
        }
        if lease.calls_remaining == 0 {
            return Err(LeaseError::BudgetExhausted);
        }
        Ok(lease)
    }

    /// Read the lease snapshot without judging it.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if the read fails or the record is corrupt.
    pub async fn get(&self, client_id: &str, tool_id: &str) -> Result<Option<Lease>, StoreError> {
        self.read(client_id, tool_id).await
    }

    /// Take one call from the budget if any remain.
    ///
    /// A single conditional decrement in the store; concurrent callers can
    /// never jointly exceed the granted budget.
    ///
    /// # Errors
    ///
    /// [`LeaseError::StoreUnavailable`] if the store fails.
    pub async fn consume(
        &self,
        client_id: &str,
        tool_id: &str,
    ) -> Result<ConsumeOutcome, LeaseError> {
        let key = lease_key(client_id, tool_id);
        let outcome = match self.store.decrement_if_positive(&key).await? {
            Decrement::Applied { remaining } => ConsumeOutcome::Consumed {
                remaining: u32::try_from(remaining).map_err(|_| StoreError::Corrupt {
                    key: key.clone(),
                    reason: format!("counter out of range: {remaining}"),
                })?,
            },
            Decrement::Exhausted => ConsumeOutcome::Exhausted,
            Decrement::Missing => ConsumeOutcome::Missing,
        };
        debug!(%client_id, %tool_id, ?outcome, "lease consume");
        Ok(outcome)
    }

    /// Delete the lease. Revoking an absent lease is not an error.
    ///
    /// Every revoke is audited, with `existed` telling whether a live lease
    /// was removed.
    ///
    /// # Errors
    ///
    /// [`LeaseError::StoreUnavailable`] if the store fails.
    pub async fn revoke(&self, client_id: &str, tool_id: &str) -> Result<(), LeaseError> {
        let existed = self.store.delete(&lease_key(client_id, tool_id)).await?;
        if existed {
            info!(%client_id, %tool_id, "lease revoked");
        }
        self.audit.log(
            AuditEventType::LeaseRevoked,
            serde_json::json!({
                "client_id": client_id,
                "tool_id": tool_id,
                "existed": existed,
            }),
        );
        Ok(())
    }

    /// Physically remove expired entries from backends without native TTL.
    ///
    /// # Errors
    ///
    /// [`LeaseError::StoreUnavailable`] if the store fails.
    pub async fn purge_expired(&self) -> Result<u64, LeaseError> {
        let purged = self.store.purge_expired().await?;
        if purged > 0 {
            info!(purged, "expired entries purged");
        }
        Ok(purged)
    }

    async fn read(&self, client_id: &str, tool_id: &str) -> Result<Option<Lease>, StoreError> {
        let key = lease_key(client_id, tool_id);
        let Some(entry) = self.store.get(&key).await? else {
            return Ok(None);
        };
        let mut lease: Lease =
            serde_json::from_str(&entry.value).map_err(|e| StoreError::Corrupt {
                key: key.clone(),
                reason: e.to_string(),
            })?;
        if lease.client_id != client_id || lease.tool_id != tool_id {
            warn!(%client_id, %tool_id, "lease record belongs to another pair");
            return Ok(None);
        }
        let counter = entry.counter.unwrap_or(0);
        lease.calls_remaining = u32::try_from(counter).map_err(|_| StoreError::Corrupt {
            key,
            reason: format!("counter out of range: {counter}"),
        })?;
        Ok(Some(lease))
    }
}
