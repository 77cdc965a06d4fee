//! Redeemed-nonce ledger for single-use tokens.

use std::sync::Arc;
use std::time::Duration;

use tracing::warn;

use super::{TokenError, TokenPayload};
use crate::store::{nonce_key, Store, StoreEntry};

/// Records redeemed nonces in the shared store until their token expires.
#[derive(Clone)]
pub struct NonceLedger {
    store: Arc<dyn Store>,
}

impl std::fmt::Debug for NonceLedger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NonceLedger").finish_non_exhaustive()
    }
}

impl NonceLedger {
    /// Ledger over `store`.
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self { store }
    }

    /// Mark the token's nonce redeemed as of `now` (Unix seconds).
    ///
    /// The entry lives until the token would have expired anyway, so the
    /// ledger never grows past the set of live tokens.
    ///
    /// # Errors
    ///
    /// [`TokenError::Replayed`] if the nonce was already redeemed;
    /// [`TokenError::StoreUnavailable`] if the store fails.
    pub async fn redeem(&self, payload: &TokenPayload, now: i64) -> Result<(), TokenError> {
        let remaining = payload.expires_at.saturating_sub(now).max(1);
        let ttl = Duration::from_secs(u64::try_from(remaining).unwrap_or(1));
        let first = self
            .store
            .set_if_absent(
                &nonce_key(&payload.nonce),
                StoreEntry::plain("redeemed"),
                Some(ttl),
            )
            .await?;
        if first {
            Ok(())
        } else {
            warn!(client_id = %payload.client_id, tool_id = %payload.tool_id, "token replay rejected");
            Err(TokenError::Replayed)
        }
    }
}
