//! Signed capability tokens.
//!
//! Wire format: base64url (no padding) of `payload || tag`, where `payload`
//! is the RFC 8785 canonical JSON of [`TokenPayload`] and `tag` is
//! HMAC-SHA256 over that canonical form.
//!
//! Verification never signs the bytes it was handed. It parses them,
//! re-canonicalises the parsed payload and checks the tag against that, so
//! a token whose embedded bytes are not the canonical encoding of their own
//! content fails as tampered. Raw bytes are only consulted to classify a
//! payload that does not parse at all.

pub mod nonce;

use std::time::Duration;

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;
use chrono::Utc;
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use tracing::debug;
use uuid::Uuid;

use crate::error::AccessError;
use crate::store::StoreError;

pub use self::nonce::NonceLedger;

type HmacSha256 = Hmac<Sha256>;

/// Length of the HMAC-SHA256 tag.
const TAG_LEN: usize = 32;

/// Claims carried by a capability token. Times are Unix seconds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TokenPayload {
    /// Caller the token is bound to.
    pub client_id: String,
    /// Tool the token is bound to.
    pub tool_id: String,
    /// Resource the token is further bound to, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context_key: Option<String>,
    /// Issue time.
    pub issued_at: i64,
    /// Expiry time; the token is rejected once `now > expires_at`.
    pub expires_at: i64,
    /// Unique id, used for single-use tracking.
    pub nonce: String,
}

impl TokenPayload {
    /// Payload issued now, valid for `ttl`, with a fresh nonce.
    pub fn new(
        client_id: impl Into<String>,
        tool_id: impl Into<String>,
        context_key: Option<String>,
        ttl: Duration,
    ) -> Self {
        let issued_at = Utc::now().timestamp();
        let ttl_secs = i64::try_from(ttl.as_secs()).unwrap_or(i64::MAX);
        Self {
            client_id: client_id.into(),
            tool_id: tool_id.into(),
            context_key,
            issued_at,
            expires_at: issued_at.saturating_add(ttl_secs),
            nonce: Uuid::new_v4().to_string(),
        }
    }
}

/// Token failures.
#[derive(Debug, thiserror::Error)]
pub enum TokenError {
    /// Not decodable as a token envelope.
    #[error("token malformed")]
    Malformed,
    /// Signature does not match the canonical payload.
    #[error("token signature mismatch")]
    Tampered,
    /// Past `expires_at`.
    #[error("token expired")]
    Expired,
    /// Bound to a different client, tool or context.
    #[error("token bound to a different call")]
    BindingMismatch,
    /// Single-use token presented again.
    #[error("token already redeemed")]
    Replayed,
    /// The signing key is unusable.
    #[error("invalid signing key: {0}")]
    InvalidKey(String),
    /// The payload could not be canonicalised for signing.
    #[error("payload encoding failed: {0}")]
    Encoding(String),
    /// The nonce ledger could not be reached.
    #[error(transparent)]
    StoreUnavailable(#[from] StoreError),
}

impl TokenError {
    /// The access-error category for audit.
    pub fn access_error(&self) -> AccessError {
        match self {
            Self::Malformed | Self::Encoding(_) => AccessError::TokenMalformed,
            Self::Tampered | Self::InvalidKey(_) => AccessError::TokenTampered,
            Self::Expired => AccessError::TokenExpired,
            Self::BindingMismatch => AccessError::TokenBindingMismatch,
            Self::Replayed => AccessError::TokenReplayed,
            Self::StoreUnavailable(_) => AccessError::StoreUnavailable,
        }
    }
}

/// Canonical (RFC 8785) encoding of a payload.
///
/// # Errors
///
/// [`TokenError::Encoding`] if serialisation fails.
pub fn canonical_bytes(payload: &TokenPayload) -> Result<Vec<u8>, TokenError> {
    serde_jcs::to_vec(payload).map_err(|e| TokenError::Encoding(e.to_string()))
}

/// Issues and verifies capability tokens under one HMAC key.
#[derive(Clone)]
pub struct CapabilityTokenService {
    key: Vec<u8>,
}

impl std::fmt::Debug for CapabilityTokenService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CapabilityTokenService")
            .field("key", &"[REDACTED]")
            .finish()
    }
}

impl CapabilityTokenService {
    /// Create a service with `key`.
    ///
    /// # Errors
    ///
    /// [`TokenError::InvalidKey`] for an empty key.
    pub fn new(key: impl Into<Vec<u8>>) -> Result<Self, TokenError> {
        let key = key.into();
        if key.is_empty() {
            return Err(TokenError::InvalidKey("key is empty".to_owned()));
        }
        Ok(Self { key })
    }

    fn mac(&self) -> Result<HmacSha256, TokenError> {
        HmacSha256::new_from_slice(&self.key).map_err(|e| TokenError::InvalidKey(e.to_string()))
    }

    fn tag_matches(&self, message: &[u8], tag: &[u8]) -> Result<bool, TokenError> {
        let mut mac = self.mac()?;
        mac.update(message);
        Ok(mac.verify_slice(tag).is_ok())
    }

    /// Sign `payload`.
    ///
    /// # Errors
    ///
    /// [`TokenError::Encoding`] or [`TokenError::InvalidKey`].
    pub fn issue(&self, payload: &TokenPayload) -> Result<String, TokenError> {
        let mut envelope = canonical_bytes(payload)?;
        let mut mac = self.mac()?;
        mac.update(&envelope);
        envelope.extend_from_slice(&mac.finalize().into_bytes());
        Ok(URL_SAFE_NO_PAD.encode(envelope))
    }

    /// Verify against the current time.
    ///
    /// # Errors
    ///
    /// See [`Self::verify_at`].
    pub fn verify(&self, token: &str) -> Result<TokenPayload, TokenError> {
        self.verify_at(token, Utc::now().timestamp())
    }

    /// Verify as of `now` (Unix seconds).
    ///
    /// # Errors
    ///
    /// [`TokenError::Malformed`] if the envelope cannot be decoded,
    /// [`TokenError::Tampered`] if the tag does not match the canonical
    /// payload, [`TokenError::Expired`] if `now > expires_at`.
    pub fn verify_at(&self, token: &str, now: i64) -> Result<TokenPayload, TokenError> {
        let envelope = URL_SAFE_NO_PAD
            .decode(token.as_bytes())
            .map_err(|_| TokenError::Malformed)?;
        let Some(split) = envelope.len().checked_sub(TAG_LEN).filter(|&n| n > 0) else {
            return Err(TokenError::Malformed);
        };
        let (raw_payload, tag) = envelope.split_at(split);

        let payload: TokenPayload = match serde_json::from_slice(raw_payload) {
            Ok(p) => p,
            // Unreadable but genuinely ours means a format problem; anything
            // else was altered in transit.
            Err(_) if self.tag_matches(raw_payload, tag)? => return Err(TokenError::Malformed),
            Err(_) => return Err(TokenError::Tampered),
        };

        if !self.tag_matches(&canonical_bytes(&payload)?, tag)? {
            debug!("capability token rejected: tampered");
            return Err(TokenError::Tampered);
        }
        if now > payload.expires_at {
            return Err(TokenError::Expired);
        }
        Ok(payload)
    }

    /// Verify and check the token is bound to this exact call.
    ///
    /// A token carrying a `context_key` only matches a call with the same
    /// context; a token without one matches any context.
    ///
    /// # Errors
    ///
    /// Any [`Self::verify`] error, or [`TokenError::BindingMismatch`].
    pub fn verify_bound(
        &self,
        token: &str,
        client_id: &str,
        tool_id: &str,
        context_key: Option<&str>,
    ) -> Result<TokenPayload, TokenError> {
        self.verify_bound_at(token, client_id, tool_id, context_key, Utc::now().timestamp())
    }

    /// [`Self::verify_bound`] as of `now`.
    ///
    /// # Errors
    ///
    /// As [`Self::verify_bound`].
    pub fn verify_bound_at(
        &self,
        token: &str,
        client_id: &str,
        tool_id: &str,
        context_key: Option<&str>,
        now: i64,
    ) -> Result<TokenPayload, TokenError> {
        let payload = self.verify_at(token, now)?;
        let context_ok = match payload.context_key.as_deref() {
            None => true,
            Some(bound) => context_key == Some(bound),
        };
        if payload.client_id != client_id || payload.tool_id != tool_id || !context_ok {
            return Err(TokenError::BindingMismatch);
        }
        Ok(payload)
    }
}
