//! Access-error taxonomy shared by every gating check.
//!
//! Each variant is a reason a call was refused. None of them carries the
//! underlying store error text or token bytes: the detail stays in the
//! diagnostic log, and the category is what reaches the audit trail.

use serde::Serialize;

use crate::store::StoreError;

/// Why a call was not allowed to proceed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, thiserror::Error)]
#[serde(rename_all = "snake_case")]
pub enum AccessError {
    /// No lease exists for the client/tool pair.
    #[error("no lease for this client and tool")]
    LeaseNotFound,
    /// The lease is past its expiry.
    #[error("lease expired")]
    LeaseExpired,
    /// The lease has no calls remaining.
    #[error("lease budget exhausted")]
    LeaseBudgetExhausted,
    /// Approval is required and no matching elevation exists.
    #[error("no elevation for this scope")]
    ElevationMissing,
    /// The policy matrix (or an unknown tool or risk level) denied the call.
    #[error("denied by policy")]
    PolicyDenied,
    /// The approver explicitly denied the request.
    #[error("approval denied")]
    ApprovalDenied,
    /// No approval decision arrived before the timeout, or the wait was
    /// cancelled.
    #[error("approval timed out")]
    ApprovalTimedOut,
    /// The approver's response could not be interpreted, or selected a scope
    /// set other than the one requested.
    #[error("approval response malformed")]
    ApprovalMalformed,
    /// The token could not be decoded.
    #[error("capability token malformed")]
    TokenMalformed,
    /// The token's signature does not match its payload.
    #[error("capability token tampered")]
    TokenTampered,
    /// The token is past its expiry.
    #[error("capability token expired")]
    TokenExpired,
    /// The token was issued for a different client, tool or context.
    #[error("capability token bound to a different call")]
    TokenBindingMismatch,
    /// A single-use token was presented a second time.
    #[error("capability token already redeemed")]
    TokenReplayed,
    /// The shared store could not be reached or did not answer in time.
    #[error("authorization store unavailable")]
    StoreUnavailable,
}

impl AccessError {
    /// Stable snake_case tag used in audit events.
    pub fn category(self) -> &'static str {
        match self {
            Self::LeaseNotFound => "lease_not_found",
            Self::LeaseExpired => "lease_expired",
            Self::LeaseBudgetExhausted => "lease_budget_exhausted",
            Self::ElevationMissing => "elevation_missing",
            Self::PolicyDenied => "policy_denied",
            Self::ApprovalDenied => "approval_denied",
            Self::ApprovalTimedOut => "approval_timed_out",
            Self::ApprovalMalformed => "approval_malformed",
            Self::TokenMalformed => "token_malformed",
            Self::TokenTampered => "token_tampered",
            Self::TokenExpired => "token_expired",
            Self::TokenBindingMismatch => "token_binding_mismatch",
            Self::TokenReplayed => "token_replayed",
            Self::StoreUnavailable => "store_unavailable",
        }
    }

    /// Whether the refusal came from infrastructure rather than a
    /// legitimate authorization decision.
    pub fn is_infrastructure(self) -> bool {
        matches!(self, Self::StoreUnavailable)
    }
}

impl From<&StoreError> for AccessError {
    fn from(_: &StoreError) -> Self {
        Self::StoreUnavailable
    }
}

impl From<StoreError> for AccessError {
    fn from(err: StoreError) -> Self {
        Self::from(&err)
    }
}
