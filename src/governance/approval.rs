//! Human/agent approval for calls that policy will not allow on its own.
//!
//! A request moves `Requested -> {Approved, Denied, TimedOut}` and never
//! leaves a terminal state. The approver's raw response is parsed strictly:
//! a JSON object tagged on `decision`, nothing else. Key=value text, unknown
//! fields, duplicate fields and duplicate scopes are all malformed, and a
//! malformed response is a denial.
//!
//! An approval must select exactly the scopes it was asked for. A subset
//! or a superset is treated as malformed rather than partially honoured.

use std::collections::HashSet;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};
use uuid::Uuid;

use crate::error::AccessError;

/// What the approver is shown.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ApprovalRequest {
    /// Unique id; a response may echo it.
    pub request_id: Uuid,
    /// Caller asking to run the tool.
    pub client_id: String,
    /// Tool to run.
    pub tool: String,
    /// Rendered arguments, long values truncated.
    pub argument_summary: String,
    /// Scopes the approval must select, all of them.
    pub candidate_scopes: Vec<String>,
    /// How long the approver has.
    pub timeout_seconds: u64,
}

impl ApprovalRequest {
    /// New request with a fresh id.
    pub fn new(
        client_id: impl Into<String>,
        tool: impl Into<String>,
        argument_summary: impl Into<String>,
        candidate_scopes: Vec<String>,
        timeout: Duration,
    ) -> Self {
        Self {
            request_id: Uuid::new_v4(),
            client_id: client_id.into(),
            tool: tool.into(),
            argument_summary: argument_summary.into(),
            candidate_scopes,
            timeout_seconds: timeout.as_secs(),
        }
    }
}

/// The external approval collaborator (UI, chat prompt, policy agent).
///
/// Returns the raw response text; parsing belongs to [`ApprovalFlow`].
#[async_trait]
pub trait Approver: Send + Sync {
    /// Present `request` and wait for a decision.
    async fn request_approval(&self, request: &ApprovalRequest) -> anyhow::Result<String>;
}

// ---------------------------------------------------------------------------
// Response parsing
// ---------------------------------------------------------------------------

/// A well-formed approval response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ApprovalResponse {
    /// Approved for the selected scopes.
    Approved {
        /// Scopes the approver granted.
        selected_scopes: Vec<String>,
        /// Elevation lifetime; zero means this call only.
        lease_seconds: u64,
    },
    /// Refused.
    Denied,
}

/// Why a response could not be accepted.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ApprovalParseError {
    /// Not a JSON object of the expected shape.
    #[error("approval response is not a valid decision object: {0}")]
    Invalid(String),
    /// An `approved` decision without a required field.
    #[error("approved decision missing {0}")]
    MissingField(&'static str),
    /// A `denied` decision carrying approval fields.
    #[error("denied decision must not carry {0}")]
    UnexpectedField(&'static str),
    /// A scope was selected twice.
    #[error("scope selected more than once: {0}")]
    DuplicateScope(String),
    /// The response echoes a different request id.
    #[error("response is for a different request")]
    RequestMismatch,
}

#[derive(Deserialize)]
#[serde(rename_all = "snake_case")]
enum WireDecision {
    Approved,
    Denied,
}

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct WireResponse {
    decision: WireDecision,
    #[serde(default)]
    selected_scopes: Option<Vec<String>>,
    #[serde(default)]
    lease_seconds: Option<u64>,
    #[serde(default)]
    request_id: Option<Uuid>,
}

impl ApprovalResponse {
    /// Parse a raw response for `request`.
    ///
    /// # Errors
    ///
    /// [`ApprovalParseError`] for anything other than an unambiguous decision.
    pub fn parse(raw: &str, request: &ApprovalRequest) -> Result<Self, ApprovalParseError> {
        let wire: WireResponse =
            serde_json::from_str(raw).map_err(|e| ApprovalParseError::Invalid(e.to_string()))?;
        if wire.request_id.is_some_and(|id| id != request.request_id) {
            return Err(ApprovalParseError::RequestMismatch);
        }
        match wire.decision {
            WireDecision::Denied => {
                if wire.selected_scopes.is_some() {
                    return Err(ApprovalParseError::UnexpectedField("selected_scopes"));
                }
                if wire.lease_seconds.is_some() {
                    return Err(ApprovalParseError::UnexpectedField("lease_seconds"));
                }
                Ok(Self::Denied)
            }
            WireDecision::Approved => {
                let selected_scopes = wire
                    .selected_scopes
                    .ok_or(ApprovalParseError::MissingField("selected_scopes"))?;
                let lease_seconds = wire
                    .lease_seconds
                    .ok_or(ApprovalParseError::MissingField("lease_seconds"))?;
                let mut seen = HashSet::new();
                if let Some(dup) = selected_scopes.iter().find(|s| !seen.insert(s.as_str())) {
                    return Err(ApprovalParseError::DuplicateScope(dup.clone()));
                }
                Ok(Self::Approved {
                    selected_scopes,
                    lease_seconds,
                })
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Flow
// ---------------------------------------------------------------------------

/// Terminal and non-terminal approval states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ApprovalState {
    /// Waiting on the approver.
    Requested,
    /// Approved with the exact scope set.
    Approved,
    /// Refused, or the response was unusable.
    Denied,
    /// No decision in time, or the wait was cancelled.
    TimedOut,
}

/// Result of running an approval.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ApprovalOutcome {
    /// Approved; `lease_seconds` of zero means single use.
    Approved {
        /// Elevation lifetime in seconds.
        lease_seconds: u64,
    },
    /// The approver said no.
    Denied,
    /// Nothing came back in time, or the caller went away.
    TimedOut,
    /// A response arrived but could not be honoured.
    Malformed(String),
}

impl ApprovalOutcome {
    /// Terminal state reached.
    pub fn state(&self) -> ApprovalState {
        match self {
            Self::Approved { .. } => ApprovalState::Approved,
            Self::Denied | Self::Malformed(_) => ApprovalState::Denied,
            Self::TimedOut => ApprovalState::TimedOut,
        }
    }

    /// Access error for a non-approved outcome.
    pub fn access_error(&self) -> Option<AccessError> {
        match self {
            Self::Approved { .. } => None,
            Self::Denied => Some(AccessError::ApprovalDenied),
            Self::TimedOut => Some(AccessError::ApprovalTimedOut),
            Self::Malformed(_) => Some(AccessError::ApprovalMalformed),
        }
    }
}

/// Runs approval requests against an [`Approver`] with a timeout.
#[derive(Clone)]
pub struct ApprovalFlow {
    approver: Arc<dyn Approver>,
    timeout: Duration,
}

impl std::fmt::Debug for ApprovalFlow {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ApprovalFlow")
            .field("timeout", &self.timeout)
            .finish_non_exhaustive()
    }
}

impl ApprovalFlow {
    /// Create a flow with the given per-request timeout.
    pub fn new(approver: Arc<dyn Approver>, timeout: Duration) -> Self {
        Self { approver, timeout }
    }

    /// Configured timeout.
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Build a request for this flow's timeout.
    pub fn request(
        &self,
        client_id: &str,
        tool: &str,
        argument_summary: String,
        candidate_scopes: Vec<String>,
    ) -> ApprovalRequest {
        ApprovalRequest::new(client_id, tool, argument_summary, candidate_scopes, self.timeout)
    }

    /// Ask for approval and wait cooperatively, until a decision, the
    /// timeout, or `cancelled` resolves. Cancellation counts as a timeout.
    pub async fn run<C>(&self, request: &ApprovalRequest, cancelled: C) -> ApprovalOutcome
    where
        C: Future<Output = ()> + Send,
    {
        info!(
            request_id = %request.request_id,
            client_id = %request.client_id,
            tool = %request.tool,
            "approval requested"
        );
        let wait = tokio::time::timeout(self.timeout, self.approver.request_approval(request));
        let raw = tokio::select! {
            result = wait => match result {
                Err(_) => {
                    warn!(request_id = %request.request_id, "approval timed out");
                    return ApprovalOutcome::TimedOut;
                }
                Ok(Err(e)) => {
                    warn!(request_id = %request.request_id, error = %e, "approver failed");
                    return ApprovalOutcome::TimedOut;
                }
                Ok(Ok(raw)) => raw,
            },
            () = cancelled => {
                warn!(request_id = %request.request_id, "approval wait cancelled");
                return ApprovalOutcome::TimedOut;
            }
        };

        let outcome = match ApprovalResponse::parse(&raw, request) {
            Err(e) => ApprovalOutcome::Malformed(e.to_string()),
            Ok(ApprovalResponse::Denied) => ApprovalOutcome::Denied,
            Ok(ApprovalResponse::Approved {
                selected_scopes,
                lease_seconds,
            }) => match scope_mismatch(&request.candidate_scopes, &selected_scopes) {
                Some(reason) => ApprovalOutcome::Malformed(reason),
                None => ApprovalOutcome::Approved { lease_seconds },
            },
        };
        info!(
            request_id = %request.request_id,
            state = ?outcome.state(),
            "approval resolved"
        );
        outcome
    }
}

fn scope_mismatch(required: &[String], selected: &[String]) -> Option<String> {
    let required: HashSet<&str> = required.iter().map(String::as_str).collect();
    let selected: HashSet<&str> = selected.iter().map(String::as_str).collect();
    if let Some(missing) = required.difference(&selected).next() {
        return Some(format!("required scope not selected: {missing}"));
    }
    if let Some(extra) = selected.difference(&required).next() {
        return Some(format!("unrequested scope selected: {extra}"));
    }
    None
}
