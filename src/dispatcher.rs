//! The call boundary: policy, elevation or approval, lease, token,
//! execution, consume, audit. In that order, every time.
//!
//! Every refusal is a [`CallRejected`] whose `Display` is the same generic
//! string, whatever the cause. The cause is kept for the audit trail and is
//! readable through [`CallRejected::kind`], but never rendered to the caller.
//!
//! Each dispatch produces exactly one audit event summarising what happened
//! at each step.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use serde::Serialize;
use serde_json::Value;
use tracing::{info, warn};

use crate::audit::{AuditEventType, AuditSink};
use crate::config::{LeasegateConfig, RiskTable};
use crate::error::AccessError;
use crate::governance::approval::{ApprovalFlow, ApprovalOutcome, ApprovalState};
use crate::governance::{scope_hash, scopes, GovernanceState};
use crate::lease::{budget_alert, BudgetAlert, ConsumeOutcome, Lease, LeaseManager, LeaseTerms};
use crate::policy::{GovernanceMode, PolicyDecision, PolicyEngine, RiskLevel};
use crate::registry::{ToolRecord, ToolRegistry};
use crate::token::{CapabilityTokenService, NonceLedger, TokenPayload};

// ---------------------------------------------------------------------------
// Public types
// ---------------------------------------------------------------------------

/// One inbound call.
#[derive(Debug, Clone, PartialEq)]
pub struct ToolCall {
    /// Caller identity as given by the transport.
    pub client_id: String,
    /// Tool to run.
    pub tool_id: String,
    /// Tool arguments (a JSON object).
    pub arguments: Value,
    /// Capability token presented with the call, if any.
    pub capability_token: Option<String>,
}

impl ToolCall {
    /// Call without a token.
    pub fn new(client_id: impl Into<String>, tool_id: impl Into<String>, arguments: Value) -> Self {
        Self {
            client_id: client_id.into(),
            tool_id: tool_id.into(),
            arguments,
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

/// The operation implementations, supplied by the host.
#[async_trait]
pub trait Operation: Send + Sync {
    /// Run `tool_id` with `arguments`.
    async fn execute(&self, tool_id: &str, arguments: &Value) -> anyhow::Result<Value>;
}

/// A call refused at a gating check.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("access denied")]
pub struct CallRejected {
    kind: AccessError,
}

impl CallRejected {
    /// Internal reason, for audit and tests. Never show this to the caller.
    pub fn kind(&self) -> AccessError {
        self.kind
    }
}

impl From<AccessError> for CallRejected {
    fn from(kind: AccessError) -> Self {
        Self { kind }
    }
}

/// A call that passed the gate and ran.
#[derive(Debug)]
pub struct CallResult {
    /// What the operation returned. An operation error still used a call.
    pub output: anyhow::Result<Value>,
    /// The post-execution consume found no budget left: a concurrent call
    /// took the last one while this one was running.
    pub budget_race_lost: bool,
    /// Calls left after this one, when known.
    pub calls_remaining: Option<u32>,
    /// Alert level after this call, when known.
    pub budget_alert: Option<BudgetAlert>,
}

/// A lease issued through [`Dispatcher::request_lease`].
#[derive(Debug, Clone, PartialEq)]
pub struct LeaseGrant {
    /// The granted lease, carrying its capability token.
    pub lease: Lease,
    /// The tool's input schema, now that the client may see it.
    pub schema: Value,
}

/// Budget and lifetime rules applied by the dispatcher.
#[derive(Debug, Clone)]
pub struct DispatchSettings {
    /// Lease lifetime per risk tier.
    pub ttl_by_risk: RiskTable<Duration>,
    /// Call budget per risk tier.
    pub calls_by_risk: RiskTable<u32>,
    /// Lifetime of a single-use lease.
    pub one_shot_ttl: Duration,
    /// Cap on the elevation and lease lifetime an approver may choose.
    pub max_elevation_ttl: Duration,
    /// Tools that need no lease.
    pub bootstrap_tools: Vec<String>,
    /// Tools denied even in bypass mode.
    pub bypass_deny_list: Vec<String>,
    /// Reject a capability token's second presentation. Redeemed nonces are
    /// tracked in the lease store.
    pub single_use_tokens: bool,
}

impl Default for DispatchSettings {
    fn default() -> Self {
        Self::from(&LeasegateConfig::default())
    }
}

impl From<&LeasegateConfig> for DispatchSettings {
    fn from(config: &LeasegateConfig) -> Self {
        let ttl = config.leases.ttl_by_risk;
        Self {
            ttl_by_risk: RiskTable {
                safe: Duration::from_secs(ttl.safe),
                sensitive: Duration::from_secs(ttl.sensitive),
                dangerous: Duration::from_secs(ttl.dangerous),
            },
            calls_by_risk: config.leases.calls_by_risk,
            one_shot_ttl: Duration::from_secs(config.leases.one_shot_ttl_seconds),
            max_elevation_ttl: Duration::from_secs(config.governance.elevation_ttl_seconds),
            bootstrap_tools: config.leases.bootstrap_tools.clone(),
            bypass_deny_list: config.governance.bypass_deny_list.clone(),
            single_use_tokens: config.tokens.single_use,
        }
    }
}

// ---------------------------------------------------------------------------
// Audit summary
// ---------------------------------------------------------------------------

/// What happened at each step, written as one audit event.
#[derive(Debug, Default, Serialize)]
struct CallSummary {
    client_id: String,
    tool_id: String,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    bootstrap: bool,
    mode: Option<GovernanceMode>,
    decision: Option<&'static str>,
    elevation: Option<&'static str>,
    approval: Option<ApprovalState>,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    lease_granted: bool,
    token: Option<&'static str>,
    operation: Option<&'static str>,
    consume: Option<&'static str>,
    calls_remaining: Option<u32>,
    budget_alert: Option<BudgetAlert>,
    category: Option<&'static str>,
}

impl CallSummary {
    fn new(client_id: &str, tool_id: &str) -> Self {
        Self {
            client_id: client_id.to_owned(),
            tool_id: tool_id.to_owned(),
            ..Self::default()
        }
    }

    fn to_fields(&self) -> Value {
        serde_json::to_value(self).unwrap_or_default()
    }
}

/// How a required approval was satisfied.
enum Clearance {
    /// A live elevation already covered the scope for `remaining`.
    Elevated { remaining: Duration },
    /// A fresh approval; `lease_seconds` of zero means single use.
    Approved { lease_seconds: u64 },
}

// ---------------------------------------------------------------------------
// Dispatcher
// ---------------------------------------------------------------------------

/// Sequences the gate around operation execution.
pub struct Dispatcher {
    policy: PolicyEngine,
    governance: Arc<GovernanceState>,
    leases: LeaseManager,
    tokens: CapabilityTokenService,
    nonces: NonceLedger,
    registry: Arc<ToolRegistry>,
    approvals: ApprovalFlow,
    audit: Arc<dyn AuditSink>,
    settings: DispatchSettings,
}

impl std::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dispatcher")
            .field("settings", &self.settings)
            .finish_non_exhaustive()
    }
}

impl Dispatcher {
    /// Assemble a dispatcher. Redeemed token nonces share the lease store.
    pub fn new(
        governance: Arc<GovernanceState>,
        leases: LeaseManager,
        tokens: CapabilityTokenService,
        registry: Arc<ToolRegistry>,
        approvals: ApprovalFlow,
        audit: Arc<dyn AuditSink>,
        settings: DispatchSettings,
    ) -> Self {
        Self {
            policy: PolicyEngine::new(
                settings.bootstrap_tools.iter().cloned(),
                settings.bypass_deny_list.iter().cloned(),
            ),
            governance,
            nonces: NonceLedger::new(Arc::clone(leases.store())),
            leases,
            tokens,
            registry,
            approvals,
            audit,
            settings,
        }
    }

    /// The lease manager this dispatcher consults.
    pub fn leases(&self) -> &LeaseManager {
        &self.leases
    }

    /// Run `call` through the gate and, if admitted, `operation`.
    ///
    /// # Errors
    ///
    /// [`CallRejected`] if any gating check refuses the call.
    pub async fn dispatch(
        &self,
        call: &ToolCall,
        operation: &dyn Operation,
    ) -> Result<CallResult, CallRejected> {
        self.dispatch_until(call, operation, std::future::pending())
            .await
    }

    /// [`Self::dispatch`], aborting any approval wait when `cancelled`
    /// resolves. An aborted wait is a timeout: nothing is granted.
    ///
    /// # Errors
    ///
    /// [`CallRejected`] if any gating check refuses the call.
    pub async fn dispatch_until<C>(
        &self,
        call: &ToolCall,
        operation: &dyn Operation,
        cancelled: C,
    ) -> Result<CallResult, CallRejected>
    where
        C: Future<Output = ()> + Send,
    {
        let mut summary = CallSummary::new(&call.client_id, &call.tool_id);

        if self.leases.is_bootstrap(&call.tool_id) {
            summary.bootstrap = true;
            return Ok(self.execute(call, operation, None, summary).await);
        }

        // 1-2. Policy.
        let Some(record) = self.registry.get(&call.tool_id) else {
            return Err(self.reject(summary, AccessError::PolicyDenied));
        };
        let mode = match self.governance.get_mode().await {
            Ok(mode) => mode,
            Err(e) => return Err(self.reject(summary, e.access_error())),
        };
        summary.mode = Some(mode);
        let decision = self.policy.evaluate(mode, &record.risk_level, &call.tool_id);
        summary.decision = Some(decision.as_str());
        let context_key = scopes::context_key(&call.tool_id, &call.arguments);

        // 3. Elevation or approval.
        if decision == PolicyDecision::RequireApproval {
            let clearance = match self
                .clear_for_call(call, record, &context_key, &mut summary, cancelled)
                .await
            {
                Ok(c) => c,
                Err(kind) => return Err(self.reject(summary, kind)),
            };
            let ensured = match self.lease_terms_for(record, &clearance) {
                Ok((ttl, calls)) => self.ensure_lease(call, mode, ttl, calls, &mut summary).await,
                Err(kind) => Err(kind),
            };
            if let Err(kind) = ensured {
                return Err(self.reject(summary, kind));
            }
        } else if let PolicyDecision::Deny(reason) = &decision {
            info!(client_id = %call.client_id, tool_id = %call.tool_id, %reason, "policy denied call");
            return Err(self.reject(summary, AccessError::PolicyDenied));
        }

        // 4. Lease.
        let lease = match self.leases.validate(&call.client_id, &call.tool_id).await {
            Ok(lease) => lease,
            Err(e) => return Err(self.reject(summary, e.access_error())),
        };

        // 5. Token.
        if let Some(token) = &call.capability_token {
            if let Err(kind) = self.check_token(call, token, &context_key).await {
                summary.token = Some("rejected");
                return Err(self.reject(summary, kind));
            }
            summary.token = Some("verified");
        }

        // 6-8. Execute, consume, audit.
        Ok(self.execute(call, operation, Some(&lease), summary).await)
    }

    /// Issue a lease for `tool_id` to `client_id`, running approval if the
    /// policy requires it.
    ///
    /// # Errors
    ///
    /// [`CallRejected`] if the tool is unknown, policy denies it, approval
    /// fails, or the store cannot answer.
    pub async fn request_lease(
        &self,
        client_id: &str,
        tool_id: &str,
    ) -> Result<LeaseGrant, CallRejected> {
        self.request_lease_until(client_id, tool_id, std::future::pending())
            .await
    }

    /// [`Self::request_lease`] with an explicit cancellation signal.
    ///
    /// # Errors
    ///
    /// As [`Self::request_lease`].
    pub async fn request_lease_until<C>(
        &self,
        client_id: &str,
        tool_id: &str,
        cancelled: C,
    ) -> Result<LeaseGrant, CallRejected>
    where
        C: Future<Output = ()> + Send,
    {
        let mut summary = CallSummary::new(client_id, tool_id);
        let Some(record) = self.registry.get(tool_id) else {
            return Err(self.reject(summary, AccessError::PolicyDenied));
        };
        let Some(risk) = RiskLevel::parse(&record.risk_level) else {
            return Err(self.reject(summary, AccessError::PolicyDenied));
        };
        let mode = match self.governance.get_mode().await {
            Ok(mode) => mode,
            Err(e) => return Err(self.reject(summary, e.access_error())),
        };
        summary.mode = Some(mode);
        let decision = self.policy.evaluate(mode, &record.risk_level, tool_id);
        summary.decision = Some(decision.as_str());

        let mut ttl = self.settings.ttl_by_risk.get(risk);
        let mut calls = self.settings.calls_by_risk.get(risk);
        match &decision {
            PolicyDecision::Deny(reason) => {
                info!(%client_id, %tool_id, %reason, "policy denied lease");
                return Err(self.reject(summary, AccessError::PolicyDenied));
            }
            PolicyDecision::Allow => {}
            PolicyDecision::RequireApproval => {
                // A lease request is tool-wide: its context is the tool itself.
                let call = ToolCall::new(client_id, tool_id, Value::Null);
                let terms = match self
                    .clear_for_call(&call, record, tool_id, &mut summary, cancelled)
                    .await
                {
                    Ok(clearance) => self.lease_terms_for(record, &clearance),
                    Err(kind) => Err(kind),
                };
                match terms {
                    Ok(terms) => (ttl, calls) = terms,
                    Err(kind) => return Err(self.reject(summary, kind)),
                }
            }
        }

        let lease = match self.issue_lease(client_id, tool_id, ttl, calls, mode).await {
            Ok(lease) => lease,
            Err(kind) => return Err(self.reject(summary, kind)),
        };
        summary.lease_granted = true;
        summary.calls_remaining = Some(lease.calls_remaining);
        self.audit
            .log(AuditEventType::LeaseGranted, summary.to_fields());
        Ok(LeaseGrant {
            lease,
            schema: record.input_schema.clone(),
        })
    }

    // -- steps ---------------------------------------------------------------

    /// Step 3: find a matching elevation or obtain an approval.
    async fn clear_for_call<C>(
        &self,
        call: &ToolCall,
        record: &ToolRecord,
        context_key: &str,
        summary: &mut CallSummary,
        cancelled: C,
    ) -> Result<Clearance, AccessError>
    where
        C: Future<Output = ()> + Send,
    {
        let hash = scope_hash(&call.client_id, &call.tool_id, context_key)
            .map_err(|e| e.access_error())?;
        let tool_hash = scope_hash(&call.client_id, &call.tool_id, &call.tool_id)
            .map_err(|e| e.access_error())?;

        let mut candidates = vec![hash.as_str()];
        if tool_hash != hash {
            candidates.push(tool_hash.as_str());
        }
        for candidate in candidates {
            if let Some(remaining) = self
                .governance
                .elevation_remaining(candidate)
                .await
                .map_err(|e| e.access_error())?
            {
                summary.elevation = Some("existing");
                return Ok(Clearance::Elevated { remaining });
            }
        }

        let required = scopes::required_scopes(Some(record), &call.tool_id, &call.arguments);
        let request = self.approvals.request(
            &call.client_id,
            &call.tool_id,
            scopes::argument_summary(&call.arguments),
            required,
        );
        let outcome = self.approvals.run(&request, cancelled).await;
        summary.approval = Some(outcome.state());

        let lease_seconds = match outcome {
            ApprovalOutcome::Approved { lease_seconds } => lease_seconds,
            ApprovalOutcome::Malformed(reason) => {
                warn!(client_id = %call.client_id, tool_id = %call.tool_id, %reason, "approval response rejected");
                return Err(AccessError::ApprovalMalformed);
            }
            other => {
                return Err(other.access_error().unwrap_or(AccessError::ApprovalDenied));
            }
        };

        if lease_seconds > 0 {
            let ttl = self.approved_ttl(lease_seconds);
            self.governance
                .grant_elevation(&hash, ttl)
                .await
                .map_err(|e| e.access_error())?;
            summary.elevation = Some("granted");
        }
        Ok(Clearance::Approved { lease_seconds })
    }

    /// Approver-chosen lifetime, capped.
    fn approved_ttl(&self, lease_seconds: u64) -> Duration {
        Duration::from_secs(lease_seconds).min(self.settings.max_elevation_ttl)
    }

    /// Lifetime and budget of a lease issued under `clearance`.
    ///
    /// Under a standing elevation the lease never outlives it; after a
    /// fresh approval it lasts what the approver chose, within the cap.
    fn lease_terms_for(
        &self,
        record: &ToolRecord,
        clearance: &Clearance,
    ) -> Result<(Duration, u32), AccessError> {
        let risk = RiskLevel::parse(&record.risk_level).ok_or(AccessError::PolicyDenied)?;
        let calls = self.settings.calls_by_risk.get(risk);
        Ok(match *clearance {
            Clearance::Elevated { remaining } => {
                (self.settings.ttl_by_risk.get(risk).min(remaining), calls)
            }
            Clearance::Approved { lease_seconds: 0 } => (self.settings.one_shot_ttl, 1),
            Clearance::Approved { lease_seconds } => (self.approved_ttl(lease_seconds), calls),
        })
    }

    /// Once cleared, make sure the caller holds a usable lease, issuing one
    /// on `ttl` and `calls` if not.
    async fn ensure_lease(
        &self,
        call: &ToolCall,
        mode: GovernanceMode,
        ttl: Duration,
        calls: u32,
        summary: &mut CallSummary,
    ) -> Result<(), AccessError> {
        match self.leases.validate(&call.client_id, &call.tool_id).await {
            Ok(_) => return Ok(()),
            Err(e) if e.access_error() == AccessError::StoreUnavailable => {
                return Err(AccessError::StoreUnavailable)
            }
            Err(_) => {}
        }
        self.issue_lease(&call.client_id, &call.tool_id, ttl, calls, mode)
            .await?;
        summary.lease_granted = true;
        Ok(())
    }

    /// Grant a lease carrying a token that expires with it.
    async fn issue_lease(
        &self,
        client_id: &str,
        tool_id: &str,
        ttl: Duration,
        calls: u32,
        mode: GovernanceMode,
    ) -> Result<Lease, AccessError> {
        let payload = TokenPayload::new(client_id, tool_id, None, ttl);
        let token = self.tokens.issue(&payload).map_err(|e| {
            warn!(error = %e, "token issue failed");
            e.access_error()
        })?;
        self.leases
            .grant(LeaseTerms::new(client_id, tool_id, ttl, calls, mode).with_token(token))
            .await
            .map_err(|e| e.access_error())
    }

    /// Step 5: verify, bind and optionally redeem a presented token.
    async fn check_token(
        &self,
        call: &ToolCall,
        token: &str,
        context_key: &str,
    ) -> Result<(), AccessError> {
        let now = Utc::now().timestamp();
        let payload = self
            .tokens
            .verify_bound_at(token, &call.client_id, &call.tool_id, Some(context_key), now)
            .map_err(|e| e.access_error())?;
        if self.settings.single_use_tokens {
            self.nonces
                .redeem(&payload, now)
                .await
                .map_err(|e| e.access_error())?;
        }
        Ok(())
    }

    /// Steps 6-8. `lease` is `None` for bootstrap tools, which consume
    /// nothing.
    async fn execute(
        &self,
        call: &ToolCall,
        operation: &dyn Operation,
        lease: Option<&Lease>,
        mut summary: CallSummary,
    ) -> CallResult {
        let output = operation.execute(&call.tool_id, &call.arguments).await;
        summary.operation = Some(if output.is_ok() { "succeeded" } else { "failed" });

        let mut result = CallResult {
            output,
            budget_race_lost: false,
            calls_remaining: None,
            budget_alert: None,
        };

        let Some(lease) = lease else {
            self.audit
                .log(AuditEventType::CallExecuted, summary.to_fields());
            return result;
        };

        let event = match self.leases.consume(&call.client_id, &call.tool_id).await {
            Ok(ConsumeOutcome::Consumed { remaining }) => {
                let alert = budget_alert(remaining, lease.initial_calls);
                result.calls_remaining = Some(remaining);
                result.budget_alert = Some(alert);
                summary.consume = Some("consumed");
                summary.calls_remaining = Some(remaining);
                summary.budget_alert = Some(alert);
                if matches!(alert, BudgetAlert::Critical | BudgetAlert::Elevated) {
                    info!(client_id = %call.client_id, tool_id = %call.tool_id, ?alert, remaining, "lease budget running low");
                }
                AuditEventType::CallExecuted
            }
            Ok(ConsumeOutcome::Exhausted | ConsumeOutcome::Missing) => {
                warn!(client_id = %call.client_id, tool_id = %call.tool_id, "budget race lost after execution");
                result.budget_race_lost = true;
                summary.consume = Some("race_lost");
                AuditEventType::BudgetRaceLost
            }
            Err(e) => {
                warn!(client_id = %call.client_id, tool_id = %call.tool_id, error = %e, "consume failed after execution");
                summary.consume = Some("store_unavailable");
                summary.category = Some(AccessError::StoreUnavailable.category());
                AuditEventType::CallExecuted
            }
        };
        self.audit.log(event, summary.to_fields());
        result
    }

    fn reject(&self, mut summary: CallSummary, kind: AccessError) -> CallRejected {
        summary.category = Some(kind.category());
        if kind.is_infrastructure() {
            warn!(client_id = %summary.client_id, tool_id = %summary.tool_id, category = kind.category(), "call denied: store unavailable");
        } else {
            info!(client_id = %summary.client_id, tool_id = %summary.tool_id, category = kind.category(), "call denied");
        }
        self.audit
            .log(AuditEventType::CallDenied, summary.to_fields());
        CallRejected::from(kind)
    }
}
