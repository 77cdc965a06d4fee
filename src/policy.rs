//! Governance policy matrix.
//!
//! A pure mapping from `(mode, risk)` to a decision:
//!
//! | mode        | safe  | sensitive | dangerous |
//! |-------------|-------|-----------|-----------|
//! | `read_only` | allow | deny      | deny      |
//! | `permission`| allow | approval  | approval  |
//! | `bypass`    | allow | allow     | allow     |
//!
//! Risk levels arrive as free-form strings from the tool registry. Anything
//! that does not parse to a known [`RiskLevel`] is denied, whatever the mode.

use std::collections::HashSet;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Mode and risk
// ---------------------------------------------------------------------------

/// System-wide governance mode, persisted in the shared store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GovernanceMode {
    /// Only safe tools run; everything else is denied.
    ReadOnly,
    /// Safe tools run; others need approval or an elevation.
    Permission,
    /// Everything runs except tools on the bypass deny-list.
    Bypass,
}

impl GovernanceMode {
    /// Stable string form stored under the mode key.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::ReadOnly => "read_only",
            Self::Permission => "permission",
            Self::Bypass => "bypass",
        }
    }
}

impl fmt::Display for GovernanceMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A mode string that is not one of the three known modes.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown governance mode: {0:?}")]
pub struct UnknownMode(pub String);

impl FromStr for GovernanceMode {
    type Err = UnknownMode;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().replace('-', "_").as_str() {
            "read_only" | "readonly" => Ok(Self::ReadOnly),
            "permission" => Ok(Self::Permission),
            "bypass" => Ok(Self::Bypass),
            _ => Err(UnknownMode(s.to_owned())),
        }
    }
}

/// Risk tier of a tool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RiskLevel {
    /// Read-only, no side effects.
    Safe,
    /// Mutates state the caller owns.
    Sensitive,
    /// Arbitrary side effects (command execution, destructive writes).
    Dangerous,
}

impl RiskLevel {
    /// Parse a registry risk string. `low`/`medium`/`high` are accepted as
    /// aliases. Returns `None` for anything else.
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "safe" | "low" => Some(Self::Safe),
            "sensitive" | "medium" => Some(Self::Sensitive),
            "dangerous" | "high" => Some(Self::Dangerous),
            _ => None,
        }
    }

    /// Canonical lowercase name.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Safe => "safe",
            Self::Sensitive => "sensitive",
            Self::Dangerous => "dangerous",
        }
    }
}

// ---------------------------------------------------------------------------
// Decision
// ---------------------------------------------------------------------------

/// Outcome of a policy evaluation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PolicyDecision {
    /// The call may proceed to the lease check.
    Allow,
    /// The call needs an elevation or a fresh approval.
    RequireApproval,
    /// The call is refused, with an internal reason for the log.
    Deny(String),
}

impl PolicyDecision {
    /// Short tag for audit events.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Allow => "allow",
            Self::RequireApproval => "require_approval",
            Self::Deny(_) => "deny",
        }
    }
}

/// Evaluates the mode × risk matrix plus the bootstrap and bypass lists.
#[derive(Debug, Clone, Default)]
pub struct PolicyEngine {
    bootstrap_tools: HashSet<String>,
    bypass_deny_list: HashSet<String>,
}

impl PolicyEngine {
    /// Create an engine with the given bootstrap tools (always allowed) and
    /// bypass deny-list (denied in [`GovernanceMode::Bypass`]).
    pub fn new<B, D>(bootstrap_tools: B, bypass_deny_list: D) -> Self
    where
        B: IntoIterator,
        B::Item: Into<String>,
        D: IntoIterator,
        D::Item: Into<String>,
    {
        Self {
            bootstrap_tools: bootstrap_tools.into_iter().map(Into::into).collect(),
            bypass_deny_list: bypass_deny_list.into_iter().map(Into::into).collect(),
        }
    }

    /// The bare matrix.
    pub fn decide(mode: GovernanceMode, risk: RiskLevel) -> PolicyDecision {
        match (mode, risk) {
            (_, RiskLevel::Safe) => PolicyDecision::Allow,
            (GovernanceMode::ReadOnly, risk) => {
                PolicyDecision::Deny(format!("read_only mode blocks {} tools", risk.as_str()))
            }
            (GovernanceMode::Permission, _) => PolicyDecision::RequireApproval,
            (GovernanceMode::Bypass, _) => PolicyDecision::Allow,
        }
    }

    /// Evaluate a call to `tool` whose registry risk string is `risk`.
    pub fn evaluate(&self, mode: GovernanceMode, risk: &str, tool: &str) -> PolicyDecision {
        if self.is_bootstrap(tool) {
            return PolicyDecision::Allow;
        }
        let Some(level) = RiskLevel::parse(risk) else {
            return PolicyDecision::Deny(format!("unrecognized risk level {risk:?}"));
        };
        if mode == GovernanceMode::Bypass && self.bypass_deny_list.contains(tool) {
            return PolicyDecision::Deny(format!("{tool} is on the bypass deny-list"));
        }
        Self::decide(mode, level)
    }

    /// Whether `tool` is a discovery-only bootstrap operation.
    pub fn is_bootstrap(&self, tool: &str) -> bool {
        self.bootstrap_tools.contains(tool)
    }
}
