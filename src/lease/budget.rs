//! Soft alerts on lease budget consumption.
//!
//! Computed from a lease snapshot after each consume rather than stored, so
//! concurrent consumers never race to record the same alert.

use serde::Serialize;

/// Alert thresholds as percentage of the initial budget consumed.
const ELEVATED_PERCENT: u64 = 70;
const CRITICAL_PERCENT: u64 = 90;

/// Graduated budget consumption level.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BudgetAlert {
    /// Below every threshold.
    Ok,
    /// At least 70% of the budget used.
    Elevated,
    /// At least 90% of the budget used.
    Critical,
    /// No calls remain.
    Exhausted,
}

/// Alert level for a lease with `calls_remaining` out of `initial_budget`.
pub fn budget_alert(calls_remaining: u32, initial_budget: u32) -> BudgetAlert {
    if calls_remaining == 0 {
        return BudgetAlert::Exhausted;
    }
    let percent = percent_consumed(calls_remaining, initial_budget);
    if percent >= CRITICAL_PERCENT {
        BudgetAlert::Critical
    } else if percent >= ELEVATED_PERCENT {
        BudgetAlert::Elevated
    } else {
        BudgetAlert::Ok
    }
}

fn percent_consumed(calls_remaining: u32, initial_budget: u32) -> u64 {
    let initial = u64::from(initial_budget);
    let used = initial.saturating_sub(u64::from(calls_remaining));
    used.saturating_mul(100).checked_div(initial).unwrap_or(0)
}
