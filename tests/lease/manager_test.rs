//! Tests for `LeaseManager` lifecycle: grant, validate, consume, revoke.

use std::sync::Arc;
use std::time::Duration;

use leasegate::audit::{AuditEventType, MemoryAuditSink};
use leasegate::error::AccessError;
use leasegate::lease::{BudgetAlert, ConsumeOutcome, LeaseError, LeaseManager, LeaseTerms};
use leasegate::policy::GovernanceMode;
use leasegate::store::{lease_key, MemoryStore, Store, StoreEntry};

use crate::common::FailingStore;

fn manager() -> (LeaseManager, Arc<MemoryStore>) {
    let store = Arc::new(MemoryStore::new());
    let manager = LeaseManager::new(store.clone(), ["search_tools"]);
    (manager, store)
}

fn terms(ttl_secs: u64, calls: u32) -> LeaseTerms {
    LeaseTerms::new(
        "A",
        "X",
        Duration::from_secs(ttl_secs),
        calls,
        GovernanceMode::Permission,
    )
}

#[tokio::test]
async fn three_call_budget_runs_out_on_the_fourth() {
    let (leases, _) = manager();
    leases.grant(terms(300, 3)).await.expect("grant");

    for expected in [2, 1, 0] {
        let outcome = leases.consume("A", "X").await.expect("consume");
        assert_eq!(outcome, ConsumeOutcome::Consumed { remaining: expected });
    }
    assert_eq!(
        leases.consume("A", "X").await.expect("consume"),
        ConsumeOutcome::Exhausted
    );
    assert!(matches!(
        leases.validate("A", "X").await,
        Err(LeaseError::BudgetExhausted)
    ));
}

#[tokio::test]
async fn regrant_replaces_the_budget() {
    let (leases, _) = manager();
    leases.grant(terms(300, 1)).await.expect("grant");
    leases.consume("A", "X").await.expect("consume");
    leases.grant(terms(300, 2)).await.expect("regrant");

    let lease = leases.validate("A", "X").await.expect("valid");
    assert_eq!(lease.calls_remaining, 2);
    assert_eq!(lease.initial_calls, 2);
}

#[tokio::test]
async fn leases_are_per_client_and_tool() {
    let (leases, _) = manager();
    leases.grant(terms(300, 1)).await.expect("grant");

    assert!(matches!(
        leases.validate("B", "X").await,
        Err(LeaseError::NotFound)
    ));
    assert!(matches!(
        leases.validate("A", "Y").await,
        Err(LeaseError::NotFound)
    ));
    assert_eq!(
        leases.consume("B", "X").await.expect("consume"),
        ConsumeOutcome::Missing
    );
}

#[tokio::test]
async fn ids_containing_separators_do_not_share_a_lease() {
    let (leases, _) = manager();
    leases
        .grant(LeaseTerms::new(
            "a",
            "b:c",
            Duration::from_secs(300),
            3,
            GovernanceMode::Permission,
        ))
        .await
        .expect("grant");

    assert!(matches!(
        leases.validate("a:b", "c").await,
        Err(LeaseError::NotFound)
    ));
    assert_eq!(
        leases.consume("a:b", "c").await.expect("consume"),
        ConsumeOutcome::Missing
    );
    let untouched = leases.validate("a", "b:c").await.expect("valid");
    assert_eq!(untouched.calls_remaining, 3);
}

#[tokio::test]
async fn record_under_another_pairs_key_is_not_honoured() {
    let (leases, store) = manager();
    let lease = leases.grant(terms(300, 2)).await.expect("grant");
    store
        .set(
            &lease_key("B", "X"),
            StoreEntry::counted(serde_json::to_string(&lease).expect("json"), 2),
            Some(Duration::from_secs(60)),
        )
        .await
        .expect("set");

    assert!(matches!(
        leases.validate("B", "X").await,
        Err(LeaseError::NotFound)
    ));
    assert!(leases.get("B", "X").await.expect("get").is_none());
}

// Store TTL and `expires_at` coincide, so natural expiry reads as missing.
#[tokio::test(start_paused = true)]
async fn lease_disappears_after_its_ttl() {
    let (leases, _) = manager();
    leases.grant(terms(10, 5)).await.expect("grant");
    tokio::time::advance(Duration::from_secs(11)).await;

    assert!(matches!(
        leases.validate("A", "X").await,
        Err(LeaseError::NotFound)
    ));
    assert_eq!(
        leases.consume("A", "X").await.expect("consume"),
        ConsumeOutcome::Missing
    );
}

#[tokio::test]
async fn record_past_its_expiry_is_reported_expired() {
    let (leases, store) = manager();
    let mut lease = leases.grant(terms(300, 2)).await.expect("grant");
    lease.expires_at = chrono::Utc::now() - chrono::Duration::seconds(5);
    store
        .set(
            &lease_key("A", "X"),
            StoreEntry::counted(serde_json::to_string(&lease).expect("json"), 2),
            Some(Duration::from_secs(60)),
        )
        .await
        .expect("set");

    assert!(matches!(
        leases.validate("A", "X").await,
        Err(LeaseError::Expired)
    ));
}

#[tokio::test]
async fn revoke_is_idempotent() {
    let audit = Arc::new(MemoryAuditSink::new());
    let (leases, _) = manager();
    let leases = leases.with_audit(audit.clone());
    leases.grant(terms(300, 1)).await.expect("grant");

    leases.revoke("A", "X").await.expect("first revoke");
    leases.revoke("A", "X").await.expect("second revoke");
    leases.revoke("nobody", "nothing").await.expect("never granted");
    assert!(leases.get("A", "X").await.expect("get").is_none());

    let revoked = audit.of_type(AuditEventType::LeaseRevoked);
    assert_eq!(revoked.len(), 3);
    assert_eq!(revoked[0]["client_id"], "A");
    assert_eq!(revoked[0]["tool_id"], "X");
    assert_eq!(revoked[0]["existed"], true);
    assert_eq!(revoked[1]["existed"], false);
    assert_eq!(revoked[2]["existed"], false);
}

#[tokio::test]
async fn corrupt_record_fails_closed() {
    let (leases, store) = manager();
    store
        .set(&lease_key("A", "X"), StoreEntry::counted("{not json", 3), None)
        .await
        .expect("set");

    let err = leases.validate("A", "X").await.expect_err("corrupt");
    assert_eq!(err.access_error(), AccessError::StoreUnavailable);
}

#[tokio::test]
async fn unreachable_store_is_a_denial_not_a_grant() {
    let leases = LeaseManager::new(Arc::new(FailingStore::default()), Vec::<String>::new());

    let err = leases.validate("A", "X").await.expect_err("must deny");
    assert_eq!(err.access_error(), AccessError::StoreUnavailable);
    assert!(leases.consume("A", "X").await.is_err());
    assert!(leases.grant(terms(300, 1)).await.is_err());
    assert!(leases.revoke("A", "X").await.is_err());
}

#[tokio::test]
async fn snapshot_reports_budget_alert() {
    let (leases, _) = manager();
    leases.grant(terms(300, 10)).await.expect("grant");
    for _ in 0..7 {
        leases.consume("A", "X").await.expect("consume");
    }
    let lease = leases.validate("A", "X").await.expect("valid");
    assert_eq!(lease.calls_remaining, 3);
    assert_eq!(lease.budget_alert(), BudgetAlert::Elevated);
}

#[test]
fn bootstrap_tools_are_recognised() {
    let (leases, _) = manager();
    assert!(leases.is_bootstrap("search_tools"));
    assert!(!leases.is_bootstrap("write_file"));
}
