//! Governance mode: persistence, defaults, cache staleness, failure.

use std::sync::Arc;
use std::time::Duration;

use leasegate::audit::{AuditEventType, MemoryAuditSink, NullAuditSink};
use leasegate::error::AccessError;
use leasegate::governance::{GovernanceError, GovernanceState};
use leasegate::policy::GovernanceMode;
use leasegate::store::{MemoryStore, Store, StoreEntry};

use crate::common::FailingStore;

const MODE_KEY: &str = "governance:mode";

fn state(store: Arc<dyn Store>, cache: Duration) -> GovernanceState {
    GovernanceState::new(
        store,
        Arc::new(NullAuditSink),
        GovernanceMode::Permission,
        cache,
    )
}

#[tokio::test]
async fn unset_mode_is_initialised_to_the_default() {
    let store: Arc<dyn Store> = Arc::new(MemoryStore::new());
    let governance = state(Arc::clone(&store), Duration::ZERO);

    assert_eq!(
        governance.get_mode().await.expect("mode"),
        GovernanceMode::Permission
    );
    let stored = store.get(MODE_KEY).await.expect("get").expect("written");
    assert_eq!(stored.value, "permission");
}

#[tokio::test]
async fn set_mode_is_audited() {
    let audit = Arc::new(MemoryAuditSink::new());
    let governance = GovernanceState::new(
        Arc::new(MemoryStore::new()),
        audit.clone(),
        GovernanceMode::Permission,
        Duration::ZERO,
    );
    governance
        .set_mode(GovernanceMode::ReadOnly)
        .await
        .expect("set");

    let events = audit.of_type(AuditEventType::ModeChanged);
    assert_eq!(events.len(), 1);
    assert_eq!(events[0]["to"], "read_only");
}

#[tokio::test(start_paused = true)]
async fn other_instance_sees_change_within_one_second() {
    let store: Arc<dyn Store> = Arc::new(MemoryStore::new());
    let writer = state(Arc::clone(&store), Duration::from_secs(1));
    let reader = state(Arc::clone(&store), Duration::from_secs(1));

    assert_eq!(
        reader.get_mode().await.expect("mode"),
        GovernanceMode::Permission
    );
    writer
        .set_mode(GovernanceMode::ReadOnly)
        .await
        .expect("set");

    // Inside the cache window the reader may still answer from cache.
    tokio::time::advance(Duration::from_millis(500)).await;
    let early = reader.get_mode().await.expect("mode");
    assert!(matches!(
        early,
        GovernanceMode::Permission | GovernanceMode::ReadOnly
    ));

    tokio::time::advance(Duration::from_millis(501)).await;
    assert_eq!(
        reader.get_mode().await.expect("mode"),
        GovernanceMode::ReadOnly
    );
}

#[test]
fn cache_window_is_clamped_to_one_second() {
    let governance = state(Arc::new(MemoryStore::new()), Duration::from_secs(30));
    assert_eq!(governance.cache_ttl(), Duration::from_secs(1));
}

#[tokio::test]
async fn unreachable_store_is_an_error_not_a_mode() {
    let governance = state(Arc::new(FailingStore::default()), Duration::ZERO);
    let err = governance.get_mode().await.expect_err("must fail");
    assert_eq!(err.access_error(), AccessError::StoreUnavailable);
}

#[tokio::test]
async fn corrupt_mode_is_an_error_not_a_fallback() {
    let store: Arc<dyn Store> = Arc::new(MemoryStore::new());
    store
        .set(MODE_KEY, StoreEntry::plain("yolo"), None)
        .await
        .expect("set");
    let governance = state(store, Duration::ZERO);

    assert!(matches!(
        governance.get_mode().await,
        Err(GovernanceError::CorruptMode(_))
    ));
}
