//! Concurrent consumption against one budget, across shared stores.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use leasegate::lease::{ConsumeOutcome, LeaseManager, LeaseTerms};
use leasegate::policy::GovernanceMode;
use leasegate::store::{MemoryStore, SqliteStore, Store};

fn terms(calls: u32) -> LeaseTerms {
    LeaseTerms::new(
        "A",
        "X",
        Duration::from_secs(300),
        calls,
        GovernanceMode::Permission,
    )
}

/// Race `callers` consumers against a budget of `budget` and return how many
/// consumes succeeded.
async fn race(store: Arc<dyn Store>, budget: u32, callers: usize) -> usize {
    let leases = LeaseManager::new(store, Vec::<String>::new());
    leases.grant(terms(budget)).await.expect("grant");

    let wins = Arc::new(AtomicUsize::new(0));
    let mut handles = Vec::with_capacity(callers);
    for _ in 0..callers {
        let leases = leases.clone();
        let wins = Arc::clone(&wins);
        handles.push(tokio::spawn(async move {
            if leases.consume("A", "X").await.expect("consume").is_consumed() {
                wins.fetch_add(1, Ordering::SeqCst);
            }
        }));
    }
    for handle in handles {
        handle.await.expect("task");
    }
    wins.load(Ordering::SeqCst)
}

#[tokio::test(flavor = "multi_thread", worker_threads = 8)]
async fn memory_store_never_overspends() {
    for (budget, callers) in [(1, 16), (5, 40), (20, 20), (3, 100)] {
        let wins = race(Arc::new(MemoryStore::new()), budget, callers).await;
        let expected = usize::try_from(budget).expect("fits").min(callers);
        assert_eq!(wins, expected, "budget {budget} with {callers} callers");
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 8)]
async fn sqlite_store_never_overspends() {
    let dir = tempfile::tempdir().expect("tempdir");
    let store = SqliteStore::connect(&dir.path().join("leases.db"))
        .await
        .expect("connect");
    let wins = race(Arc::new(store), 5, 40).await;
    assert_eq!(wins, 5);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn two_instances_share_one_sqlite_budget() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("shared.db");
    let first = LeaseManager::new(
        Arc::new(SqliteStore::connect(&path).await.expect("connect")),
        Vec::<String>::new(),
    );
    let second = LeaseManager::new(
        Arc::new(SqliteStore::connect(&path).await.expect("connect")),
        Vec::<String>::new(),
    );
    first.grant(terms(3)).await.expect("grant");

    let mut consumed = 0;
    for manager in [&first, &second, &first, &second, &second] {
        if manager.consume("A", "X").await.expect("consume").is_consumed() {
            consumed += 1;
        }
    }
    assert_eq!(consumed, 3);
    assert!(second.validate("A", "X").await.is_err());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn regrant_racing_consumes_never_double_spends() {
    let store: Arc<dyn Store> = Arc::new(MemoryStore::new());
    let leases = LeaseManager::new(store, Vec::<String>::new());
    leases.grant(terms(2)).await.expect("grant");

    let consumer = {
        let leases = leases.clone();
        tokio::spawn(async move {
            let mut outcomes = Vec::new();
            for _ in 0..10 {
                outcomes.push(leases.consume("A", "X").await.expect("consume"));
                tokio::task::yield_now().await;
            }
            outcomes
        })
    };
    leases.grant(terms(2)).await.expect("regrant");
    let outcomes = consumer.await.expect("task");

    let consumed = outcomes.iter().filter(|o| o.is_consumed()).count();
    // Both budgets together are the most that can ever be spent.
    assert!(consumed <= 4, "consumed {consumed}");
    for outcome in &outcomes {
        assert!(!matches!(outcome, ConsumeOutcome::Missing));
    }
}
