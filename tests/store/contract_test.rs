//! Behaviour every backend must share.

use std::sync::Arc;
use std::time::Duration;

use leasegate::store::{
    Decrement, GuardedStore, MemoryStore, RetryPolicy, SqliteStore, Store, StoreEntry, StoreError,
};

use crate::common::FailingStore;

async fn backends() -> Vec<(&'static str, Arc<dyn Store>)> {
    let memory: Arc<dyn Store> = Arc::new(MemoryStore::new());
    let sqlite: Arc<dyn Store> = Arc::new(SqliteStore::in_memory().await.expect("sqlite"));
    vec![("memory", memory), ("sqlite", sqlite)]
}

#[tokio::test]
async fn set_get_overwrite_delete() {
    for (name, store) in backends().await {
        store
            .set("k", StoreEntry::counted("v1", 3), None)
            .await
            .expect("set");
        let entry = store.get("k").await.expect("get").expect("present");
        assert_eq!(entry.value, "v1", "{name}");
        assert_eq!(entry.counter, Some(3), "{name}");

        store
            .set("k", StoreEntry::plain("v2"), None)
            .await
            .expect("overwrite");
        let entry = store.get("k").await.expect("get").expect("present");
        assert_eq!(entry.value, "v2", "{name}");
        assert_eq!(entry.counter, None, "{name}");

        assert!(store.delete("k").await.expect("delete"), "{name}");
        assert!(!store.delete("k").await.expect("delete again"), "{name}");
        assert!(!store.exists("k").await.expect("exists"), "{name}");
    }
}

#[tokio::test]
async fn set_if_absent_only_once() {
    for (name, store) in backends().await {
        assert!(store
            .set_if_absent("n", StoreEntry::plain("a"), None)
            .await
            .expect("first"));
        assert!(
            !store
                .set_if_absent("n", StoreEntry::plain("b"), None)
                .await
                .expect("second"),
            "{name}"
        );
        assert_eq!(
            store.get("n").await.expect("get").expect("present").value,
            "a",
            "{name}"
        );
    }
}

#[tokio::test]
async fn decrement_stops_at_zero() {
    for (name, store) in backends().await {
        store
            .set("c", StoreEntry::counted("x", 2), None)
            .await
            .expect("set");
        assert_eq!(
            store.decrement_if_positive("c").await.expect("dec"),
            Decrement::Applied { remaining: 1 },
            "{name}"
        );
        assert_eq!(
            store.decrement_if_positive("c").await.expect("dec"),
            Decrement::Applied { remaining: 0 },
            "{name}"
        );
        assert_eq!(
            store.decrement_if_positive("c").await.expect("dec"),
            Decrement::Exhausted,
            "{name}"
        );
        assert_eq!(
            store.decrement_if_positive("missing").await.expect("dec"),
            Decrement::Missing,
            "{name}"
        );
    }
}

#[tokio::test]
async fn prefix_delete_is_scoped() {
    for (name, store) in backends().await {
        for key in ["elevation:a", "elevation:b", "lease:A:X"] {
            store
                .set(key, StoreEntry::plain("1"), None)
                .await
                .expect("set");
        }
        assert_eq!(
            store.delete_prefix("elevation:").await.expect("prefix"),
            2,
            "{name}"
        );
        assert!(store.exists("lease:A:X").await.expect("exists"), "{name}");
    }
}

#[tokio::test]
async fn sqlite_expiry_hides_entries() {
    let store = SqliteStore::in_memory().await.expect("sqlite");
    store
        .set("t", StoreEntry::counted("x", 1), Some(Duration::from_millis(20)))
        .await
        .expect("set");
    assert!(store.exists("t").await.expect("exists"));

    tokio::time::sleep(Duration::from_millis(60)).await;
    assert!(!store.exists("t").await.expect("exists"));
    assert_eq!(
        store.decrement_if_positive("t").await.expect("dec"),
        Decrement::Missing
    );
    assert!(store
        .set_if_absent("t", StoreEntry::plain("fresh"), None)
        .await
        .expect("reclaim expired key"));
    assert_eq!(store.purge_expired().await.expect("purge"), 0);
}

#[tokio::test]
async fn sqlite_purge_removes_expired_rows() {
    let store = SqliteStore::in_memory().await.expect("sqlite");
    for key in ["a", "b"] {
        store
            .set(key, StoreEntry::plain("x"), Some(Duration::from_millis(10)))
            .await
            .expect("set");
    }
    store
        .set("keep", StoreEntry::plain("x"), None)
        .await
        .expect("set");
    tokio::time::sleep(Duration::from_millis(40)).await;
    assert_eq!(store.purge_expired().await.expect("purge"), 2);
    assert!(store.exists("keep").await.expect("exists"));
}

#[tokio::test(start_paused = true)]
async fn guard_retries_connection_failures_then_gives_up() {
    let failing = FailingStore::default();
    let guarded = GuardedStore::new(
        failing,
        RetryPolicy {
            op_timeout: Duration::from_millis(100),
            max_retries: 2,
            backoff: Duration::from_millis(10),
        },
    );

    let err = guarded.exists("k").await.expect_err("gives up");
    assert!(matches!(err, StoreError::Unavailable(_)));
    assert_eq!(
        guarded
            .inner()
            .calls
            .load(std::sync::atomic::Ordering::SeqCst),
        3
    );
}
