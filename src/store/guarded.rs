//! Timeout and bounded-retry wrapper around any [`Store`].
//!
//! Every call is bounded by [`RetryPolicy::op_timeout`]. Only errors that
//! guarantee the operation was not applied ([`StoreError::is_retryable`]) are
//! retried, with exponential backoff. A timeout is never retried: the
//! operation may or may not have landed, and retrying a decrement could
//! double-spend a call.

use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use async_trait::async_trait;
use rand::Rng;
use tracing::warn;

use super::{Decrement, Store, StoreEntry, StoreError};

type StoreFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T, StoreError>> + Send + 'a>>;

/// Timeout and retry settings for [`GuardedStore`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Upper bound on a single attempt.
    pub op_timeout: Duration,
    /// Extra attempts after the first for retryable errors.
    pub max_retries: u32,
    /// Delay before the first retry; doubles for each subsequent one.
    pub backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            op_timeout: Duration::from_millis(2000),
            max_retries: 2,
            backoff: Duration::from_millis(50),
        }
    }
}

impl RetryPolicy {
    fn delay_for(&self, attempt: u32) -> Duration {
        self.backoff
            .saturating_mul(2_u32.saturating_pow(attempt))
    }
}

/// Add up to a quarter of `delay` so retrying instances spread out.
fn jittered(delay: Duration) -> Duration {
    let max_extra = u64::try_from(delay.as_millis() / 4).unwrap_or(0);
    if max_extra == 0 {
        return delay;
    }
    let extra = rand::thread_rng().gen_range(0..=max_extra);
    delay.saturating_add(Duration::from_millis(extra))
}

/// A [`Store`] that bounds and retries calls to an inner store.
#[derive(Debug)]
pub struct GuardedStore<S> {
    inner: S,
    policy: RetryPolicy,
}

impl<S: Store> GuardedStore<S> {
    /// Wrap `inner` with `policy`.
    pub fn new(inner: S, policy: RetryPolicy) -> Self {
        Self { inner, policy }
    }

    /// The wrapped store.
    pub fn inner(&self) -> &S {
        &self.inner
    }

    async fn run<'a, T, F>(&self, op: &'static str, mut call: F) -> Result<T, StoreError>
    where
        F: FnMut() -> StoreFuture<'a, T> + Send,
        T: Send,
    {
        let mut attempt: u32 = 0;
        loop {
            match tokio::time::timeout(self.policy.op_timeout, call()).await {
                Err(_) => {
                    warn!(op, timeout_ms = ?self.policy.op_timeout, "store call timed out");
                    return Err(StoreError::Unavailable(format!(
                        "{op} timed out after {:?}",
                        self.policy.op_timeout
                    )));
                }
                Ok(Ok(value)) => return Ok(value),
                Ok(Err(err)) if err.is_retryable() && attempt < self.policy.max_retries => {
                    let delay = jittered(self.policy.delay_for(attempt));
                    warn!(op, attempt, error = %err, delay_ms = ?delay, "retrying store call");
                    tokio::time::sleep(delay).await;
                    attempt = attempt.saturating_add(1);
                }
                Ok(Err(err)) if err.is_retryable() => {
                    return Err(StoreError::Unavailable(format!(
                        "{op} failed after {} attempts: {err}",
                        attempt.saturating_add(1)
                    )));
                }
                Ok(Err(err)) => return Err(err),
            }
        }
    }
}

#[async_trait]
impl<S: Store> Store for GuardedStore<S> {
    async fn set(
        &self,
        key: &str,
        entry: StoreEntry,
        ttl: Option<Duration>,
    ) -> Result<(), StoreError> {
        let inner = &self.inner;
        self.run("set", move || inner.set(key, entry.clone(), ttl))
            .await
    }

    async fn set_if_absent(
        &self,
        key: &str,
        entry: StoreEntry,
        ttl: Option<Duration>,
    ) -> Result<bool, StoreError> {
        let inner = &self.inner;
        self.run("set_if_absent", move || {
            inner.set_if_absent(key, entry.clone(), ttl)
        })
        .await
    }

    async fn get(&self, key: &str) -> Result<Option<StoreEntry>, StoreError> {
        let inner = &self.inner;
        self.run("get", move || inner.get(key)).await
    }

    async fn exists(&self, key: &str) -> Result<bool, StoreError> {
        let inner = &self.inner;
        self.run("exists", move || inner.exists(key)).await
    }

    async fn delete(&self, key: &str) -> Result<bool, StoreError> {
        let inner = &self.inner;
        self.run("delete", move || inner.delete(key)).await
    }

    async fn decrement_if_positive(&self, key: &str) -> Result<Decrement, StoreError> {
        let inner = &self.inner;
        self.run("decrement_if_positive", move || {
            inner.decrement_if_positive(key)
        })
        .await
    }

    async fn delete_prefix(&self, prefix: &str) -> Result<u64, StoreError> {
        let inner = &self.inner;
        self.run("delete_prefix", move || inner.delete_prefix(prefix))
            .await
    }

    async fn purge_expired(&self) -> Result<u64, StoreError> {
        let inner = &self.inner;
        self.run("purge_expired", move || inner.purge_expired())
            .await
    }
}
