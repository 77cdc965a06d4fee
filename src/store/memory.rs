//! In-process [`Store`] backend.
//!
//! Holds entries in a mutex-guarded map with expiry measured on
//! [`tokio::time::Instant`], so tests running on a paused clock can advance
//! past TTLs deterministically. Only consistent within one process: use
//! [`SqliteStore`](super::SqliteStore) when several instances share state.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::Instant;

use super::{Decrement, Store, StoreEntry, StoreError};

#[derive(Debug, Clone)]
struct Slot {
    entry: StoreEntry,
    expires_at: Option<Instant>,
}

impl Slot {
    fn is_live(&self, now: Instant) -> bool {
        self.expires_at.map_or(true, |at| at > now)
    }
}

/// Mutex-guarded map with TTL expiry.
///
/// Uses a sync [`Mutex`] since no critical section awaits.
#[derive(Debug, Default)]
pub struct MemoryStore {
    slots: Mutex<HashMap<String, Slot>>,
}

impl MemoryStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of physically held entries, live or expired.
    pub fn raw_len(&self) -> usize {
        self.lock().map(|slots| slots.len()).unwrap_or(0)
    }

    fn lock(&self) -> Result<MutexGuard<'_, HashMap<String, Slot>>, StoreError> {
        self.slots
            .lock()
            .map_err(|e| StoreError::Unavailable(format!("memory store lock poisoned: {e}")))
    }
}

fn deadline(now: Instant, ttl: Option<Duration>) -> Option<Instant> {
    ttl.map(|ttl| now.checked_add(ttl).unwrap_or(now))
}

#[async_trait]
impl Store for MemoryStore {
    async fn set(
        &self,
        key: &str,
        entry: StoreEntry,
        ttl: Option<Duration>,
    ) -> Result<(), StoreError> {
        let now = Instant::now();
        let mut slots = self.lock()?;
        slots.insert(
            key.to_owned(),
            Slot {
                entry,
                expires_at: deadline(now, ttl),
            },
        );
        Ok(())
    }

    async fn set_if_absent(
        &self,
        key: &str,
        entry: StoreEntry,
        ttl: Option<Duration>,
    ) -> Result<bool, StoreError> {
        let now = Instant::now();
        let mut slots = self.lock()?;
        if slots.get(key).is_some_and(|slot| slot.is_live(now)) {
            return Ok(false);
        }
        slots.insert(
            key.to_owned(),
            Slot {
                entry,
                expires_at: deadline(now, ttl),
            },
        );
        Ok(true)
    }

    async fn get(&self, key: &str) -> Result<Option<StoreEntry>, StoreError> {
        let now = Instant::now();
        let mut slots = self.lock()?;
        match slots.get(key) {
            Some(slot) if slot.is_live(now) => Ok(Some(slot.entry.clone())),
            Some(_) => {
                slots.remove(key);
                Ok(None)
            }
            None => Ok(None),
        }
    }

    async fn exists(&self, key: &str) -> Result<bool, StoreError> {
        Ok(self.get(key).await?.is_some())
    }

    async fn delete(&self, key: &str) -> Result<bool, StoreError> {
        let now = Instant::now();
        let mut slots = self.lock()?;
        Ok(slots.remove(key).is_some_and(|slot| slot.is_live(now)))
    }

    async fn decrement_if_positive(&self, key: &str) -> Result<Decrement, StoreError> {
        let now = Instant::now();
        let mut slots = self.lock()?;
        let Some(slot) = slots.get_mut(key) else {
            return Ok(Decrement::Missing);
        };
        if !slot.is_live(now) {
            slots.remove(key);
            return Ok(Decrement::Missing);
        }
        match slot.entry.counter {
            Some(count) if count > 0 => {
                let remaining = count.saturating_sub(1);
                slot.entry.counter = Some(remaining);
                Ok(Decrement::Applied { remaining })
            }
            _ => Ok(Decrement::Exhausted),
        }
    }

    async fn delete_prefix(&self, prefix: &str) -> Result<u64, StoreError> {
        let now = Instant::now();
        let mut slots = self.lock()?;
        let mut removed: u64 = 0;
        slots.retain(|key, slot| {
            if key.starts_with(prefix) {
                if slot.is_live(now) {
                    removed = removed.saturating_add(1);
                }
                false
            } else {
                true
            }
        });
        Ok(removed)
    }

    async fn purge_expired(&self) -> Result<u64, StoreError> {
        let now = Instant::now();
        let mut slots = self.lock()?;
        let before = slots.len();
        slots.retain(|_, slot| slot.is_live(now));
        let purged = before.saturating_sub(slots.len());
        Ok(u64::try_from(purged).unwrap_or(u64::MAX))
    }
}
