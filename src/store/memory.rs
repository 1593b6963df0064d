//! In-process store backed by `DashMap`.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::{SharedStore, StoreError};
use crate::clock::{Clock, SystemClock};

#[derive(Debug, Clone)]
struct MemoryEntry {
    value: String,
    expires_at: DateTime<Utc>,
}

impl MemoryEntry {
    fn is_live(&self, now: DateTime<Utc>) -> bool {
        now < self.expires_at
    }
}

/// A store that lives inside one process.
///
/// Expiry is measured against the injected clock, so a `ManualClock` lets
/// tests age out leases and buckets without sleeping.
pub struct MemoryStore {
    prefix: String,
    entries: DashMap<String, MemoryEntry>,
    clock: Arc<dyn Clock>,
}

impl MemoryStore {
    /// Create an empty store on the system clock.
    pub fn new(prefix: &str) -> Self {
        Self::with_clock(prefix, Arc::new(SystemClock))
    }

    /// Create an empty store on the given clock.
    pub fn with_clock(prefix: &str, clock: Arc<dyn Clock>) -> Self {
        Self {
            prefix: prefix.to_string(),
            entries: DashMap::new(),
            clock,
        }
    }

    /// Number of records, live or not yet purged.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Drop every expired record and return how many were removed.
    pub fn purge_expired(&self) -> usize {
        let now = self.clock.now();
        let before = self.entries.len();
        self.entries.retain(|_, entry| entry.is_live(now));
        let removed = before.saturating_sub(self.entries.len());
        debug!(removed = removed, "Purged expired store entries");
        removed
    }

    /// Periodically purge expired records until `shutdown` fires.
    pub fn spawn_janitor(
        self: Arc<Self>,
        interval: Duration,
        shutdown: CancellationToken,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = ticker.tick() => {
                        self.purge_expired();
                    }
                }
            }
        })
    }

    fn expiry(&self, ttl: Duration) -> DateTime<Utc> {
        let now = self.clock.now();
        chrono::Duration::from_std(ttl)
            .ok()
            .and_then(|ttl| now.checked_add_signed(ttl))
            .unwrap_or(DateTime::<Utc>::MAX_UTC)
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new("")
    }
}

#[async_trait]
impl SharedStore for MemoryStore {
    fn prefix(&self) -> &str {
        &self.prefix
    }

    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        let now = self.clock.now();
        Ok(self
            .entries
            .get(key)
            .filter(|entry| entry.is_live(now))
            .map(|entry| entry.value.clone()))
    }

    async fn set(&self, key: &str, value: &str, ttl: Duration) -> Result<(), StoreError> {
        let entry = MemoryEntry {
            value: value.to_string(),
            expires_at: self.expiry(ttl),
        };
        self.entries.insert(key.to_string(), entry);
        Ok(())
    }

    async fn set_if_absent(
        &self,
        key: &str,
        value: &str,
        ttl: Duration,
    ) -> Result<bool, StoreError> {
        let now = self.clock.now();
        let entry = MemoryEntry {
            value: value.to_string(),
            expires_at: self.expiry(ttl),
        };

        // The shard lock held by `entry` makes check-and-insert atomic.
        match self.entries.entry(key.to_string()) {
            Entry::Occupied(mut occupied) => {
                if occupied.get().is_live(now) {
                    Ok(false)
                } else {
                    occupied.insert(entry);
                    Ok(true)
                }
            }
            Entry::Vacant(vacant) => {
                vacant.insert(entry);
                Ok(true)
            }
        }
    }

    async fn delete_if_equals(&self, key: &str, expected: &str) -> Result<bool, StoreError> {
        let now = self.clock.now();
        Ok(self
            .entries
            .remove_if(key, |_, entry| entry.is_live(now) && entry.value == expected)
            .is_some())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;

    fn store_with_clock() -> (MemoryStore, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::default());
        (MemoryStore::with_clock("test", clock.clone()), clock)
    }

    #[tokio::test]
    async fn test_get_missing() {
        let (store, _) = store_with_clock();
        assert!(store.get("nope").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_set_then_get() {
        let (store, _) = store_with_clock();
        store.set("k", "v", Duration::from_secs(5)).await.unwrap();
        assert_eq!(store.get("k").await.unwrap().as_deref(), Some("v"));
        assert_eq!(store.prefix(), "test");
    }

    #[tokio::test]
    async fn test_entries_expire_with_clock() {
        let (store, clock) = store_with_clock();
        store.set("k", "v", Duration::from_secs(5)).await.unwrap();

        clock.advance(Duration::from_secs(4));
        assert!(store.get("k").await.unwrap().is_some());

        clock.advance(Duration::from_secs(1));
        assert!(store.get("k").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_set_if_absent() {
        let (store, clock) = store_with_clock();

        assert!(store.set_if_absent("lock", "a", Duration::from_secs(1)).await.unwrap());
        assert!(!store.set_if_absent("lock", "b", Duration::from_secs(1)).await.unwrap());
        assert_eq!(store.get("lock").await.unwrap().as_deref(), Some("a"));

        // An expired record no longer blocks the write
        clock.advance(Duration::from_secs(1));
        assert!(store.set_if_absent("lock", "b", Duration::from_secs(1)).await.unwrap());
        assert_eq!(store.get("lock").await.unwrap().as_deref(), Some("b"));
    }

    #[tokio::test]
    async fn test_delete_if_equals() {
        let (store, _) = store_with_clock();
        store.set("lock", "a", Duration::from_secs(1)).await.unwrap();

        assert!(!store.delete_if_equals("lock", "b").await.unwrap());
        assert!(store.get("lock").await.unwrap().is_some());

        assert!(store.delete_if_equals("lock", "a").await.unwrap());
        assert!(store.get("lock").await.unwrap().is_none());

        assert!(!store.delete_if_equals("lock", "a").await.unwrap());
    }

    #[tokio::test]
    async fn test_purge_expired() {
        let (store, clock) = store_with_clock();
        store.set("short", "v", Duration::from_secs(1)).await.unwrap();
        store.set("long", "v", Duration::from_secs(60)).await.unwrap();
        assert_eq!(store.len(), 2);

        clock.advance(Duration::from_secs(2));
        assert_eq!(store.purge_expired(), 1);
        assert_eq!(store.len(), 1);
        assert!(store.get("long").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_janitor_stops_on_shutdown() {
        let (store, clock) = store_with_clock();
        let store = Arc::new(store);
        store.set("k", "v", Duration::from_millis(10)).await.unwrap();
        clock.advance(Duration::from_secs(1));

        let shutdown = CancellationToken::new();
        let handle = store
            .clone()
            .spawn_janitor(Duration::from_millis(5), shutdown.clone());

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(store.is_empty());

        shutdown.cancel();
        handle.await.unwrap();
    }
}
