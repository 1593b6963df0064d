//! Bucket state persistence.

use std::sync::Arc;
use std::time::Duration;
use tracing::trace;

use super::bucket::BucketState;
use crate::store::{SharedStore, StoreError};

/// Address of one bucket in the shared store: `<prefix>:<limiter>:<key>`.
pub fn bucket_address(prefix: &str, limiter: &str, key: &str) -> String {
    format!("{}:{}:{}", prefix, limiter, key)
}

/// Loads and saves [`BucketState`] records as JSON.
///
/// There is no compare-and-swap here; callers hold the limiter's lock around
/// every load-compute-save cycle.
#[derive(Clone)]
pub struct BucketStore {
    store: Arc<dyn SharedStore>,
}

impl BucketStore {
    pub fn new(store: Arc<dyn SharedStore>) -> Self {
        Self { store }
    }

    /// The backing store's namespace prefix.
    pub fn prefix(&self) -> &str {
        self.store.prefix()
    }

    /// Load the state at `address`, or `None` if it was never written or has expired.
    pub async fn load(&self, address: &str) -> Result<Option<BucketState>, StoreError> {
        let Some(json) = self.store.get(address).await? else {
            trace!(address = %address, "No stored bucket state");
            return Ok(None);
        };
        let state = serde_json::from_str(&json)?;
        Ok(Some(state))
    }

    /// Persist `state`, expiring it after `ttl` of inactivity.
    pub async fn save(
        &self,
        address: &str,
        state: &BucketState,
        ttl: Duration,
    ) -> Result<(), StoreError> {
        let json = serde_json::to_string(state)?;
        self.store.set(address, &json, ttl).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::{Clock, ManualClock};
    use crate::store::MemoryStore;
    use chrono::Utc;

    #[test]
    fn test_bucket_address() {
        assert_eq!(
            bucket_address("email", "verification", "10.0.0.1"),
            "email:verification:10.0.0.1"
        );
        assert_eq!(bucket_address("", "comments", "user-1"), ":comments:user-1");
    }

    #[tokio::test]
    async fn test_load_missing() {
        let buckets = BucketStore::new(Arc::new(MemoryStore::new("test")));
        assert!(buckets.load("test:limiter:key").await.unwrap().is_none());
        assert_eq!(buckets.prefix(), "test");
    }

    #[tokio::test]
    async fn test_save_then_load() {
        let buckets = BucketStore::new(Arc::new(MemoryStore::new("test")));
        let state = BucketState {
            tokens: 1.5,
            last_refill_at: Utc::now(),
        };

        buckets
            .save("test:limiter:key", &state, Duration::from_secs(60))
            .await
            .unwrap();

        let loaded = buckets.load("test:limiter:key").await.unwrap().unwrap();
        assert_eq!(loaded, state);
    }

    #[tokio::test]
    async fn test_saved_state_expires_after_ttl() {
        let clock = Arc::new(ManualClock::default());
        let buckets = BucketStore::new(Arc::new(MemoryStore::with_clock("test", clock.clone())));
        let state = BucketState::full(3, clock.now());

        buckets
            .save("test:limiter:key", &state, Duration::from_secs(3))
            .await
            .unwrap();

        clock.advance(Duration::from_secs(3));
        assert!(buckets.load("test:limiter:key").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_corrupt_state_is_an_error() {
        let store = Arc::new(MemoryStore::new("test"));
        store
            .set("test:limiter:key", "not json", Duration::from_secs(60))
            .await
            .unwrap();

        let buckets = BucketStore::new(store);
        let err = buckets.load("test:limiter:key").await.unwrap_err();
        assert!(matches!(err, StoreError::Serialization(_)));
    }
}
