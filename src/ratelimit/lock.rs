//! Distributed lock over the shared store.
//!
//! A lock is a lease record at `<limiter>:lock` holding a random holder
//! token. It is written with set-if-absent and a short TTL, so a holder that
//! crashes mid-update stops blocking everyone else once the lease expires.
//! Release is compare-and-delete on the token.

use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};
use uuid::Uuid;

use super::cancellable;
use crate::error::{KeyrateError, Result};
use crate::store::SharedStore;

/// Default lease lifetime; the holder is expected to release well before this.
pub const DEFAULT_LEASE_TTL: Duration = Duration::from_secs(1);
/// Default pause between acquisition attempts.
pub const DEFAULT_RETRY_STEP: Duration = Duration::from_millis(500);
/// Default number of retries after the first attempt.
pub const DEFAULT_MAX_RETRIES: u32 = 10;

/// Address of a limiter's lease record.
pub fn lock_address(limiter: &str) -> String {
    format!("{}:lock", limiter)
}

/// How long to keep trying for a contended lock.
///
/// Retries are spaced by a fixed `step`. The worst-case wait is therefore
/// `step * max_retries`, optionally cut short by `timeout`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub step: Duration,
    pub max_retries: u32,
    pub timeout: Option<Duration>,
}

impl RetryPolicy {
    /// Fixed-step retries with no overall timeout.
    pub fn linear(step: Duration, max_retries: u32) -> Self {
        Self {
            step,
            max_retries,
            timeout: None,
        }
    }

    /// Give up once `timeout` has passed, even if retries remain.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Total number of acquisition attempts, the first one included.
    pub fn max_attempts(&self) -> u32 {
        self.max_retries.saturating_add(1)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::linear(DEFAULT_RETRY_STEP, DEFAULT_MAX_RETRIES)
    }
}

/// Proof of holding a lock. Hand it back to [`DistributedLock::release`].
#[derive(Debug)]
pub struct Lease {
    resource: String,
    token: String,
}

impl Lease {
    /// The lease record's address.
    pub fn resource(&self) -> &str {
        &self.resource
    }

    /// This holder's token.
    pub fn token(&self) -> &str {
        &self.token
    }
}

/// Mutual exclusion on one named resource across processes.
pub struct DistributedLock {
    store: Arc<dyn SharedStore>,
    resource: String,
    ttl: Duration,
    retry: RetryPolicy,
}

impl DistributedLock {
    /// Create a lock for the named limiter.
    pub fn new(
        store: Arc<dyn SharedStore>,
        limiter: &str,
        ttl: Duration,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            store,
            resource: lock_address(limiter),
            ttl,
            retry,
        }
    }

    /// The lease record's address.
    pub fn resource(&self) -> &str {
        &self.resource
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        self.retry
    }

    /// Acquire the lock, retrying while another holder has it.
    ///
    /// Fails with [`KeyrateError::LockNotObtained`] once the retry policy is
    /// exhausted, and with [`KeyrateError::Cancelled`] as soon as `cancel`
    /// fires, whether mid round-trip or mid backoff.
    pub async fn acquire(&self, cancel: &CancellationToken) -> Result<Lease> {
        let token = Uuid::new_v4().to_string();
        let started = Instant::now();
        let mut attempts = 0;

        loop {
            attempts += 1;

            let obtained = cancellable(
                cancel,
                self.store.set_if_absent(&self.resource, &token, self.ttl),
            )
            .await?;

            if obtained {
                trace!(resource = %self.resource, attempts = attempts, "Lock acquired");
                return Ok(Lease {
                    resource: self.resource.clone(),
                    token,
                });
            }

            if attempts > self.retry.max_retries {
                break;
            }
            if let Some(timeout) = self.retry.timeout {
                if started.elapsed() + self.retry.step > timeout {
                    break;
                }
            }

            debug!(
                resource = %self.resource,
                attempt = attempts,
                step_ms = self.retry.step.as_millis() as u64,
                "Lock held elsewhere, backing off"
            );

            tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(KeyrateError::Cancelled),
                _ = tokio::time::sleep(self.retry.step) => {}
            }
        }

        Err(KeyrateError::LockNotObtained {
            resource: self.resource.clone(),
            attempts,
        })
    }

    /// Release a lease.
    ///
    /// Returns `Ok(false)` when the lease had already expired or been taken
    /// over; that is an expected race, not an error. Release ignores
    /// cancellation so a cancelled caller still frees the lock promptly.
    pub async fn release(&self, lease: Lease) -> Result<bool> {
        let released = self
            .store
            .delete_if_equals(&lease.resource, &lease.token)
            .await?;

        if released {
            trace!(resource = %lease.resource, "Lock released");
        } else {
            debug!(resource = %lease.resource, "Lease already expired or taken over");
        }
        Ok(released)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::store::MemoryStore;

    fn fast_retry(max_retries: u32) -> RetryPolicy {
        RetryPolicy::linear(Duration::from_millis(1), max_retries)
    }

    fn setup(retry: RetryPolicy) -> (DistributedLock, Arc<MemoryStore>, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::default());
        let store = Arc::new(MemoryStore::with_clock("test", clock.clone()));
        let lock = DistributedLock::new(store.clone(), "comments", DEFAULT_LEASE_TTL, retry);
        (lock, store, clock)
    }

    #[test]
    fn test_lock_address() {
        assert_eq!(lock_address("comments"), "comments:lock");
    }

    #[test]
    fn test_default_policy() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.step, Duration::from_millis(500));
        assert_eq!(policy.max_retries, 10);
        assert_eq!(policy.max_attempts(), 11);
        assert_eq!(policy.timeout, None);
    }

    #[tokio::test]
    async fn test_acquire_and_release() {
        let (lock, store, _) = setup(fast_retry(0));
        let cancel = CancellationToken::new();

        let lease = lock.acquire(&cancel).await.unwrap();
        assert_eq!(lease.resource(), "comments:lock");
        assert_eq!(
            store.get("comments:lock").await.unwrap().as_deref(),
            Some(lease.token())
        );

        assert!(lock.release(lease).await.unwrap());
        assert!(store.get("comments:lock").await.unwrap().is_none());

        // Free again
        let lease = lock.acquire(&cancel).await.unwrap();
        assert!(lock.release(lease).await.unwrap());
    }

    #[tokio::test]
    async fn test_contended_lock_not_obtained() {
        let (lock, store, _) = setup(fast_retry(3));
        store
            .set("comments:lock", "someone-else", DEFAULT_LEASE_TTL)
            .await
            .unwrap();

        let err = lock.acquire(&CancellationToken::new()).await.unwrap_err();
        assert!(err.is_lock_not_obtained());
        match err {
            KeyrateError::LockNotObtained { resource, attempts } => {
                assert_eq!(resource, "comments:lock");
                assert_eq!(attempts, 4);
            }
            other => panic!("unexpected error: {other}"),
        }

        // The foreign lease is untouched
        assert_eq!(
            store.get("comments:lock").await.unwrap().as_deref(),
            Some("someone-else")
        );
    }

    #[tokio::test]
    async fn test_expired_lease_can_be_taken() {
        let (lock, store, clock) = setup(fast_retry(0));
        store
            .set("comments:lock", "crashed-holder", DEFAULT_LEASE_TTL)
            .await
            .unwrap();

        assert!(lock.acquire(&CancellationToken::new()).await.is_err());

        clock.advance(DEFAULT_LEASE_TTL);
        let lease = lock.acquire(&CancellationToken::new()).await.unwrap();
        assert_ne!(lease.token(), "crashed-holder");
    }

    #[tokio::test]
    async fn test_release_after_takeover_is_benign() {
        let (lock, store, clock) = setup(fast_retry(0));
        let cancel = CancellationToken::new();

        let stale = lock.acquire(&cancel).await.unwrap();
        clock.advance(DEFAULT_LEASE_TTL);
        let current = lock.acquire(&cancel).await.unwrap();

        assert!(!lock.release(stale).await.unwrap());
        assert_eq!(
            store.get("comments:lock").await.unwrap().as_deref(),
            Some(current.token())
        );
        assert!(lock.release(current).await.unwrap());
    }

    #[tokio::test]
    async fn test_acquire_waits_for_release() {
        let (lock, store, _) = setup(RetryPolicy::linear(Duration::from_millis(5), 200));
        store
            .set("comments:lock", "holder", DEFAULT_LEASE_TTL)
            .await
            .unwrap();

        let releaser = {
            let store = store.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(20)).await;
                store.delete_if_equals("comments:lock", "holder").await.unwrap()
            })
        };

        let lease = lock.acquire(&CancellationToken::new()).await.unwrap();
        assert!(releaser.await.unwrap());
        assert!(lock.release(lease).await.unwrap());
    }

    #[tokio::test]
    async fn test_cancelled_before_acquire() {
        let (lock, _, _) = setup(fast_retry(10));
        let cancel = CancellationToken::new();
        cancel.cancel();

        let err = lock.acquire(&cancel).await.unwrap_err();
        assert!(matches!(err, KeyrateError::Cancelled));
    }

    #[tokio::test]
    async fn test_cancelled_during_backoff() {
        let (lock, store, _) = setup(RetryPolicy::linear(Duration::from_millis(10), 10_000));
        store
            .set("comments:lock", "holder", DEFAULT_LEASE_TTL)
            .await
            .unwrap();

        let cancel = CancellationToken::new();
        {
            let cancel = cancel.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(30)).await;
                cancel.cancel();
            });
        }

        let err = lock.acquire(&cancel).await.unwrap_err();
        assert!(matches!(err, KeyrateError::Cancelled));
        assert!(!err.is_lock_not_obtained());
    }

    #[tokio::test]
    async fn test_timeout_cuts_retries_short() {
        let policy = RetryPolicy::linear(Duration::from_millis(5), 10_000)
            .with_timeout(Duration::from_millis(40));
        let (lock, store, _) = setup(policy);
        store
            .set("comments:lock", "holder", DEFAULT_LEASE_TTL)
            .await
            .unwrap();

        match lock.acquire(&CancellationToken::new()).await.unwrap_err() {
            KeyrateError::LockNotObtained { attempts, .. } => assert!(attempts < 10_000),
            other => panic!("unexpected error: {other}"),
        }
    }
}
