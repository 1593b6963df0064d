//! Per-key token-bucket limiter shared by every process on the same store.

use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use super::bucket::{self, BucketState};
use super::cancellable;
use super::lock::{DistributedLock, Lease, RetryPolicy, DEFAULT_LEASE_TTL};
use super::state::{bucket_address, BucketStore};
use crate::clock::{Clock, SystemClock};
use crate::config::LockConfig;
use crate::error::{KeyrateError, Result};
use crate::store::SharedStore;

/// Result of a rate limit check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Decision {
    pub allowed: bool,
    /// How long until the next token; zero when allowed.
    pub retry_after: Duration,
}

impl Decision {
    pub fn allow() -> Self {
        Self {
            allowed: true,
            retry_after: Duration::ZERO,
        }
    }

    pub fn deny(retry_after: Duration) -> Self {
        Self {
            allowed: false,
            retry_after,
        }
    }

    /// `retry_after` rounded up to whole seconds, as a `Retry-After` header wants.
    pub fn retry_after_secs(&self) -> u64 {
        let secs = self.retry_after.as_secs();
        if self.retry_after.subsec_nanos() > 0 {
            secs + 1
        } else {
            secs
        }
    }
}

/// Read-only view of one key's bucket.
#[derive(Debug, Clone, PartialEq)]
pub struct BucketSnapshot {
    pub address: String,
    /// The stored record, if any. `None` means the bucket is full.
    pub state: Option<BucketState>,
    /// Tokens available right now.
    pub available: f64,
    pub capacity: u64,
}

/// A named quota of `capacity` operations per `window`, tracked per key.
///
/// All state lives in the shared store, so any number of processes holding a
/// limiter with the same name enforce one quota. Share one instance among
/// callers in a process by wrapping it in an `Arc`.
///
/// Every update for every key of a limiter runs under the same
/// `<name>:lock` lease. That serialises unrelated keys; use separate limiter
/// names to partition a busy key space.
pub struct KeyRateLimiter {
    name: String,
    capacity: u64,
    window: Duration,
    refill_interval: Duration,
    store: Arc<dyn SharedStore>,
    buckets: BucketStore,
    lock: DistributedLock,
    clock: Arc<dyn Clock>,
}

impl std::fmt::Debug for KeyRateLimiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyRateLimiter")
            .field("name", &self.name)
            .field("capacity", &self.capacity)
            .field("window", &self.window)
            .field("refill_interval", &self.refill_interval)
            .finish()
    }
}

impl KeyRateLimiter {
    /// Create a limiter allowing `capacity` operations every `window`.
    ///
    /// Two limiters with the same `name` on the same store share a quota.
    pub fn new(
        store: Arc<dyn SharedStore>,
        name: &str,
        capacity: u64,
        window: Duration,
    ) -> Result<Self> {
        if name.is_empty() {
            return Err(KeyrateError::InvalidLimit(
                "limiter name must not be empty".to_string(),
            ));
        }
        if capacity == 0 {
            return Err(KeyrateError::InvalidLimit(format!(
                "limiter {name}: capacity must be positive"
            )));
        }
        if window.is_zero() {
            return Err(KeyrateError::InvalidLimit(format!(
                "limiter {name}: window must be positive"
            )));
        }

        // Time to regenerate a single token
        let refill_nanos = u64::try_from(window.as_nanos() / u128::from(capacity)).map_err(|_| {
            KeyrateError::InvalidLimit(format!(
                "limiter {name}: window {window:?} per token does not fit in nanoseconds"
            ))
        })?;
        let refill_interval = Duration::from_nanos(refill_nanos);
        if refill_interval.is_zero() {
            return Err(KeyrateError::InvalidLimit(format!(
                "limiter {name}: window {window:?} is too short for capacity {capacity}"
            )));
        }

        Ok(Self {
            name: name.to_string(),
            capacity,
            window,
            refill_interval,
            buckets: BucketStore::new(store.clone()),
            lock: DistributedLock::new(
                store.clone(),
                name,
                DEFAULT_LEASE_TTL,
                RetryPolicy::default(),
            ),
            store,
            clock: Arc::new(SystemClock),
        })
    }

    /// Use a different time source.
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Use a different lease TTL and retry policy.
    pub fn with_lock_config(mut self, config: &LockConfig) -> Self {
        self.lock = DistributedLock::new(
            self.store.clone(),
            &self.name,
            config.lease_ttl(),
            config.retry_policy(),
        );
        self
    }

    /// The limiter name.
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn capacity(&self) -> u64 {
        self.capacity
    }

    pub fn window(&self) -> Duration {
        self.window
    }

    pub fn refill_interval(&self) -> Duration {
        self.refill_interval
    }

    /// Where the bucket for `key` lives in the store.
    pub fn address(&self, key: &str) -> String {
        bucket_address(self.buckets.prefix(), &self.name, key)
    }

    /// Take one token from `key`'s bucket.
    ///
    /// - `Ok` with `allowed == false` means the quota is exhausted.
    /// - Lock contention fails open: `Ok(Decision::allow())`, with the bucket
    ///   left untouched.
    /// - Store failures and cancellation are returned as errors; treat those
    ///   as a denial unless the endpoint is best-effort.
    pub async fn for_key(&self, key: &str, cancel: &CancellationToken) -> Result<Decision> {
        let lease = match self.lock.acquire(cancel).await {
            Ok(lease) => lease,
            Err(e) if e.is_lock_not_obtained() => {
                warn!(
                    limiter = %self.name,
                    key = %key,
                    error = %e,
                    "Limiter lock contended, allowing request"
                );
                return Ok(Decision::allow());
            }
            Err(e) => {
                self.log_failure(key, &e);
                return Err(e);
            }
        };

        let result = self.consume_locked(key, cancel).await;
        self.unlock(lease).await;

        result.map_err(|e| {
            self.log_failure(key, &e);
            e
        })
    }

    /// Refill `key`'s bucket to capacity.
    ///
    /// Unlike [`for_key`](Self::for_key) this does not fail open: if the lock
    /// cannot be obtained the reset did not happen, and the error says so.
    pub async fn reset(&self, key: &str, cancel: &CancellationToken) -> Result<()> {
        let lease = self.lock.acquire(cancel).await.map_err(|e| {
            self.log_failure(key, &e);
            e
        })?;

        let address = self.address(key);
        let state = BucketState::full(self.capacity, self.clock.now());
        let result = cancellable(cancel, self.buckets.save(&address, &state, self.window)).await;
        self.unlock(lease).await;

        result.map_err(|e| {
            self.log_failure(key, &e);
            e
        })?;

        debug!(limiter = %self.name, key = %key, "Bucket reset");
        Ok(())
    }

    /// Report `key`'s bucket without taking a token or the lock.
    pub async fn peek(&self, key: &str, cancel: &CancellationToken) -> Result<BucketSnapshot> {
        let address = self.address(key);
        let state = cancellable(cancel, self.buckets.load(&address)).await?;
        let available = match &state {
            Some(state) => bucket::available_tokens(
                state,
                self.capacity,
                self.refill_interval,
                self.clock.now(),
            ),
            None => self.capacity as f64,
        };

        Ok(BucketSnapshot {
            address,
            state,
            available,
            capacity: self.capacity,
        })
    }

    /// Load, refill, take and save. Must run under the lock.
    async fn consume_locked(&self, key: &str, cancel: &CancellationToken) -> Result<Decision> {
        let address = self.address(key);
        let now = self.clock.now();

        let state = match cancellable(cancel, self.buckets.load(&address)).await? {
            Some(state) => state,
            None => {
                debug!(limiter = %self.name, key = %key, "Starting with a full bucket");
                BucketState::full(self.capacity, now)
            }
        };

        let outcome = bucket::consume(&state, self.capacity, self.refill_interval, now);

        // Idle buckets refill completely within one window, so they can expire then
        cancellable(cancel, self.buckets.save(&address, &outcome.state, self.window)).await?;

        trace!(
            limiter = %self.name,
            key = %key,
            allowed = outcome.allowed,
            tokens = outcome.state.tokens,
            retry_after_ms = outcome.retry_after.as_millis() as u64,
            "Rate limit decision"
        );

        if outcome.allowed {
            Ok(Decision::allow())
        } else {
            Ok(Decision::deny(outcome.retry_after))
        }
    }

    /// Release failures only delay the next caller until the lease TTL.
    async fn unlock(&self, lease: Lease) {
        if let Err(e) = self.lock.release(lease).await {
            warn!(limiter = %self.name, error = %e, "Failed to release limiter lock");
        }
    }

    fn log_failure(&self, key: &str, error: &KeyrateError) {
        match error {
            KeyrateError::Cancelled => {
                debug!(limiter = %self.name, key = %key, "Rate limit check cancelled");
            }
            _ => {
                warn!(limiter = %self.name, key = %key, error = %error, "Rate limiting failed");
            }
        }
    }
}
