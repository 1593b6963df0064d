//! Rate limiting logic and state management.

mod bucket;
mod limiter;
mod lock;
mod registry;
mod state;

pub use bucket::{available_tokens, consume, BucketState, Consumption};
pub use limiter::{BucketSnapshot, Decision, KeyRateLimiter};
pub use lock::{
    lock_address, DistributedLock, Lease, RetryPolicy, DEFAULT_LEASE_TTL, DEFAULT_MAX_RETRIES,
    DEFAULT_RETRY_STEP,
};
pub use registry::LimiterRegistry;
pub use state::{bucket_address, BucketStore};

use std::future::Future;
use tokio_util::sync::CancellationToken;

use crate::error::{KeyrateError, Result};

/// Run a store round-trip unless `cancel` fires first.
pub(crate) async fn cancellable<T, E, F>(cancel: &CancellationToken, fut: F) -> Result<T>
where
    F: Future<Output = std::result::Result<T, E>>,
    KeyrateError: From<E>,
{
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(KeyrateError::Cancelled),
        res = fut => res.map_err(KeyrateError::from),
    }
}
