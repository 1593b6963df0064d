//! Token bucket arithmetic.
//!
//! Everything in here is pure: given the stored state, the bucket shape and
//! the current time, compute the next state and the decision. Persistence and
//! locking live elsewhere.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Absorbs float rounding when a caller comes back exactly `retry_after` later.
const TOKEN_EPSILON: f64 = 1e-9;

/// Persisted state of one bucket.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BucketState {
    /// Tokens currently available, between zero and the bucket capacity.
    pub tokens: f64,
    /// When `tokens` was last recomputed.
    pub last_refill_at: DateTime<Utc>,
}

impl BucketState {
    /// A bucket holding its full capacity as of `now`.
    pub fn full(capacity: u64, now: DateTime<Utc>) -> Self {
        Self {
            tokens: capacity as f64,
            last_refill_at: now,
        }
    }
}

/// Outcome of trying to take one token.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Consumption {
    /// State to write back, on both the allow and the deny path.
    pub state: BucketState,
    pub allowed: bool,
    /// Time until one whole token is available; zero when allowed.
    pub retry_after: Duration,
}

/// Tokens the bucket would hold at `now`, capped at `capacity`.
pub fn available_tokens(
    state: &BucketState,
    capacity: u64,
    refill_interval: Duration,
    now: DateTime<Utc>,
) -> f64 {
    // A clock that went backwards refills nothing
    let elapsed = (now - state.last_refill_at).to_std().unwrap_or(Duration::ZERO);
    let refilled = elapsed.as_secs_f64() / refill_interval.as_secs_f64();
    (state.tokens.max(0.0) + refilled).min(capacity as f64)
}

/// Refill the bucket up to `now` and try to take one token.
pub fn consume(
    state: &BucketState,
    capacity: u64,
    refill_interval: Duration,
    now: DateTime<Utc>,
) -> Consumption {
    let available = available_tokens(state, capacity, refill_interval, now);
    let last_refill_at = now.max(state.last_refill_at);

    if available + TOKEN_EPSILON >= 1.0 {
        Consumption {
            state: BucketState {
                tokens: (available - 1.0).max(0.0),
                last_refill_at,
            },
            allowed: true,
            retry_after: Duration::ZERO,
        }
    } else {
        Consumption {
            // Partial refill is kept so progress toward the next token survives
            state: BucketState {
                tokens: available,
                last_refill_at,
            },
            allowed: false,
            retry_after: time_until_next_token(available, refill_interval),
        }
    }
}

/// Rounded up to whole nanoseconds so waiting this long always suffices.
fn time_until_next_token(available: f64, refill_interval: Duration) -> Duration {
    let missing = (1.0 - available).clamp(0.0, 1.0);
    let nanos = (missing * refill_interval.as_nanos() as f64).ceil();
    Duration::from_nanos(nanos as u64)
}
