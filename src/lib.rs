//! Keyrate - Distributed Per-Key Rate Limiting
//!
//! This crate enforces "N operations per window" quotas per arbitrary key
//! (a user ID, an IP address) across any number of processes. Token bucket
//! state lives in a shared store, and every read-modify-write of a limiter's
//! buckets runs under a short-lived distributed lock in that same store.

pub mod clock;
pub mod config;
pub mod error;
pub mod ratelimit;
pub mod store;

pub use error::{KeyrateError, Result};
pub use ratelimit::{Decision, KeyRateLimiter, LimiterRegistry};
