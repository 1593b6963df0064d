//! Shared key-value storage.
//!
//! Every process enforcing the same quota talks to one store. Bucket state
//! and lock leases are both plain string records with a TTL; the store only
//! has to make each single-key primitive atomic.
//!
//! - **Redis**: the production backend, shared across processes
//! - **Memory**: a single-process stand-in with a pluggable clock, for tests
//!   and local development

mod memory;
mod redis;

pub use memory::MemoryStore;
pub use self::redis::RedisStore;

use async_trait::async_trait;
use std::time::Duration;
use thiserror::Error;

/// Errors raised by a store backend.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Redis error: {0}")]
    Redis(#[from] ::redis::RedisError),
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("Backend error: {0}")]
    Backend(String),
}

/// A TTL-capable key-value store shared by all limiter processes.
#[async_trait]
pub trait SharedStore: Send + Sync {
    /// Namespace prepended to bucket addresses.
    fn prefix(&self) -> &str;

    /// Read a live record.
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError>;

    /// Unconditionally write a record that expires after `ttl`.
    async fn set(&self, key: &str, value: &str, ttl: Duration) -> Result<(), StoreError>;

    /// Write a record only if no live record exists under `key`.
    ///
    /// Returns `true` when the write happened.
    async fn set_if_absent(&self, key: &str, value: &str, ttl: Duration)
        -> Result<bool, StoreError>;

    /// Delete the record only if it still holds `expected`.
    ///
    /// Returns `true` when a record was removed.
    async fn delete_if_equals(&self, key: &str, expected: &str) -> Result<bool, StoreError>;
}
