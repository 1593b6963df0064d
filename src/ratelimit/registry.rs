//! Named limiters built from configuration.
//!
//! A service usually declares a handful of quotas up front ("comments: 5 per
//! minute", "verification: 1 per 5 seconds") and hands the matching limiter
//! to whichever handler enforces it.

use std::collections::HashMap;
use std::sync::Arc;
use tracing::info;

use super::limiter::KeyRateLimiter;
use crate::clock::Clock;
use crate::config::{LimiterDefinition, LockConfig};
use crate::error::{KeyrateError, Result};
use crate::store::SharedStore;

/// A set of limiters with unique names.
#[derive(Debug, Default)]
pub struct LimiterRegistry {
    limiters: HashMap<String, Arc<KeyRateLimiter>>,
}

impl LimiterRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Build one limiter per definition, all on the same store and clock.
    pub fn from_definitions(
        store: Arc<dyn SharedStore>,
        clock: Arc<dyn Clock>,
        lock: &LockConfig,
        definitions: &[LimiterDefinition],
    ) -> Result<Self> {
        let mut registry = Self::new();

        for definition in definitions {
            let limiter = KeyRateLimiter::new(
                store.clone(),
                &definition.name,
                definition.capacity,
                definition.window(),
            )?
            .with_clock(clock.clone())
            .with_lock_config(lock);

            registry.register(limiter)?;
        }

        info!(count = registry.len(), "Rate limiters initialized");
        Ok(registry)
    }

    /// Add a limiter. Names must be unique: two limiters sharing a name share a quota.
    pub fn register(&mut self, limiter: KeyRateLimiter) -> Result<Arc<KeyRateLimiter>> {
        if self.limiters.contains_key(limiter.name()) {
            return Err(KeyrateError::Config(format!(
                "duplicate rate limiter name: {}",
                limiter.name()
            )));
        }

        info!(
            limiter = %limiter.name(),
            capacity = limiter.capacity(),
            window_ms = limiter.window().as_millis() as u64,
            "Registered rate limiter"
        );

        let limiter = Arc::new(limiter);
        self.limiters.insert(limiter.name().to_string(), limiter.clone());
        Ok(limiter)
    }

    /// Look up a limiter by name.
    pub fn get(&self, name: &str) -> Option<Arc<KeyRateLimiter>> {
        self.limiters.get(name).cloned()
    }

    /// Registered names, sorted.
    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.limiters.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    pub fn len(&self) -> usize {
        self.limiters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.limiters.is_empty()
    }
}
