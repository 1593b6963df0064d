//! Configuration management for keyrate.

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::Path;
use std::time::Duration;
use tracing::info;

use crate::error::{KeyrateError, Result};
use crate::ratelimit::{RetryPolicy, DEFAULT_LEASE_TTL, DEFAULT_MAX_RETRIES, DEFAULT_RETRY_STEP};

/// Prefix for environment variable overrides, e.g. `KEYRATE__STORE__URL`.
const ENV_PREFIX: &str = "KEYRATE";

/// Main configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct KeyrateConfig {
    /// Shared store connection
    #[serde(default)]
    pub store: StoreConfig,

    /// Distributed lock tuning
    #[serde(default)]
    pub lock: LockConfig,

    /// Named limiters
    #[serde(default)]
    pub limiters: Vec<LimiterDefinition>,
}

/// Shared store configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Redis connection URL
    #[serde(default = "default_store_url")]
    pub url: String,

    /// Namespace for bucket records
    #[serde(default = "default_store_prefix")]
    pub prefix: String,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            url: default_store_url(),
            prefix: default_store_prefix(),
        }
    }
}

fn default_store_url() -> String {
    "redis://127.0.0.1:6379".to_string()
}

fn default_store_prefix() -> String {
    "ratelimit".to_string()
}

/// Distributed lock configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LockConfig {
    /// Lease lifetime in milliseconds
    #[serde(default = "default_lease_ttl_ms")]
    pub lease_ttl_ms: u64,

    /// Delay between acquisition attempts in milliseconds
    #[serde(default = "default_retry_step_ms")]
    pub retry_step_ms: u64,

    /// Retries after the first attempt
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// Optional cap on total acquisition time in milliseconds
    #[serde(default)]
    pub acquire_timeout_ms: Option<u64>,
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            lease_ttl_ms: default_lease_ttl_ms(),
            retry_step_ms: default_retry_step_ms(),
            max_retries: default_max_retries(),
            acquire_timeout_ms: None,
        }
    }
}

fn default_lease_ttl_ms() -> u64 {
    DEFAULT_LEASE_TTL.as_millis() as u64
}

fn default_retry_step_ms() -> u64 {
    DEFAULT_RETRY_STEP.as_millis() as u64
}

fn default_max_retries() -> u32 {
    DEFAULT_MAX_RETRIES
}

impl LockConfig {
    pub fn lease_ttl(&self) -> Duration {
        Duration::from_millis(self.lease_ttl_ms)
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        let step = Duration::from_millis(self.retry_step_ms);
        let policy = RetryPolicy::linear(step, self.max_retries);
        match self.acquire_timeout_ms {
            Some(ms) => policy.with_timeout(Duration::from_millis(ms)),
            None => policy,
        }
    }
}

/// One named quota: `capacity` operations every `window_ms`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LimiterDefinition {
    pub name: String,
    pub capacity: u64,
    pub window_ms: u64,
}

impl LimiterDefinition {
    pub fn window(&self) -> Duration {
        Duration::from_millis(self.window_ms)
    }
}

impl KeyrateConfig {
    /// Load configuration from a file, with `KEYRATE__*` environment overrides.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        Self::load(Some(path.as_ref()))
    }

    /// Load configuration from an optional file plus environment overrides.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = ::config::Config::builder();
        if let Some(path) = path {
            info!(path = %path.display(), "Loading configuration");
            builder = builder.add_source(::config::File::from(path));
        }

        let config: KeyrateConfig = builder
            .add_source(
                ::config::Environment::with_prefix(ENV_PREFIX)
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .and_then(|settings| settings.try_deserialize())
            .map_err(|e| KeyrateError::Config(e.to_string()))?;

        config.validate()?;
        Ok(config)
    }

    /// Parse configuration from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let config: KeyrateConfig = serde_yaml::from_str(yaml)
            .map_err(|e| KeyrateError::Config(format!("Failed to parse configuration: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Reject definitions that could never build a working limiter.
    pub fn validate(&self) -> Result<()> {
        if self.lock.lease_ttl_ms == 0 {
            return Err(KeyrateError::Config("lock.lease_ttl_ms must be positive".to_string()));
        }

        let mut seen = HashSet::new();
        for limiter in &self.limiters {
            if limiter.name.is_empty() {
                return Err(KeyrateError::Config("limiter name must not be empty".to_string()));
            }
            if !seen.insert(limiter.name.as_str()) {
                return Err(KeyrateError::Config(format!(
                    "duplicate rate limiter name: {}",
                    limiter.name
                )));
            }
            if limiter.capacity == 0 {
                return Err(KeyrateError::Config(format!(
                    "limiter {}: capacity must be positive",
                    limiter.name
                )));
            }
            if limiter.window_ms == 0 {
                return Err(KeyrateError::Config(format!(
                    "limiter {}: window_ms must be positive",
                    limiter.name
                )));
            }
        }
        Ok(())
    }

    /// Look up a limiter definition by name.
    pub fn limiter(&self, name: &str) -> Option<&LimiterDefinition> {
        self.limiters.iter().find(|l| l.name == name)
    }
}
