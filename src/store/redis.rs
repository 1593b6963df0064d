//! Redis store backend.

use ::redis::aio::ConnectionManager;
use ::redis::Script;
use async_trait::async_trait;
use std::time::Duration;
use tracing::{debug, warn};

use super::{SharedStore, StoreError};
use crate::config::StoreConfig;

/// Deletes KEYS[1] only while it still holds ARGV[1].
const COMPARE_AND_DELETE: &str = r#"
if redis.call("GET", KEYS[1]) == ARGV[1] then
    return redis.call("DEL", KEYS[1])
end
return 0
"#;

/// Store backed by a Redis (or wire-compatible) server.
#[derive(Clone)]
pub struct RedisStore {
    connection_manager: ConnectionManager,
    prefix: String,
    release_script: Script,
}

impl std::fmt::Debug for RedisStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisStore")
            .field("prefix", &self.prefix)
            .finish()
    }
}

impl RedisStore {
    /// Connect to the configured server and verify it answers PING.
    pub async fn connect(config: &StoreConfig) -> Result<Self, StoreError> {
        let client = ::redis::Client::open(config.url.as_str()).map_err(|e| {
            warn!(error = %e, "Failed to create Redis client");
            StoreError::Redis(e)
        })?;

        let connection_manager = ConnectionManager::new(client).await.map_err(|e| {
            warn!(error = %e, "Failed to create Redis connection manager");
            StoreError::Redis(e)
        })?;

        let mut conn = connection_manager.clone();
        let _: String = ::redis::cmd("PING").query_async(&mut conn).await?;

        debug!(prefix = %config.prefix, "Connected to Redis store");

        Ok(Self {
            connection_manager,
            prefix: config.prefix.clone(),
            release_script: Script::new(COMPARE_AND_DELETE),
        })
    }
}

/// Redis rejects a zero expiry, and sub-second windows need millisecond TTLs.
fn ttl_millis(ttl: Duration) -> u64 {
    (ttl.as_millis() as u64).max(1)
}

#[async_trait]
impl SharedStore for RedisStore {
    fn prefix(&self) -> &str {
        &self.prefix
    }

    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        let mut conn = self.connection_manager.clone();
        let value: Option<String> = ::redis::cmd("GET").arg(key).query_async(&mut conn).await?;
        Ok(value)
    }

    async fn set(&self, key: &str, value: &str, ttl: Duration) -> Result<(), StoreError> {
        let mut conn = self.connection_manager.clone();
        let _: String = ::redis::cmd("SET")
            .arg(key)
            .arg(value)
            .arg("PX")
            .arg(ttl_millis(ttl))
            .query_async(&mut conn)
            .await?;
        Ok(())
    }

    async fn set_if_absent(
        &self,
        key: &str,
        value: &str,
        ttl: Duration,
    ) -> Result<bool, StoreError> {
        let mut conn = self.connection_manager.clone();
        // Replies OK when written and nil when the key already exists
        let reply: Option<String> = ::redis::cmd("SET")
            .arg(key)
            .arg(value)
            .arg("NX")
            .arg("PX")
            .arg(ttl_millis(ttl))
            .query_async(&mut conn)
            .await?;
        Ok(reply.is_some())
    }

    async fn delete_if_equals(&self, key: &str, expected: &str) -> Result<bool, StoreError> {
        let mut conn = self.connection_manager.clone();
        let removed: i64 = self
            .release_script
            .key(key)
            .arg(expected)
            .invoke_async(&mut conn)
            .await?;
        Ok(removed > 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ttl_millis() {
        assert_eq!(ttl_millis(Duration::from_secs(3)), 3000);
        assert_eq!(ttl_millis(Duration::from_millis(500)), 500);
        assert_eq!(ttl_millis(Duration::from_micros(10)), 1);
        assert_eq!(ttl_millis(Duration::ZERO), 1);
    }

    #[tokio::test]
    async fn test_connect_rejects_invalid_url() {
        let config = StoreConfig {
            url: "not a url".to_string(),
            prefix: "test".to_string(),
        };
        let err = RedisStore::connect(&config).await.unwrap_err();
        assert!(matches!(err, StoreError::Redis(_)));
    }
}
