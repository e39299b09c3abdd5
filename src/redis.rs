use std::time::Duration;

use async_trait::async_trait;
use redis::aio::MultiplexedConnection;
use redis::{AsyncCommands, Client, RedisError, Script};

use crate::store::LockStore;
use crate::LockError;

/// Redis-backed lock store.
///
/// Uses atomic SET NX PX for acquisition and Lua scripts for the
/// conditional delete/extend operations, so that only the current
/// token holder can remove or prolong a lock.
#[derive(Clone)]
pub struct RedisLockStore {
    conn: MultiplexedConnection,
    key_prefix: String,
}

impl RedisLockStore {
    /// Create a new RedisLockStore from a Redis URL.
    ///
    /// # Arguments
    /// * `url` - Redis connection URL (e.g., "redis://127.0.0.1:6379")
    pub async fn new(url: &str) -> Result<Self, LockError> {
        let client = Client::open(url).map_err(map_redis_error)?;
        let conn = client
            .get_multiplexed_async_connection()
            .await
            .map_err(map_redis_error)?;
        Ok(Self {
            conn,
            key_prefix: "lock".to_string(),
        })
    }

    /// Create a new RedisLockStore from an existing multiplexed connection.
    pub fn from_connection(conn: MultiplexedConnection) -> Self {
        Self {
            conn,
            key_prefix: "lock".to_string(),
        }
    }

    /// Set a custom key prefix for lock keys.
    pub fn with_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.key_prefix = prefix.into();
        self
    }

    fn lock_key(&self, key: &str) -> String {
        format!("{}:{}", self.key_prefix, key)
    }
}

/// Lua script for the conditional delete.
/// Only deletes the key if the stored value matches the expected token.
const DELETE_SCRIPT: &str = r#"
if redis.call("get", KEYS[1]) == ARGV[1] then
    return redis.call("del", KEYS[1])
else
    return 0
end
"#;

/// Lua script for the conditional TTL extension.
/// Only resets the TTL if the stored value matches the expected token.
const EXTEND_SCRIPT: &str = r#"
if redis.call("get", KEYS[1]) == ARGV[1] then
    return redis.call("pexpire", KEYS[1], ARGV[2])
else
    return 0
end
"#;

#[async_trait]
impl LockStore for RedisLockStore {
    async fn set_if_absent(
        &self,
        key: &str,
        value: &str,
        ttl: Duration,
    ) -> Result<bool, LockError> {
        let mut conn = self.conn.clone();
        let full_key = self.lock_key(key);
        let millis = ttl.as_millis() as u64;

        // Atomic SET key value NX PX milliseconds
        let result: Option<String> = redis::cmd("SET")
            .arg(&full_key)
            .arg(value)
            .arg("NX")
            .arg("PX")
            .arg(millis)
            .query_async(&mut conn)
            .await
            .map_err(map_redis_error)?;

        Ok(result.is_some())
    }

    async fn delete_if_value(&self, key: &str, expected: &str) -> Result<bool, LockError> {
        let mut conn = self.conn.clone();
        let full_key = self.lock_key(key);

        let script = Script::new(DELETE_SCRIPT);
        let result: i64 = script
            .key(&full_key)
            .arg(expected)
            .invoke_async(&mut conn)
            .await
            .map_err(map_redis_error)?;

        Ok(result == 1)
    }

    async fn extend_if_value(
        &self,
        key: &str,
        expected: &str,
        ttl: Duration,
    ) -> Result<bool, LockError> {
        let mut conn = self.conn.clone();
        let full_key = self.lock_key(key);
        let millis = ttl.as_millis() as u64;

        let script = Script::new(EXTEND_SCRIPT);
        let result: i64 = script
            .key(&full_key)
            .arg(expected)
            .arg(millis)
            .invoke_async(&mut conn)
            .await
            .map_err(map_redis_error)?;

        Ok(result == 1)
    }

    async fn is_locked(&self, key: &str) -> Result<bool, LockError> {
        let mut conn = self.conn.clone();
        let full_key = self.lock_key(key);
        let exists: bool = conn.exists(&full_key).await.map_err(map_redis_error)?;
        Ok(exists)
    }
}

fn map_redis_error(err: RedisError) -> LockError {
    LockError::Store(err.to_string())
}

/// Helper function to format lock keys (exposed for testing without Redis connection).
pub fn format_lock_key(prefix: &str, key: &str) -> String {
    format!("{}:{}", prefix, key)
}
