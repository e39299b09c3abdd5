use std::collections::HashMap;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::sync::Mutex;

use crate::store::LockStore;
use crate::LockError;

struct LockEntry {
    value: String,
    expires_at: Instant,
}

impl LockEntry {
    fn is_expired(&self) -> bool {
        Instant::now() >= self.expires_at
    }
}

/// InMemoryLockStore はインメモリのリファレンスストア。
/// テストおよびローカル開発用。期限切れエントリは参照時に除去される。
pub struct InMemoryLockStore {
    entries: Mutex<HashMap<String, LockEntry>>,
}

impl InMemoryLockStore {
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
        }
    }
}

impl Default for InMemoryLockStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl LockStore for InMemoryLockStore {
    async fn set_if_absent(
        &self,
        key: &str,
        value: &str,
        ttl: Duration,
    ) -> Result<bool, LockError> {
        let mut entries = self.entries.lock().await;
        if let Some(entry) = entries.get(key) {
            if !entry.is_expired() {
                return Ok(false);
            }
        }
        entries.insert(
            key.to_string(),
            LockEntry {
                value: value.to_string(),
                expires_at: Instant::now() + ttl,
            },
        );
        Ok(true)
    }

    async fn delete_if_value(&self, key: &str, expected: &str) -> Result<bool, LockError> {
        let mut entries = self.entries.lock().await;
        match entries.get(key) {
            Some(entry) if !entry.is_expired() && entry.value == expected => {
                entries.remove(key);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn extend_if_value(
        &self,
        key: &str,
        expected: &str,
        ttl: Duration,
    ) -> Result<bool, LockError> {
        let mut entries = self.entries.lock().await;
        match entries.get_mut(key) {
            Some(entry) if !entry.is_expired() && entry.value == expected => {
                entry.expires_at = Instant::now() + ttl;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn is_locked(&self, key: &str) -> Result<bool, LockError> {
        let entries = self.entries.lock().await;
        Ok(entries.get(key).is_some_and(|e| !e.is_expired()))
    }
}
