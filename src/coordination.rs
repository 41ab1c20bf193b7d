//! Shared coordination store: the substrate for dedup keys and distributed
//! locks.
//!
//! Everything that needs cross-process correctness goes through the two
//! atomic primitives on [`CoordinationStore`]: conditional set
//! ([`set_if_absent`](CoordinationStore::set_if_absent)) and token-checked
//! delete ([`delete_if_equals`](CoordinationStore::delete_if_equals)). Plain
//! read-then-write sequences are never used where a race would cause
//! duplicate execution.
//!
//! The store is an explicitly constructed dependency handed to every
//! component at construction, so tests substitute [`MemoryCoordinationStore`]
//! without touching a live backend. The Redis-backed implementation is
//! enabled with the `redis-store` feature.

use crate::Result;
use async_trait::async_trait;
use std::collections::HashMap;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;

#[async_trait]
pub trait CoordinationStore: Send + Sync {
    /// Atomically set `key` to `value` only if it does not exist, with an
    /// optional expiry. Returns `true` if the key was written.
    async fn set_if_absent(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<bool>;

    /// Atomically delete `key` only if its current value equals `expected`.
    /// Returns `true` if the key was deleted.
    async fn delete_if_equals(&self, key: &str, expected: &str) -> Result<bool>;

    async fn exists(&self, key: &str) -> Result<bool>;

    /// Unconditional write, with an optional expiry.
    async fn put(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<()>;

    /// Unconditional delete. Deleting a missing key is not an error.
    async fn remove(&self, key: &str) -> Result<()>;

    /// Reported memory usage of the backing store, if the backend exposes it.
    async fn memory_used_bytes(&self) -> Result<Option<u64>>;

    /// Release the underlying connection. Idempotent.
    async fn close(&self) -> Result<()>;
}

/// In-memory implementation with expiry bookkeeping.
///
/// Used by tests and by single-process deployments that do not need
/// cross-process coordination.
pub struct MemoryCoordinationStore {
    entries: Mutex<HashMap<String, Entry>>,
}

struct Entry {
    value: String,
    expires_at: Option<Instant>,
}

impl Entry {
    fn is_expired(&self) -> bool {
        self.expires_at.is_some_and(|at| Instant::now() >= at)
    }
}

impl MemoryCoordinationStore {
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// Current live value of a key, for test assertions.
    pub async fn get(&self, key: &str) -> Option<String> {
        let mut entries = self.entries.lock().await;
        match entries.get(key) {
            Some(entry) if entry.is_expired() => {
                entries.remove(key);
                None
            }
            Some(entry) => Some(entry.value.clone()),
            None => None,
        }
    }
}

impl Default for MemoryCoordinationStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl CoordinationStore for MemoryCoordinationStore {
    async fn set_if_absent(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<bool> {
        let mut entries = self.entries.lock().await;
        if let Some(entry) = entries.get(key) {
            if !entry.is_expired() {
                return Ok(false);
            }
        }
        entries.insert(
            key.to_string(),
            Entry {
                value: value.to_string(),
                expires_at: ttl.map(|d| Instant::now() + d),
            },
        );
        Ok(true)
    }

    async fn delete_if_equals(&self, key: &str, expected: &str) -> Result<bool> {
        let mut entries = self.entries.lock().await;
        match entries.get(key) {
            Some(entry) if !entry.is_expired() && entry.value == expected => {
                entries.remove(key);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn exists(&self, key: &str) -> Result<bool> {
        let mut entries = self.entries.lock().await;
        match entries.get(key) {
            Some(entry) if entry.is_expired() => {
                entries.remove(key);
                Ok(false)
            }
            Some(_) => Ok(true),
            None => Ok(false),
        }
    }

    async fn put(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<()> {
        let mut entries = self.entries.lock().await;
        entries.insert(
            key.to_string(),
            Entry {
                value: value.to_string(),
                expires_at: ttl.map(|d| Instant::now() + d),
            },
        );
        Ok(())
    }

    async fn remove(&self, key: &str) -> Result<()> {
        self.entries.lock().await.remove(key);
        Ok(())
    }

    async fn memory_used_bytes(&self) -> Result<Option<u64>> {
        let entries = self.entries.lock().await;
        let bytes: usize = entries
            .iter()
            .map(|(k, entry)| k.len() + entry.value.len())
            .sum();
        Ok(Some(bytes as u64))
    }

    async fn close(&self) -> Result<()> {
        Ok(())
    }
}

#[cfg(feature = "redis-store")]
pub use self::redis_store::RedisCoordinationStore;

#[cfg(feature = "redis-store")]
mod redis_store {
    use super::*;
    use crate::error::SwitchyardError;
    use redis::aio::ConnectionManager;

    /// Redis-backed coordination store.
    ///
    /// Conditional set is `SET key value NX [PX ttl]`; token-checked delete
    /// runs server-side as a Lua script so the compare and the delete cannot
    /// interleave with another client.
    pub struct RedisCoordinationStore {
        conn: ConnectionManager,
        delete_if_equals: redis::Script,
    }

    const DELETE_IF_EQUALS: &str = r#"
if redis.call('get', KEYS[1]) == ARGV[1] then
    return redis.call('del', KEYS[1])
else
    return 0
end
"#;

    fn map_err(err: redis::RedisError) -> SwitchyardError {
        SwitchyardError::Coordination {
            message: err.to_string(),
        }
    }

    impl RedisCoordinationStore {
        pub async fn connect(url: &str) -> Result<Self> {
            let client = redis::Client::open(url).map_err(map_err)?;
            let conn = ConnectionManager::new(client).await.map_err(map_err)?;
            Ok(Self {
                conn,
                delete_if_equals: redis::Script::new(DELETE_IF_EQUALS),
            })
        }
    }

    #[async_trait]
    impl CoordinationStore for RedisCoordinationStore {
        async fn set_if_absent(
            &self,
            key: &str,
            value: &str,
            ttl: Option<Duration>,
        ) -> Result<bool> {
            let mut conn = self.conn.clone();
            let mut cmd = redis::cmd("SET");
            cmd.arg(key).arg(value).arg("NX");
            if let Some(ttl) = ttl {
                cmd.arg("PX").arg(ttl.as_millis() as u64);
            }
            let reply: Option<String> = cmd.query_async(&mut conn).await.map_err(map_err)?;
            Ok(reply.is_some())
        }

        async fn delete_if_equals(&self, key: &str, expected: &str) -> Result<bool> {
            let mut conn = self.conn.clone();
            let deleted: i64 = self
                .delete_if_equals
                .key(key)
                .arg(expected)
                .invoke_async(&mut conn)
                .await
                .map_err(map_err)?;
            Ok(deleted == 1)
        }

        async fn exists(&self, key: &str) -> Result<bool> {
            let mut conn = self.conn.clone();
            let exists: bool = redis::cmd("EXISTS")
                .arg(key)
                .query_async(&mut conn)
                .await
                .map_err(map_err)?;
            Ok(exists)
        }

        async fn put(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<()> {
            let mut conn = self.conn.clone();
            let mut cmd = redis::cmd("SET");
            cmd.arg(key).arg(value);
            if let Some(ttl) = ttl {
                cmd.arg("PX").arg(ttl.as_millis() as u64);
            }
            cmd.query_async::<()>(&mut conn).await.map_err(map_err)?;
            Ok(())
        }

        async fn remove(&self, key: &str) -> Result<()> {
            let mut conn = self.conn.clone();
            redis::cmd("DEL")
                .arg(key)
                .query_async::<()>(&mut conn)
                .await
                .map_err(map_err)?;
            Ok(())
        }

        async fn memory_used_bytes(&self) -> Result<Option<u64>> {
            let mut conn = self.conn.clone();
            let info: String = redis::cmd("INFO")
                .arg("memory")
                .query_async(&mut conn)
                .await
                .map_err(map_err)?;
            Ok(info
                .lines()
                .find_map(|line| line.strip_prefix("used_memory:"))
                .and_then(|v| v.trim().parse().ok()))
        }

        async fn close(&self) -> Result<()> {
            // ConnectionManager closes with the last clone; nothing to do
            // beyond letting it drop.
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_set_if_absent_blocks_second_writer() {
        let store = MemoryCoordinationStore::new();
        assert!(store.set_if_absent("k", "a", None).await.unwrap());
        assert!(!store.set_if_absent("k", "b", None).await.unwrap());
        assert_eq!(store.get("k").await, Some("a".to_string()));
    }

    #[tokio::test]
    async fn test_set_if_absent_after_expiry() {
        let store = MemoryCoordinationStore::new();
        assert!(
            store
                .set_if_absent("k", "a", Some(Duration::from_millis(10)))
                .await
                .unwrap()
        );
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(store.set_if_absent("k", "b", None).await.unwrap());
        assert_eq!(store.get("k").await, Some("b".to_string()));
    }

    #[tokio::test]
    async fn test_delete_if_equals() {
        let store = MemoryCoordinationStore::new();
        store.put("k", "token-1", None).await.unwrap();

        assert!(!store.delete_if_equals("k", "token-2").await.unwrap());
        assert!(store.exists("k").await.unwrap());

        assert!(store.delete_if_equals("k", "token-1").await.unwrap());
        assert!(!store.exists("k").await.unwrap());

        // Deleting a missing key is a no-op, not an error.
        assert!(!store.delete_if_equals("k", "token-1").await.unwrap());
    }

    #[tokio::test]
    async fn test_exists_honors_expiry() {
        let store = MemoryCoordinationStore::new();
        store
            .put("k", "v", Some(Duration::from_millis(10)))
            .await
            .unwrap();
        assert!(store.exists("k").await.unwrap());
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!store.exists("k").await.unwrap());
    }

    #[tokio::test]
    async fn test_memory_usage_tracks_entries() {
        let store = MemoryCoordinationStore::new();
        let empty = store.memory_used_bytes().await.unwrap().unwrap();
        assert_eq!(empty, 0);

        store.put("key", "value", None).await.unwrap();
        let used = store.memory_used_bytes().await.unwrap().unwrap();
        assert_eq!(used, ("key".len() + "value".len()) as u64);
    }
}
