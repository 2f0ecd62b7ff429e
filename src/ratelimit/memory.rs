//! Process-local counter store.

use std::time::{Duration, Instant};

use async_trait::async_trait;
use dashmap::DashMap;
use tracing::{debug, trace};

use super::backend::{CounterStore, StorageError};
use super::counter::RateLimitCounter;

/// Default number of counters kept before eviction starts.
pub const DEFAULT_CAPACITY: usize = 10_000;

struct CacheEntry {
    counter: RateLimitCounter,
    expires_at: Instant,
}

/// Bounded in-memory counter store.
///
/// Expired entries read as absent and are dropped lazily. When the store is
/// full, expired entries are swept first; if that frees nothing, the entry
/// closest to expiry is evicted. Counters are lost on restart and are not
/// shared between gateway instances.
pub struct MemoryCounterStore {
    entries: DashMap<String, CacheEntry>,
    capacity: usize,
}

impl MemoryCounterStore {
    /// Create a store holding at most `capacity` counters.
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: DashMap::new(),
            capacity: capacity.max(1),
        }
    }

    /// Number of stored counters, expired ones included.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the store holds no counters.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Drop every expired counter, returning how many were removed.
    pub fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let before = self.entries.len();
        self.entries.retain(|_, entry| entry.expires_at > now);
        before.saturating_sub(self.entries.len())
    }

    fn make_room(&self) {
        let purged = self.purge_expired();
        if self.entries.len() < self.capacity {
            trace!(purged, "Purged expired counters");
            return;
        }

        let victim = self
            .entries
            .iter()
            .min_by_key(|entry| entry.expires_at)
            .map(|entry| entry.key().clone());

        if let Some(key) = victim {
            debug!(key = %key, capacity = self.capacity, "Counter store full, evicting");
            self.entries.remove(&key);
        }
    }
}

impl Default for MemoryCounterStore {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

#[async_trait]
impl CounterStore for MemoryCounterStore {
    async fn get(&self, key: &str) -> Result<Option<RateLimitCounter>, StorageError> {
        let now = Instant::now();
        let cached = self
            .entries
            .get(key)
            .map(|entry| (entry.counter, entry.expires_at));

        match cached {
            Some((counter, expires_at)) if expires_at > now => Ok(Some(counter)),
            Some(_) => {
                self.entries.remove_if(key, |_, entry| entry.expires_at <= now);
                Ok(None)
            }
            None => Ok(None),
        }
    }

    async fn set(
        &self,
        key: &str,
        counter: RateLimitCounter,
        ttl: Duration,
    ) -> Result<(), StorageError> {
        if !self.entries.contains_key(key) && self.entries.len() >= self.capacity {
            self.make_room();
        }

        self.entries.insert(
            key.to_string(),
            CacheEntry {
                counter,
                expires_at: Instant::now() + ttl,
            },
        );
        Ok(())
    }

    async fn remove(&self, key: &str) -> Result<(), StorageError> {
        self.entries.remove(key);
        Ok(())
    }

    async fn exists(&self, key: &str) -> Result<bool, StorageError> {
        Ok(self.get(key).await?.is_some())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use tokio_test::assert_ok;

    fn counter(total: u64) -> RateLimitCounter {
        RateLimitCounter {
            started_at: Utc::now(),
            exceeded_at: None,
            total,
        }
    }

    #[tokio::test]
    async fn test_set_and_get() {
        let store = MemoryCounterStore::default();
        assert_ok!(store.set("key1", counter(3), Duration::from_secs(60)).await);

        let stored = store.get("key1").await.unwrap().unwrap();
        assert_eq!(stored.total, 3);
        assert!(store.exists("key1").await.unwrap());
        assert!(store.get("missing").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_set_overwrites() {
        let store = MemoryCounterStore::default();
        store.set("key1", counter(1), Duration::from_secs(60)).await.unwrap();
        store.set("key1", counter(2), Duration::from_secs(60)).await.unwrap();

        assert_eq!(store.get("key1").await.unwrap().unwrap().total, 2);
        assert_eq!(store.len(), 1);
    }

    #[tokio::test]
    async fn test_remove() {
        let store = MemoryCounterStore::default();
        store.set("key1", counter(1), Duration::from_secs(60)).await.unwrap();
        assert_ok!(store.remove("key1").await);

        assert!(store.get("key1").await.unwrap().is_none());
        assert!(!store.exists("key1").await.unwrap());
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn test_expired_entries_read_as_absent() {
        let store = MemoryCounterStore::default();
        store.set("key1", counter(1), Duration::from_millis(30)).await.unwrap();
        assert!(store.exists("key1").await.unwrap());

        tokio::time::sleep(Duration::from_millis(60)).await;

        assert!(store.get("key1").await.unwrap().is_none());
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn test_purge_expired() {
        let store = MemoryCounterStore::default();
        store.set("short", counter(1), Duration::from_millis(10)).await.unwrap();
        store.set("long", counter(1), Duration::from_secs(60)).await.unwrap();

        tokio::time::sleep(Duration::from_millis(30)).await;

        assert_eq!(store.purge_expired(), 1);
        assert_eq!(store.len(), 1);
        assert!(store.exists("long").await.unwrap());
    }

    #[tokio::test]
    async fn test_capacity_evicts_soonest_expiry() {
        let store = MemoryCounterStore::new(2);
        store.set("a", counter(1), Duration::from_secs(10)).await.unwrap();
        store.set("b", counter(1), Duration::from_secs(60)).await.unwrap();
        store.set("c", counter(1), Duration::from_secs(60)).await.unwrap();

        assert_eq!(store.len(), 2);
        assert!(!store.exists("a").await.unwrap());
        assert!(store.exists("b").await.unwrap());
        assert!(store.exists("c").await.unwrap());
    }

    #[tokio::test]
    async fn test_capacity_prefers_expired_entries() {
        let store = MemoryCounterStore::new(2);
        store.set("a", counter(1), Duration::from_secs(60)).await.unwrap();
        store.set("b", counter(1), Duration::from_millis(10)).await.unwrap();

        tokio::time::sleep(Duration::from_millis(30)).await;
        store.set("c", counter(1), Duration::from_secs(60)).await.unwrap();

        assert!(store.exists("a").await.unwrap());
        assert!(!store.exists("b").await.unwrap());
        assert!(store.exists("c").await.unwrap());
    }
}
