use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;

/// Cache entry for an immutable record
#[derive(Clone, Debug)]
struct CacheEntry<T> {
    record: T,
    last_accessed: Instant,
}

/// In-memory TTL cache for content-addressed records (commits, meta-ranges).
///
/// Only immutable records go in here, so entries never need invalidation; the
/// TTL and capacity only bound memory.
#[derive(Debug)]
pub struct RecordCache<T> {
    /// Cache entries keyed by (partition, record id)
    entries: Arc<RwLock<HashMap<(String, String), CacheEntry<T>>>>,
    ttl: Duration,
    capacity: usize,
}

impl<T: Clone> RecordCache<T> {
    pub fn new(ttl: Duration, capacity: usize) -> Self {
        Self {
            entries: Arc::new(RwLock::new(HashMap::new())),
            ttl,
            capacity: capacity.max(1),
        }
    }

    /// Get a record if present and not expired
    pub async fn get(&self, partition: &str, id: &str) -> Option<T> {
        let mut entries = self.entries.write().await;
        let key = (partition.to_string(), id.to_string());

        if let Some(entry) = entries.get_mut(&key) {
            if entry.last_accessed.elapsed() > self.ttl {
                entries.remove(&key);
                return None;
            }

            entry.last_accessed = Instant::now();
            Some(entry.record.clone())
        } else {
            None
        }
    }

    pub async fn put(&self, partition: &str, id: &str, record: T) {
        let mut entries = self.entries.write().await;

        if entries.len() >= self.capacity {
            let now = Instant::now();
            let ttl = self.ttl;
            entries.retain(|_, entry| now.duration_since(entry.last_accessed) <= ttl);
        }
        if entries.len() >= self.capacity {
            // Still full: drop the least recently used entry
            let oldest = entries
                .iter()
                .min_by_key(|(_, entry)| entry.last_accessed)
                .map(|(key, _)| key.clone());
            if let Some(key) = oldest {
                entries.remove(&key);
            }
        }

        entries.insert(
            (partition.to_string(), id.to_string()),
            CacheEntry {
                record,
                last_accessed: Instant::now(),
            },
        );
    }

    /// Forget every record of a partition (used when a repository is deleted)
    pub async fn remove_partition(&self, partition: &str) {
        let mut entries = self.entries.write().await;
        entries.retain(|(p, _), _| p != partition);
    }

    #[cfg(test)]
    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_cache_basic_operations() {
        let cache = RecordCache::new(Duration::from_secs(60), 10);

        cache.put("repo-a", "c1", "commit one".to_string()).await;
        assert_eq!(cache.get("repo-a", "c1").await, Some("commit one".to_string()));

        // Same id in another partition is a different record
        assert_eq!(cache.get("repo-b", "c1").await, None);

        cache.remove_partition("repo-a").await;
        assert_eq!(cache.get("repo-a", "c1").await, None);
    }

    #[tokio::test]
    async fn test_cache_expiry() {
        let cache = RecordCache::new(Duration::from_millis(1), 10);
        cache.put("p", "c1", 1u32).await;
        tokio::time::sleep(Duration::from_millis(5)).await;
        assert_eq!(cache.get("p", "c1").await, None);

        // a full cache drops expired entries before evicting live ones
        let cache = RecordCache::new(Duration::from_millis(1), 2);
        cache.put("p", "a", 1u32).await;
        cache.put("p", "b", 2u32).await;
        tokio::time::sleep(Duration::from_millis(5)).await;
        cache.put("p", "c", 3u32).await;
        assert_eq!(cache.len().await, 1);
    }

    #[tokio::test]
    async fn test_cache_capacity_evicts_least_recent() {
        let cache = RecordCache::new(Duration::from_secs(60), 2);
        cache.put("p", "a", 1u32).await;
        tokio::time::sleep(Duration::from_millis(2)).await;
        cache.put("p", "b", 2u32).await;
        tokio::time::sleep(Duration::from_millis(2)).await;
        // touch "a" so "b" becomes the oldest
        assert_eq!(cache.get("p", "a").await, Some(1));
        cache.put("p", "c", 3u32).await;

        assert_eq!(cache.len().await, 2);
        assert_eq!(cache.get("p", "b").await, None);
        assert_eq!(cache.get("p", "a").await, Some(1));
        assert_eq!(cache.get("p", "c").await, Some(3));
    }
}
