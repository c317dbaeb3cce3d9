//! In-process entry store shared by the memoizers.

use lru::LruCache;
use serde::Serialize;
use std::hash::Hash;
use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::time::Instant;

struct Entry<V> {
    value: V,
    expires_at: Option<Instant>,
}

impl<V> Entry<V> {
    fn is_live(&self, now: Instant) -> bool {
        self.expires_at.is_none_or(|exp| now < exp)
    }
}

/// TTL-aware map with least-recently-used eviction when bounded.
pub(crate) struct LocalStore<K, V> {
    entries: LruCache<K, Entry<V>>,
    ttl: Option<Duration>,
}

impl<K, V> LocalStore<K, V>
where
    K: Hash + Eq,
    V: Clone,
{
    pub(crate) fn new(max_size: Option<usize>, ttl: Option<Duration>) -> Self {
        let entries = match max_size.and_then(NonZeroUsize::new) {
            Some(capacity) => LruCache::new(capacity),
            None => LruCache::unbounded(),
        };
        Self { entries, ttl }
    }

    /// Live value for `key`, marked most recently used. Expired entries are dropped.
    pub(crate) fn get(&mut self, key: &K) -> Option<V> {
        let now = Instant::now();
        match self.entries.get(key) {
            Some(entry) if entry.is_live(now) => return Some(entry.value.clone()),
            Some(_) => {}
            None => return None,
        }
        self.entries.pop(key);
        None
    }

    /// Insert or replace, evicting the least recently used entry when full.
    pub(crate) fn insert(&mut self, key: K, value: V) {
        let expires_at = self.ttl.and_then(|ttl| Instant::now().checked_add(ttl));
        self.entries.put(key, Entry { value, expires_at });
    }

    pub(crate) fn remove(&mut self, key: &K) {
        self.entries.pop(key);
    }

    pub(crate) fn clear(&mut self) {
        self.entries.clear();
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }
}

/// Hit and miss counters of a memoizer.
///
/// A hit is a call answered without invoking the memoized function: from
/// the cache, from a provider, or by joining another caller's computation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
}

impl CacheStats {
    /// Fraction of calls served without invoking the function (0.0 - 1.0).
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }
}

#[derive(Debug, Default)]
pub(crate) struct StatsRecorder {
    hits: AtomicU64,
    misses: AtomicU64,
}

impl StatsRecorder {
    pub(crate) fn hit(&self) {
        self.hits.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn miss(&self) {
        self.misses.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn snapshot(&self) -> CacheStats {
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lru_eviction_order() {
        let mut store = LocalStore::new(Some(2), None);
        store.insert("a", 1);
        store.insert("b", 2);

        // Touch "a" so "b" becomes the eviction candidate.
        assert_eq!(store.get(&"a"), Some(1));
        store.insert("c", 3);

        assert_eq!(store.len(), 2);
        assert_eq!(store.get(&"b"), None);
        assert_eq!(store.get(&"a"), Some(1));
        assert_eq!(store.get(&"c"), Some(3));
    }

    #[test]
    fn test_unbounded_store() {
        let mut store = LocalStore::new(None, None);
        for i in 0..1_000 {
            store.insert(i, i * 2);
        }
        assert_eq!(store.len(), 1_000);
        assert_eq!(store.get(&999), Some(1_998));
    }

    #[tokio::test(start_paused = true)]
    async fn test_ttl_expiry() {
        let mut store = LocalStore::new(None, Some(Duration::from_millis(100)));
        store.insert("k", "v");

        tokio::time::advance(Duration::from_millis(99)).await;
        assert_eq!(store.get(&"k"), Some("v"));

        tokio::time::advance(Duration::from_millis(1)).await;
        assert_eq!(store.get(&"k"), None);
        assert_eq!(store.len(), 0);
    }

    #[test]
    fn test_hit_rate() {
        let stats = CacheStats { hits: 3, misses: 1 };
        assert_eq!(stats.hit_rate(), 0.75);
        assert_eq!(CacheStats::default().hit_rate(), 0.0);
    }
}
