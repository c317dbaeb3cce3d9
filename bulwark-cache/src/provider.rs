//! External stores a memoizer can keep its entries in.
//!
//! A provider replaces the memoizer's in-process map. Read failures are
//! treated as misses and write failures are logged and ignored, so a flaky
//! store degrades to recomputation rather than to errors.

use crate::error::CacheResult;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::hash::Hash;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

/// Blocking cache store.
pub trait CacheProvider<K, V>: Send + Sync {
    /// Get a value, `Ok(None)` when absent or expired.
    fn get(&self, key: &K) -> CacheResult<Option<V>>;

    /// Store a value, replacing any previous one.
    ///
    /// # Arguments
    ///
    /// * `key` - The cache key
    /// * `value` - The value to store
    /// * `ttl` - Optional time-to-live duration
    fn set(&self, key: &K, value: V, ttl: Option<Duration>) -> CacheResult<()>;

    /// Remove a key. Removing an absent key is not an error.
    fn remove(&self, key: &K) -> CacheResult<()>;
}

/// Non-blocking cache store, e.g. a remote key-value service.
#[async_trait]
pub trait AsyncCacheProvider<K, V>: Send + Sync {
    /// Get a value, `Ok(None)` when absent or expired.
    async fn get(&self, key: &K) -> CacheResult<Option<V>>;

    /// Store a value, replacing any previous one.
    async fn set(&self, key: &K, value: V, ttl: Option<Duration>) -> CacheResult<()>;

    /// Remove a key. Removing an absent key is not an error.
    async fn remove(&self, key: &K) -> CacheResult<()>;
}

/// Runs a blocking provider from async memoizers.
///
/// Suitable for providers whose calls do not block for long, such as
/// [`InMemoryProvider`].
pub(crate) struct BlockingProvider<K, V> {
    inner: Arc<dyn CacheProvider<K, V>>,
}

impl<K, V> BlockingProvider<K, V> {
    pub(crate) fn new(inner: Arc<dyn CacheProvider<K, V>>) -> Self {
        Self { inner }
    }
}

#[async_trait]
impl<K, V> AsyncCacheProvider<K, V> for BlockingProvider<K, V>
where
    K: Send + Sync + 'static,
    V: Send + 'static,
{
    async fn get(&self, key: &K) -> CacheResult<Option<V>> {
        self.inner.get(key)
    }

    async fn set(&self, key: &K, value: V, ttl: Option<Duration>) -> CacheResult<()> {
        self.inner.set(key, value, ttl)
    }

    async fn remove(&self, key: &K) -> CacheResult<()> {
        self.inner.remove(key)
    }
}

#[derive(Clone)]
struct ProviderEntry<V> {
    value: V,
    expires_at: Option<Instant>,
}

impl<V> ProviderEntry<V> {
    fn is_expired(&self, now: Instant) -> bool {
        self.expires_at.is_some_and(|exp| now >= exp)
    }
}

/// In-process provider honoring per-entry TTLs.
///
/// Useful to share one store between several memoizers, or as a test double
/// for a remote store.
pub struct InMemoryProvider<K, V> {
    data: Arc<Mutex<HashMap<K, ProviderEntry<V>>>>,
}

impl<K, V> InMemoryProvider<K, V>
where
    K: Hash + Eq,
{
    /// Create a new in-memory provider
    pub fn new() -> Self {
        Self {
            data: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Number of stored entries, expired ones included until they are read.
    pub fn len(&self) -> usize {
        self.data.lock().len()
    }

    /// Whether the provider holds no entries.
    pub fn is_empty(&self) -> bool {
        self.data.lock().is_empty()
    }

    /// Drop expired entries.
    pub fn cleanup_expired(&self) {
        let now = Instant::now();
        self.data.lock().retain(|_, entry| !entry.is_expired(now));
    }
}

impl<K, V> Default for InMemoryProvider<K, V>
where
    K: Hash + Eq,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<K, V> Clone for InMemoryProvider<K, V> {
    fn clone(&self) -> Self {
        Self {
            data: Arc::clone(&self.data),
        }
    }
}

impl<K, V> CacheProvider<K, V> for InMemoryProvider<K, V>
where
    K: Hash + Eq + Clone + Send + Sync,
    V: Clone + Send + Sync,
{
    fn get(&self, key: &K) -> CacheResult<Option<V>> {
        let mut data = self.data.lock();
        match data.get(key) {
            Some(entry) if entry.is_expired(Instant::now()) => {
                data.remove(key);
                Ok(None)
            }
            Some(entry) => Ok(Some(entry.value.clone())),
            None => Ok(None),
        }
    }

    fn set(&self, key: &K, value: V, ttl: Option<Duration>) -> CacheResult<()> {
        let expires_at = ttl.and_then(|d| Instant::now().checked_add(d));
        self.data
            .lock()
            .insert(key.clone(), ProviderEntry { value, expires_at });
        Ok(())
    }

    fn remove(&self, key: &K) -> CacheResult<()> {
        self.data.lock().remove(key);
        Ok(())
    }
}

#[async_trait]
impl<K, V> AsyncCacheProvider<K, V> for InMemoryProvider<K, V>
where
    K: Hash + Eq + Clone + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    async fn get(&self, key: &K) -> CacheResult<Option<V>> {
        CacheProvider::get(self, key)
    }

    async fn set(&self, key: &K, value: V, ttl: Option<Duration>) -> CacheResult<()> {
        CacheProvider::set(self, key, value, ttl)
    }

    async fn remove(&self, key: &K) -> CacheResult<()> {
        CacheProvider::remove(self, key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_in_memory_provider_ttl() {
        let provider: InMemoryProvider<String, u32> = InMemoryProvider::new();

        CacheProvider::set(&provider, &"a".to_string(), 1, Some(Duration::from_secs(1))).unwrap();
        CacheProvider::set(&provider, &"b".to_string(), 2, None).unwrap();
        assert_eq!(CacheProvider::get(&provider, &"a".to_string()).unwrap(), Some(1));

        tokio::time::advance(Duration::from_secs(1)).await;

        assert_eq!(CacheProvider::get(&provider, &"a".to_string()).unwrap(), None);
        assert_eq!(CacheProvider::get(&provider, &"b".to_string()).unwrap(), Some(2));
        assert_eq!(provider.len(), 1);
    }

    #[tokio::test]
    async fn test_in_memory_provider_async_remove() {
        let provider: InMemoryProvider<u64, &'static str> = InMemoryProvider::new();

        AsyncCacheProvider::set(&provider, &7, "seven", None).await.unwrap();
        assert_eq!(AsyncCacheProvider::get(&provider, &7).await.unwrap(), Some("seven"));

        AsyncCacheProvider::remove(&provider, &7).await.unwrap();
        assert_eq!(AsyncCacheProvider::get(&provider, &7).await.unwrap(), None);
        assert!(provider.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_cleanup_expired() {
        let provider: InMemoryProvider<u8, u8> = InMemoryProvider::new();
        CacheProvider::set(&provider, &1, 1, Some(Duration::from_millis(5))).unwrap();
        CacheProvider::set(&provider, &2, 2, None).unwrap();

        tokio::time::advance(Duration::from_millis(5)).await;
        provider.cleanup_expired();

        assert_eq!(provider.len(), 1);
    }

    #[tokio::test]
    async fn test_blocking_provider_adapter() {
        let inner = InMemoryProvider::<u8, u8>::new();
        let adapter = BlockingProvider::new(Arc::new(inner.clone()));

        adapter.set(&1, 10, None).await.unwrap();
        assert_eq!(CacheProvider::get(&inner, &1).unwrap(), Some(10));
    }
}
