//! Memoizer configuration.

use crate::error::{CacheError, CacheResult};
use crate::provider::{AsyncCacheProvider, CacheProvider};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

/// Memoizer options.
///
/// Validated when the memoizer is created.
///
/// # Examples
///
/// ```
/// use bulwark_cache::MemoizeOptions;
/// use std::time::Duration;
///
/// let options: MemoizeOptions<u64, String> = MemoizeOptions::new()
///     .with_expiration(Duration::from_secs(60))
///     .with_max_size(1_000);
/// ```
pub struct MemoizeOptions<K, V> {
    /// Time an entry stays usable after insertion
    pub expiration: Option<Duration>,

    /// Maximum number of entries; the least recently used is evicted first
    pub max_size: Option<usize>,

    /// Blocking store replacing the in-process map
    pub cache_provider: Option<Arc<dyn CacheProvider<K, V>>>,

    /// Non-blocking store replacing the in-process map (async memoizers only)
    pub async_cache_provider: Option<Arc<dyn AsyncCacheProvider<K, V>>>,
}

impl<K, V> MemoizeOptions<K, V> {
    /// Create options with no limits and the in-process store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Expire entries this long after insertion.
    pub fn with_expiration(mut self, expiration: Duration) -> Self {
        self.expiration = Some(expiration);
        self
    }

    /// Bound the number of in-process entries.
    pub fn with_max_size(mut self, max_size: usize) -> Self {
        self.max_size = Some(max_size);
        self
    }

    /// Store entries in a blocking provider.
    pub fn with_cache_provider(mut self, provider: Arc<dyn CacheProvider<K, V>>) -> Self {
        self.cache_provider = Some(provider);
        self
    }

    /// Store entries in a non-blocking provider.
    pub fn with_async_cache_provider(mut self, provider: Arc<dyn AsyncCacheProvider<K, V>>) -> Self {
        self.async_cache_provider = Some(provider);
        self
    }

    pub(crate) fn validate(&self) -> CacheResult<()> {
        if self.max_size == Some(0) {
            return Err(CacheError::InvalidOption(
                "max_size must be greater than zero".to_string(),
            ));
        }
        if self.expiration.is_some_and(|d| d.is_zero()) {
            return Err(CacheError::InvalidOption(
                "expiration must be greater than zero".to_string(),
            ));
        }
        if self.cache_provider.is_some() && self.async_cache_provider.is_some() {
            return Err(CacheError::InvalidOption(
                "at most one cache provider may be configured".to_string(),
            ));
        }
        Ok(())
    }
}

impl<K, V> Default for MemoizeOptions<K, V> {
    fn default() -> Self {
        Self {
            expiration: None,
            max_size: None,
            cache_provider: None,
            async_cache_provider: None,
        }
    }
}

impl<K, V> Clone for MemoizeOptions<K, V> {
    fn clone(&self) -> Self {
        Self {
            expiration: self.expiration,
            max_size: self.max_size,
            cache_provider: self.cache_provider.clone(),
            async_cache_provider: self.async_cache_provider.clone(),
        }
    }
}

impl<K, V> fmt::Debug for MemoizeOptions<K, V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemoizeOptions")
            .field("expiration", &self.expiration)
            .field("max_size", &self.max_size)
            .field("cache_provider", &self.cache_provider.is_some())
            .field("async_cache_provider", &self.async_cache_provider.is_some())
            .finish()
    }
}
