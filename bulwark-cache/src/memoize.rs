//! Blocking memoizers.
//!
//! Concurrent first calls for the same unseen key may each invoke the
//! function; every caller converges on one cached value afterwards. The
//! memoized function must therefore be pure. Use the async memoizers for
//! strict single-flight.
//!
//! # Examples
//!
//! ```
//! use bulwark_cache::{memoize, memoize_with, MemoizeOptions};
//!
//! let square = memoize(|n: u64| n * n);
//! assert_eq!(square.call(12), 144);
//!
//! // Multiple arguments are keyed by a tuple.
//! let area = memoize_with(
//!     |(w, h): (u32, u32)| w * h,
//!     MemoizeOptions::new().with_max_size(128),
//! ).unwrap();
//! assert_eq!(area.call((3, 4)), 12);
//! ```

use crate::error::{CacheError, CacheResult};
use crate::options::MemoizeOptions;
use crate::provider::CacheProvider;
use crate::store::{CacheStats, LocalStore, StatsRecorder};
use once_cell::sync::OnceCell;
use parking_lot::Mutex;
use std::fmt;
use std::hash::Hash;
use std::sync::Arc;
use std::time::Duration;
use tracing::warn;

enum SyncBackend<K, V> {
    Local(Mutex<LocalStore<K, V>>),
    Provider {
        provider: Arc<dyn CacheProvider<K, V>>,
        ttl: Option<Duration>,
    },
}

/// Keyed cache state shared by [`Memoized`] and [`MemoizedResult`].
struct SyncCache<K, V> {
    backend: SyncBackend<K, V>,
    stats: StatsRecorder,
}

impl<K, V> SyncCache<K, V>
where
    K: Hash + Eq + Clone,
    V: Clone,
{
    fn new(options: MemoizeOptions<K, V>) -> CacheResult<Self> {
        options.validate()?;
        if options.async_cache_provider.is_some() {
            return Err(CacheError::InvalidOption(
                "an async cache provider requires an async memoizer".to_string(),
            ));
        }

        let backend = match options.cache_provider {
            Some(provider) => SyncBackend::Provider {
                provider,
                ttl: options.expiration,
            },
            None => SyncBackend::Local(Mutex::new(LocalStore::new(
                options.max_size,
                options.expiration,
            ))),
        };

        Ok(Self {
            backend,
            stats: StatsRecorder::default(),
        })
    }

    fn lookup(&self, key: &K) -> Option<V> {
        let found = match &self.backend {
            SyncBackend::Local(store) => store.lock().get(key),
            SyncBackend::Provider { provider, .. } => match provider.get(key) {
                Ok(found) => found,
                Err(e) => {
                    warn!(error = %e, "Cache provider read failed, treating as miss");
                    None
                }
            },
        };
        match found {
            Some(_) => self.stats.hit(),
            None => self.stats.miss(),
        }
        found
    }

    fn store(&self, key: K, value: V) {
        match &self.backend {
            SyncBackend::Local(store) => store.lock().insert(key, value),
            SyncBackend::Provider { provider, ttl } => {
                if let Err(e) = provider.set(&key, value, *ttl) {
                    warn!(error = %e, "Cache provider write failed, value not cached");
                }
            }
        }
    }

    fn invalidate(&self, key: &K) {
        match &self.backend {
            SyncBackend::Local(store) => store.lock().remove(key),
            SyncBackend::Provider { provider, .. } => {
                if let Err(e) = provider.remove(key) {
                    warn!(error = %e, "Cache provider remove failed");
                }
            }
        }
    }

    fn clear(&self) {
        if let SyncBackend::Local(store) = &self.backend {
            store.lock().clear();
        }
    }

    fn len(&self) -> usize {
        match &self.backend {
            SyncBackend::Local(store) => store.lock().len(),
            SyncBackend::Provider { .. } => 0,
        }
    }
}

/// A function whose results are cached by argument.
pub struct Memoized<K, V, F> {
    func: F,
    cache: SyncCache<K, V>,
}

impl<K, V, F> Memoized<K, V, F>
where
    K: Hash + Eq + Clone,
    V: Clone,
    F: Fn(K) -> V,
{
    /// Cached value for `key`, computing it on a miss.
    pub fn call(&self, key: K) -> V {
        if let Some(value) = self.cache.lookup(&key) {
            return value;
        }
        let value = (self.func)(key.clone());
        self.cache.store(key, value.clone());
        value
    }

    /// Drop the entry for `key`.
    pub fn invalidate(&self, key: &K) {
        self.cache.invalidate(key);
    }

    /// Drop every in-process entry. Entries held by a cache provider are kept.
    pub fn clear(&self) {
        self.cache.clear();
    }

    /// Number of in-process entries, zero when a cache provider is used.
    pub fn len(&self) -> usize {
        self.cache.len()
    }

    /// Whether nothing is cached.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Get hit and miss counts.
    pub fn stats(&self) -> CacheStats {
        self.cache.stats.snapshot()
    }
}

impl<K, V, F> fmt::Debug for Memoized<K, V, F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Memoized")
            .field("stats", &self.cache.stats.snapshot())
            .finish_non_exhaustive()
    }
}

/// A fallible function whose successful results are cached by argument.
///
/// Errors are returned to the caller and never cached.
pub struct MemoizedResult<K, V, F> {
    func: F,
    cache: SyncCache<K, V>,
}

impl<K, V, F> MemoizedResult<K, V, F>
where
    K: Hash + Eq + Clone,
    V: Clone,
{
    /// Cached value for `key`, computing it on a miss.
    pub fn call<E>(&self, key: K) -> Result<V, E>
    where
        F: Fn(K) -> Result<V, E>,
    {
        if let Some(value) = self.cache.lookup(&key) {
            return Ok(value);
        }
        let value = (self.func)(key.clone())?;
        self.cache.store(key, value.clone());
        Ok(value)
    }

    /// Drop the cached value for `key`.
    pub fn invalidate(&self, key: &K) {
        self.cache.invalidate(key);
    }

    /// Drop every in-process entry. Entries held by a cache provider are kept.
    pub fn clear(&self) {
        self.cache.clear();
    }

    /// Number of cached entries.
    pub fn len(&self) -> usize {
        self.cache.len()
    }

    /// Whether nothing is cached.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Get hit and miss counts.
    pub fn stats(&self) -> CacheStats {
        self.cache.stats.snapshot()
    }
}

impl<K, V, F> fmt::Debug for MemoizedResult<K, V, F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemoizedResult")
            .field("stats", &self.cache.stats.snapshot())
            .finish_non_exhaustive()
    }
}

/// A zero-argument function evaluated at most once.
pub struct MemoizedOnce<V, F> {
    func: F,
    cell: OnceCell<V>,
}

impl<V, F> MemoizedOnce<V, F>
where
    F: Fn() -> V,
{
    /// The value, computed by the first caller; concurrent callers block until it is ready.
    pub fn get(&self) -> &V {
        self.cell.get_or_init(|| (self.func)())
    }

    /// Whether the value has been computed.
    pub fn is_initialized(&self) -> bool {
        self.cell.get().is_some()
    }
}

/// A fallible zero-argument function whose first success is kept.
pub struct MemoizedResultOnce<V, F> {
    func: F,
    cell: OnceCell<V>,
}

impl<V, F> MemoizedResultOnce<V, F> {
    /// The value, or the error of this attempt. A failed attempt is retried by the next caller.
    pub fn get<E>(&self) -> Result<&V, E>
    where
        F: Fn() -> Result<V, E>,
    {
        self.cell.get_or_try_init(|| (self.func)())
    }

    /// Whether the value has been computed.
    pub fn is_initialized(&self) -> bool {
        self.cell.get().is_some()
    }
}

/// Memoize a function of one argument with an unbounded in-process cache.
pub fn memoize<K, V, F>(func: F) -> Memoized<K, V, F>
where
    K: Hash + Eq + Clone,
    V: Clone,
    F: Fn(K) -> V,
{
    Memoized {
        func,
        cache: SyncCache {
            backend: SyncBackend::Local(Mutex::new(LocalStore::new(None, None))),
            stats: StatsRecorder::default(),
        },
    }
}

/// Memoize a function of one argument with custom options.
pub fn memoize_with<K, V, F>(func: F, options: MemoizeOptions<K, V>) -> CacheResult<Memoized<K, V, F>>
where
    K: Hash + Eq + Clone,
    V: Clone,
    F: Fn(K) -> V,
{
    Ok(Memoized {
        func,
        cache: SyncCache::new(options)?,
    })
}

/// Memoize the successes of a fallible function with an unbounded in-process cache.
pub fn memoize_result<K, V, E, F>(func: F) -> MemoizedResult<K, V, F>
where
    K: Hash + Eq + Clone,
    V: Clone,
    F: Fn(K) -> Result<V, E>,
{
    MemoizedResult {
        func,
        cache: SyncCache {
            backend: SyncBackend::Local(Mutex::new(LocalStore::new(None, None))),
            stats: StatsRecorder::default(),
        },
    }
}

/// Memoize the successes of a fallible function with custom options.
pub fn memoize_result_with<K, V, E, F>(
    func: F,
    options: MemoizeOptions<K, V>,
) -> CacheResult<MemoizedResult<K, V, F>>
where
    K: Hash + Eq + Clone,
    V: Clone,
    F: Fn(K) -> Result<V, E>,
{
    Ok(MemoizedResult {
        func,
        cache: SyncCache::new(options)?,
    })
}

/// Memoize a zero-argument function.
pub fn memoize_once<V, F>(func: F) -> MemoizedOnce<V, F>
where
    F: Fn() -> V,
{
    MemoizedOnce {
        func,
        cell: OnceCell::new(),
    }
}

/// Memoize the first success of a fallible zero-argument function.
pub fn memoize_result_once<V, E, F>(func: F) -> MemoizedResultOnce<V, F>
where
    F: Fn() -> Result<V, E>,
{
    MemoizedResultOnce {
        func,
        cell: OnceCell::new(),
    }
}
