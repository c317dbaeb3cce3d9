//! Async memoizers with single-flight deduplication.
//!
//! The first caller for an uncached key installs a shared in-flight
//! computation; every concurrent caller for that key awaits the same
//! computation instead of invoking the function again. On success the
//! value replaces the in-flight entry, on failure the entry is removed and
//! nothing is cached. Both happen under the same lock that callers use to
//! join, so a late joiner never observes a settled-but-still-registered
//! flight.
//!
//! A caller that is dropped mid-flight does not abandon the computation:
//! the next caller for the key picks it up where it stopped.
//!
//! # Examples
//!
//! ```no_run
//! use bulwark_cache::{memoize_result_async_with, MemoizeOptions};
//! use std::time::Duration;
//!
//! # async fn fetch_profile(id: u64) -> Result<String, String> { Ok(id.to_string()) }
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let profiles = memoize_result_async_with(
//!     fetch_profile,
//!     MemoizeOptions::new()
//!         .with_expiration(Duration::from_secs(300))
//!         .with_max_size(10_000),
//! )?;
//!
//! let profile = profiles.call(42).await?;
//! # Ok(())
//! # }
//! ```

use crate::error::CacheResult;
use crate::options::MemoizeOptions;
use crate::provider::{AsyncCacheProvider, BlockingProvider};
use crate::store::{CacheStats, LocalStore, StatsRecorder};
use futures::future::{BoxFuture, FutureExt, Shared};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::convert::Infallible;
use std::fmt;
use std::future::Future;
use std::hash::Hash;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::OnceCell;
use tracing::{debug, warn};

type Flight<V, E> = Shared<BoxFuture<'static, Result<V, E>>>;

struct FlightState<K, V, E> {
    store: LocalStore<K, V>,
    in_flight: HashMap<K, (u64, Flight<V, E>)>,
    next_id: u64,
}

/// Keyed cache with single-flight computation.
struct SingleFlight<K, V, E> {
    state: Mutex<FlightState<K, V, E>>,
    provider: Option<Arc<dyn AsyncCacheProvider<K, V>>>,
    ttl: Option<Duration>,
    stats: StatsRecorder,
}

impl<K, V, E> SingleFlight<K, V, E>
where
    K: Hash + Eq + Clone + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
    E: Clone + Send + Sync + 'static,
{
    fn local() -> Self {
        Self {
            state: Mutex::new(FlightState {
                store: LocalStore::new(None, None),
                in_flight: HashMap::new(),
                next_id: 0,
            }),
            provider: None,
            ttl: None,
            stats: StatsRecorder::default(),
        }
    }

    fn new(options: MemoizeOptions<K, V>) -> CacheResult<Self> {
        options.validate()?;

        let provider = match (options.async_cache_provider, options.cache_provider) {
            (Some(provider), _) => Some(provider),
            (None, Some(blocking)) => {
                Some(Arc::new(BlockingProvider::new(blocking)) as Arc<dyn AsyncCacheProvider<K, V>>)
            }
            (None, None) => None,
        };

        Ok(Self {
            state: Mutex::new(FlightState {
                store: LocalStore::new(options.max_size, options.expiration),
                in_flight: HashMap::new(),
                next_id: 0,
            }),
            provider,
            ttl: options.expiration,
            stats: StatsRecorder::default(),
        })
    }

    async fn get_or_compute<M, Fut>(self: &Arc<Self>, key: K, make: M) -> Result<V, E>
    where
        M: FnOnce(K) -> Fut + Send + 'static,
        Fut: Future<Output = Result<V, E>> + Send + 'static,
    {
        let flight = {
            let mut state = self.state.lock();

            if self.provider.is_none()
                && let Some(value) = state.store.get(&key)
            {
                self.stats.hit();
                return Ok(value);
            }

            match state.in_flight.get(&key) {
                Some((_, flight)) => {
                    self.stats.hit();
                    flight.clone()
                }
                None => {
                    let id = state.next_id;
                    state.next_id += 1;
                    let flight = Arc::clone(self)
                        .fly(id, key.clone(), make)
                        .boxed()
                        .shared();
                    state.in_flight.insert(key, (id, flight.clone()));
                    flight
                }
            }
        };

        flight.await
    }

    async fn fly<M, Fut>(self: Arc<Self>, id: u64, key: K, make: M) -> Result<V, E>
    where
        M: FnOnce(K) -> Fut + Send + 'static,
        Fut: Future<Output = Result<V, E>> + Send + 'static,
    {
        if let Some(provider) = &self.provider {
            match provider.get(&key).await {
                Ok(Some(value)) => {
                    self.stats.hit();
                    self.land(id, &key, None);
                    return Ok(value);
                }
                Ok(None) => {}
                Err(e) => warn!(error = %e, "Cache provider read failed, treating as miss"),
            }
        }

        self.stats.miss();
        let result = make(key.clone()).await;

        if let (Some(provider), Ok(value)) = (&self.provider, &result)
            && let Err(e) = provider.set(&key, value.clone(), self.ttl).await
        {
            warn!(error = %e, "Cache provider write failed, value not cached");
        }

        self.land(id, &key, result.as_ref().ok());
        result
    }

    /// Retire flight `id`, caching `value` in the local store.
    ///
    /// A flight displaced by `invalidate` or `clear` leaves no trace.
    fn land(&self, id: u64, key: &K, value: Option<&V>) {
        let mut state = self.state.lock();
        let current = state
            .in_flight
            .get(key)
            .is_some_and(|(flight_id, _)| *flight_id == id);
        if !current {
            debug!("Discarding result of a displaced flight");
            return;
        }

        state.in_flight.remove(key);
        if self.provider.is_none()
            && let Some(value) = value
        {
            state.store.insert(key.clone(), value.clone());
        }
    }

    async fn invalidate(&self, key: &K) {
        {
            let mut state = self.state.lock();
            state.store.remove(key);
            state.in_flight.remove(key);
        }
        if let Some(provider) = &self.provider
            && let Err(e) = provider.remove(key).await
        {
            warn!(error = %e, "Cache provider remove failed");
        }
    }

    fn clear(&self) {
        let mut state = self.state.lock();
        state.store.clear();
        state.in_flight.clear();
    }

    fn len(&self) -> usize {
        self.state.lock().store.len()
    }

    fn in_flight(&self) -> usize {
        self.state.lock().in_flight.len()
    }
}

/// An async function whose results are cached by argument.
pub struct AsyncMemoized<K, V, F> {
    func: Arc<F>,
    flight: Arc<SingleFlight<K, V, Infallible>>,
}

impl<K, V, F, Fut> AsyncMemoized<K, V, F>
where
    K: Hash + Eq + Clone + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
    F: Fn(K) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = V> + Send + 'static,
{
    /// Cached value for `key`; concurrent misses share one invocation.
    pub async fn call(&self, key: K) -> V {
        let func = Arc::clone(&self.func);
        let result = self
            .flight
            .get_or_compute(key, move |key| async move { Ok(func(key).await) })
            .await;
        match result {
            Ok(value) => value,
            Err(never) => match never {},
        }
    }

    /// Drop the entry for `key`, in the provider too when one is configured.
    pub async fn invalidate(&self, key: &K) {
        self.flight.invalidate(key).await;
    }

    /// Drop every in-process entry and in-flight computation.
    pub fn clear(&self) {
        self.flight.clear();
    }

    /// Number of in-process entries, zero when a cache provider is used.
    pub fn len(&self) -> usize {
        self.flight.len()
    }

    /// Whether nothing is cached.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of keys currently being computed.
    pub fn in_flight(&self) -> usize {
        self.flight.in_flight()
    }

    /// Get hit and miss counts.
    pub fn stats(&self) -> CacheStats {
        self.flight.stats.snapshot()
    }
}

impl<K, V, F> Clone for AsyncMemoized<K, V, F> {
    fn clone(&self) -> Self {
        Self {
            func: Arc::clone(&self.func),
            flight: Arc::clone(&self.flight),
        }
    }
}

impl<K, V, F> fmt::Debug for AsyncMemoized<K, V, F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AsyncMemoized")
            .field("stats", &self.flight.stats.snapshot())
            .finish_non_exhaustive()
    }
}

/// An async fallible function whose successful results are cached by argument.
///
/// Concurrent callers of a failing flight all receive its error; the next
/// call after that computes again.
pub struct AsyncMemoizedResult<K, V, E, F> {
    func: Arc<F>,
    flight: Arc<SingleFlight<K, V, E>>,
}

impl<K, V, E, F, Fut> AsyncMemoizedResult<K, V, E, F>
where
    K: Hash + Eq + Clone + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
    E: Clone + Send + Sync + 'static,
    F: Fn(K) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<V, E>> + Send + 'static,
{
    /// Cached value for `key`; concurrent misses share one invocation.
    pub async fn call(&self, key: K) -> Result<V, E> {
        let func = Arc::clone(&self.func);
        self.flight.get_or_compute(key, move |key| func(key)).await
    }

    /// Drop the entry for `key`, in the provider too when one is configured.
    pub async fn invalidate(&self, key: &K) {
        self.flight.invalidate(key).await;
    }

    /// Drop every in-process entry and in-flight computation.
    pub fn clear(&self) {
        self.flight.clear();
    }

    /// Number of cached entries.
    pub fn len(&self) -> usize {
        self.flight.len()
    }

    /// Whether nothing is cached.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of keys with a computation in flight.
    pub fn in_flight(&self) -> usize {
        self.flight.in_flight()
    }

    /// Get hit and miss counts.
    pub fn stats(&self) -> CacheStats {
        self.flight.stats.snapshot()
    }
}

impl<K, V, E, F> Clone for AsyncMemoizedResult<K, V, E, F> {
    fn clone(&self) -> Self {
        Self {
            func: Arc::clone(&self.func),
            flight: Arc::clone(&self.flight),
        }
    }
}

impl<K, V, E, F> fmt::Debug for AsyncMemoizedResult<K, V, E, F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AsyncMemoizedResult")
            .field("stats", &self.flight.stats.snapshot())
            .finish_non_exhaustive()
    }
}

/// A zero-argument async function evaluated at most once.
pub struct AsyncMemoizedOnce<V, F> {
    func: F,
    cell: OnceCell<V>,
}

impl<V, F, Fut> AsyncMemoizedOnce<V, F>
where
    F: Fn() -> Fut,
    Fut: Future<Output = V>,
{
    /// The value; concurrent first callers wait for a single computation.
    pub async fn get(&self) -> &V {
        self.cell.get_or_init(|| (self.func)()).await
    }

    /// Whether the value has been computed.
    pub fn is_initialized(&self) -> bool {
        self.cell.initialized()
    }
}

/// A zero-argument async fallible function whose first success is kept.
pub struct AsyncMemoizedResultOnce<V, F> {
    func: F,
    cell: OnceCell<V>,
}

impl<V, E, F, Fut> AsyncMemoizedResultOnce<V, F>
where
    F: Fn() -> Fut,
    Fut: Future<Output = Result<V, E>>,
{
    /// The value, or the error of this attempt. A failed attempt is retried by the next caller.
    pub async fn get(&self) -> Result<&V, E> {
        self.cell.get_or_try_init(|| (self.func)()).await
    }

    /// Whether the value has been computed.
    pub fn is_initialized(&self) -> bool {
        self.cell.initialized()
    }
}

/// Memoize an async function of one argument with an unbounded in-process cache.
pub fn memoize_async<K, V, F, Fut>(func: F) -> AsyncMemoized<K, V, F>
where
    K: Hash + Eq + Clone + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
    F: Fn(K) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = V> + Send + 'static,
{
    AsyncMemoized {
        func: Arc::new(func),
        flight: Arc::new(SingleFlight::local()),
    }
}

/// Memoize an async function of one argument with custom options.
pub fn memoize_async_with<K, V, F, Fut>(
    func: F,
    options: MemoizeOptions<K, V>,
) -> CacheResult<AsyncMemoized<K, V, F>>
where
    K: Hash + Eq + Clone + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
    F: Fn(K) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = V> + Send + 'static,
{
    Ok(AsyncMemoized {
        func: Arc::new(func),
        flight: Arc::new(SingleFlight::new(options)?),
    })
}

/// Memoize the successes of an async fallible function with an unbounded in-process cache.
pub fn memoize_result_async<K, V, E, F, Fut>(func: F) -> AsyncMemoizedResult<K, V, E, F>
where
    K: Hash + Eq + Clone + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
    E: Clone + Send + Sync + 'static,
    F: Fn(K) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<V, E>> + Send + 'static,
{
    AsyncMemoizedResult {
        func: Arc::new(func),
        flight: Arc::new(SingleFlight::local()),
    }
}

/// Memoize the successes of an async fallible function with custom options.
pub fn memoize_result_async_with<K, V, E, F, Fut>(
    func: F,
    options: MemoizeOptions<K, V>,
) -> CacheResult<AsyncMemoizedResult<K, V, E, F>>
where
    K: Hash + Eq + Clone + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
    E: Clone + Send + Sync + 'static,
    F: Fn(K) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<V, E>> + Send + 'static,
{
    Ok(AsyncMemoizedResult {
        func: Arc::new(func),
        flight: Arc::new(SingleFlight::new(options)?),
    })
}

/// Memoize a zero-argument async function.
pub fn memoize_once_async<V, F, Fut>(func: F) -> AsyncMemoizedOnce<V, F>
where
    F: Fn() -> Fut,
    Fut: Future<Output = V>,
{
    AsyncMemoizedOnce {
        func,
        cell: OnceCell::new(),
    }
}

/// Memoize the first success of a zero-argument async fallible function.
pub fn memoize_result_once_async<V, E, F, Fut>(func: F) -> AsyncMemoizedResultOnce<V, F>
where
    F: Fn() -> Fut,
    Fut: Future<Output = Result<V, E>>,
{
    AsyncMemoizedResultOnce {
        func,
        cell: OnceCell::new(),
    }
}
