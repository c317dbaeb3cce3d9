//! Function memoization for Bulwark.
//!
//! Wraps a function so repeated calls with the same argument are served
//! from a cache instead of recomputing, with optional expiration, a bounded
//! size with least-recently-used eviction, and pluggable external stores.
//!
//! # Features
//!
//! - **Sync and async memoizers** - `memoize*` and `memoize*_async` families
//! - **Single-flight** - concurrent async callers for one key share one invocation
//! - **Errors are never cached** - `*_result*` variants only keep successes
//! - **Cache providers** - replace the in-process map with any [`CacheProvider`]
//!   or [`AsyncCacheProvider`]
//!
//! # Examples
//!
//! ## Sync memoization
//!
//! ```
//! use bulwark_cache::memoize;
//!
//! let square = memoize(|n: u64| n * n);
//!
//! assert_eq!(square.call(12), 144);
//! assert_eq!(square.call(12), 144);
//! assert_eq!(square.stats().hits, 1);
//! ```
//!
//! ## Async memoization with expiration
//!
//! ```no_run
//! use bulwark_cache::*;
//! use std::time::Duration;
//!
//! # async fn load_user(id: u64) -> Result<String, String> { Ok(format!("user {id}")) }
//! # async fn example() -> CacheResult<()> {
//! let users = memoize_result_async_with(
//!     load_user,
//!     MemoizeOptions::new().with_expiration(Duration::from_secs(60)),
//! )?;
//!
//! // Concurrent callers for user 7 share a single load
//! let (a, b) = tokio::join!(users.call(7), users.call(7));
//! assert_eq!(a, b);
//! # Ok(())
//! # }
//! ```
//!
//! ## Shared store
//!
//! ```
//! use bulwark_cache::*;
//! use std::sync::Arc;
//!
//! # fn example() -> CacheResult<()> {
//! let store = Arc::new(InMemoryProvider::<String, usize>::new());
//!
//! let length = memoize_with(
//!     |s: String| s.len(),
//!     MemoizeOptions::<String, usize>::new().with_cache_provider(store.clone()),
//! )?;
//!
//! length.call("bulwark".to_string());
//! assert_eq!(store.len(), 1);
//! # Ok(())
//! # }
//! ```

pub mod error;
pub mod memoize;
pub mod memoize_async;
pub mod options;
pub mod provider;
pub mod store;

pub use error::{CacheError, CacheResult};
pub use memoize::{
    Memoized, MemoizedOnce, MemoizedResult, MemoizedResultOnce, memoize, memoize_once,
    memoize_result, memoize_result_once, memoize_result_with, memoize_with,
};
pub use memoize_async::{
    AsyncMemoized, AsyncMemoizedOnce, AsyncMemoizedResult, AsyncMemoizedResultOnce,
    memoize_async, memoize_async_with, memoize_once_async, memoize_result_async,
    memoize_result_async_with, memoize_result_once_async,
};
pub use options::MemoizeOptions;
pub use provider::{AsyncCacheProvider, CacheProvider, InMemoryProvider};
pub use store::CacheStats;

/// Re-export commonly used types
pub mod prelude {
    pub use crate::error::{CacheError, CacheResult};
    pub use crate::memoize::{memoize, memoize_once, memoize_result, memoize_with};
    pub use crate::memoize_async::{memoize_async, memoize_async_with, memoize_result_async};
    pub use crate::options::MemoizeOptions;
    pub use crate::provider::{AsyncCacheProvider, CacheProvider, InMemoryProvider};
}
