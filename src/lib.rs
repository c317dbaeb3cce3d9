// Bulwark - composable fault-tolerance policies and memoization for async Rust
//
// This library wraps fallible async operations in timeout, retry, circuit
// breaker and bulkhead policies, and caches function results with
// single-flight deduplication.

// Re-export core functionality
pub use bulwark_core::*;

// Re-export optional crates
#[cfg(feature = "cache")]
pub use bulwark_cache;

#[cfg(feature = "config")]
pub use bulwark_config;

// Prelude for common imports
pub mod prelude {
    pub use crate::{
        Backoff,
        BulkheadConfig,
        CancellationToken,
        Cancelled,
        CircuitBreaker,
        CircuitBreakerConfig,
        CircuitState,
        Error,
        Guarded,
        Outcome,
        ResiliencePolicy,
        RetryConfig,
        TimeoutConfig,
    };

    #[cfg(feature = "cache")]
    pub use bulwark_cache::{
        MemoizeOptions, memoize, memoize_async, memoize_async_with, memoize_result,
        memoize_result_async, memoize_result_async_with, memoize_with,
    };

    #[cfg(feature = "config")]
    pub use bulwark_config::{BulwarkSettings, SettingsLoader};
}
