//! Core fault-tolerance policies for Bulwark.
//!
//! This crate provides the error taxonomy shared by every Bulwark crate and
//! the resilience policies: timeout, retry, circuit breaker, bulkhead and
//! their composition into a [`ResiliencePolicy`].

pub mod error;
pub mod logging;
pub mod resilience;

pub use error::{Cancelled, ConfigError, Error, ErrorDetail, ErrorKind, Guarded, Outcome};
pub use resilience::{
    Backoff, Bulkhead, BulkheadConfig, BulkheadStats, CircuitBreaker, CircuitBreakerConfig,
    CircuitBreakerStats, CircuitState, ResiliencePolicy, ResiliencePolicyBuilder, RetryConfig,
    RetryPolicy, TimeoutConfig, TimeoutPolicy,
};
pub use tokio_util::sync::CancellationToken;
