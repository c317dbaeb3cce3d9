//! # Resilience Patterns
//!
//! Fault-tolerance policies for calls to unreliable dependencies.
//!
//! ## Patterns Included
//!
//! - **Timeout**: Race an operation against a deadline
//! - **Retry**: Automatic retry with configurable backoff strategies
//! - **Circuit Breaker**: Prevent cascade failures by failing fast
//! - **Bulkhead**: Bounded concurrency with an optional wait queue
//! - **ResiliencePolicy**: All of the above composed in a fixed order
//!
//! Every policy offers `execute(op)`, which returns an [`Outcome`], and
//! `execute_with_cancel(op, &token)`, which additionally reports caller
//! cancellation as [`Cancelled`](crate::error::Cancelled).
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use bulwark::resilience::{CircuitBreaker, CircuitBreakerConfig};
//! use std::time::Duration;
//!
//! // Circuit breaker that opens after 5 consecutive failures
//! let circuit = CircuitBreaker::new(
//!     CircuitBreakerConfig::new("api")
//!         .with_failure_threshold(5)
//!         .with_reset_timeout(Duration::from_secs(30)),
//! )?;
//!
//! let result = circuit.execute(|| async {
//!     external_api_call().await
//! }).await;
//! ```

mod backoff;
mod bulkhead;
mod circuit_breaker;
mod policy;
mod retry;
mod timeout;

pub use backoff::*;
pub use bulkhead::*;
pub use circuit_breaker::*;
pub use policy::*;
pub use retry::*;
pub use timeout::*;

use crate::error::{Error, Guarded, Outcome};

/// Flatten the result of a call made with a token owned by the caller.
///
/// The token passed down by `execute` is never cancelled, so `Cancelled`
/// can only come from a bug in a policy.
pub(crate) fn settle<T>(guarded: Guarded<T>) -> Outcome<T> {
    guarded.unwrap_or_else(|cancelled| Err(Error::internal(cancelled.to_string())))
}
