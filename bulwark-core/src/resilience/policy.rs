//! Composition of the individual policies into one pipeline.
//!
//! Layers may be configured in any order; [`ResiliencePolicyBuilder::build`]
//! always nests them the same way, outermost first:
//!
//! ```text
//! Bulkhead -> Timeout -> Retry -> CircuitBreaker -> operation
//! ```
//!
//! The bulkhead bounds whole logical calls including their retries, the
//! timeout bounds total wall-clock time, and the breaker is consulted on every
//! attempt. Absent layers are skipped.
//!
//! ## Example
//!
//! ```rust,ignore
//! use bulwark::resilience::*;
//! use std::time::Duration;
//!
//! let policy = ResiliencePolicy::builder()
//!     .with_retry(RetryConfig::new(3).with_backoff(Backoff::constant(Duration::from_millis(10))))
//!     .with_timeout(TimeoutConfig::new(Duration::from_secs(2)))
//!     .with_circuit_breaker(CircuitBreakerConfig::new("inventory"))
//!     .with_bulkhead(BulkheadConfig::new("inventory", 32).with_max_queue_size(64))
//!     .build()?;
//!
//! let stock = policy.execute(|cancel| inventory.lookup(sku, cancel)).await?;
//! ```

use super::bulkhead::{Bulkhead, BulkheadConfig};
use super::circuit_breaker::{CallPermit, CircuitBreaker, CircuitBreakerConfig};
use super::retry::{RetryConfig, RetryPolicy};
use super::settle;
use super::timeout::{TimeoutConfig, TimeoutPolicy};
use crate::error::{Cancelled, ConfigError, Error, Guarded, Outcome};
use std::future::Future;
use std::sync::Arc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::debug;

#[derive(Debug, Clone)]
enum BreakerSpec {
    Config(CircuitBreakerConfig),
    Shared(Arc<CircuitBreaker>),
}

/// Accumulates policy configurations. Declaration order has no effect.
#[derive(Debug, Clone, Default)]
pub struct ResiliencePolicyBuilder {
    timeout: Option<TimeoutConfig>,
    retry: Option<RetryConfig>,
    circuit_breaker: Option<BreakerSpec>,
    bulkhead: Option<BulkheadConfig>,
}

impl ResiliencePolicyBuilder {
    /// Create an empty builder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Bound the total wall-clock time of a call, retries included.
    pub fn with_timeout(mut self, config: TimeoutConfig) -> Self {
        self.timeout = Some(config);
        self
    }

    /// Retry failed attempts.
    pub fn with_retry(mut self, config: RetryConfig) -> Self {
        self.retry = Some(config);
        self
    }

    /// Create a breaker owned by this policy.
    pub fn with_circuit_breaker(mut self, config: CircuitBreakerConfig) -> Self {
        self.circuit_breaker = Some(BreakerSpec::Config(config));
        self
    }

    /// Use a breaker shared with other policies guarding the same dependency.
    pub fn with_shared_circuit_breaker(mut self, breaker: Arc<CircuitBreaker>) -> Self {
        self.circuit_breaker = Some(BreakerSpec::Shared(breaker));
        self
    }

    /// Bound concurrent calls, queue included.
    pub fn with_bulkhead(mut self, config: BulkheadConfig) -> Self {
        self.bulkhead = Some(config);
        self
    }

    /// Validate every configured layer and wire them in their fixed order.
    pub fn build(self) -> Result<ResiliencePolicy, ConfigError> {
        let bulkhead = self.bulkhead.map(Bulkhead::new).transpose()?;
        let timeout = self.timeout.map(TimeoutPolicy::new).transpose()?;
        let retry = self.retry.map(RetryPolicy::new).transpose()?;
        let circuit_breaker = match self.circuit_breaker {
            Some(BreakerSpec::Config(config)) => Some(CircuitBreaker::new(config)?),
            Some(BreakerSpec::Shared(breaker)) => Some(breaker),
            None => None,
        };

        debug!(
            bulkhead = bulkhead.is_some(),
            timeout = timeout.is_some(),
            retry = retry.is_some(),
            circuit_breaker = circuit_breaker.is_some(),
            "Resilience policy built"
        );

        Ok(ResiliencePolicy {
            bulkhead,
            timeout,
            retry,
            circuit_breaker,
        })
    }
}

/// A built pipeline of policies. Cheap to share behind an `Arc`.
#[derive(Debug, Clone)]
pub struct ResiliencePolicy {
    bulkhead: Option<Arc<Bulkhead>>,
    timeout: Option<TimeoutPolicy>,
    retry: Option<RetryPolicy>,
    circuit_breaker: Option<Arc<CircuitBreaker>>,
}

impl ResiliencePolicy {
    /// Start building a policy.
    pub fn builder() -> ResiliencePolicyBuilder {
        ResiliencePolicyBuilder::new()
    }

    /// Get the breaker consulted on every attempt.
    pub fn circuit_breaker(&self) -> Option<&Arc<CircuitBreaker>> {
        self.circuit_breaker.as_ref()
    }

    /// Get the bulkhead.
    pub fn bulkhead(&self) -> Option<&Arc<Bulkhead>> {
        self.bulkhead.as_ref()
    }

    /// Get the overall timeout.
    pub fn timeout(&self) -> Option<&TimeoutPolicy> {
        self.timeout.as_ref()
    }

    /// Get the retry policy.
    pub fn retry(&self) -> Option<&RetryPolicy> {
        self.retry.as_ref()
    }

    /// Run an operation through every configured layer.
    ///
    /// The operation may be invoked once per retry attempt.
    pub async fn execute<F, Fut, T>(&self, op: F) -> Outcome<T>
    where
        F: FnMut(CancellationToken) -> Fut,
        Fut: Future<Output = Outcome<T>>,
    {
        let cancel = CancellationToken::new();
        settle(self.execute_with_cancel(op, &cancel).await)
    }

    /// Run an operation through every configured layer, observing the caller's token.
    ///
    /// Cancelling `cancel` aborts a queued bulkhead wait, a backoff delay or
    /// the attempt in flight and yields `Err(Cancelled)`. A timeout of the
    /// pipeline is reported as an error inside the outcome instead.
    pub async fn execute_with_cancel<F, Fut, T>(
        &self,
        mut op: F,
        cancel: &CancellationToken,
    ) -> Guarded<T>
    where
        F: FnMut(CancellationToken) -> Fut,
        Fut: Future<Output = Outcome<T>>,
    {
        if cancel.is_cancelled() {
            return Err(Cancelled);
        }

        let _slot = match &self.bulkhead {
            Some(bulkhead) => match bulkhead.acquire(cancel).await? {
                Ok(permit) => Some(permit),
                Err(rejection) => return Ok(Err(rejection)),
            },
            None => None,
        };

        match &self.timeout {
            Some(timeout) => {
                let scope = cancel.child_token();
                let attempts = self.run_attempts(&mut op, scope.clone(), cancel);
                timeout.race(attempts, cancel, scope).await
            }
            None => self.run_attempts(&mut op, cancel.clone(), cancel).await,
        }
    }

    /// Run an infallible operation through every configured layer.
    pub async fn execute_value<F, Fut, T>(&self, op: F) -> Outcome<T>
    where
        F: FnMut(CancellationToken) -> Fut,
        Fut: Future<Output = T>,
    {
        let cancel = CancellationToken::new();
        settle(self.execute_value_with_cancel(op, &cancel).await)
    }

    /// Run an infallible operation through every configured layer, observing the caller's token.
    pub async fn execute_value_with_cancel<F, Fut, T>(
        &self,
        mut op: F,
        cancel: &CancellationToken,
    ) -> Guarded<T>
    where
        F: FnMut(CancellationToken) -> Fut,
        Fut: Future<Output = T>,
    {
        self.execute_with_cancel(
            |token| {
                let fut = op(token);
                async move { Ok(fut.await) }
            },
            cancel,
        )
        .await
    }

    /// `cancel` is the token the attempts run under; `caller` is the token
    /// handed to `execute_with_cancel`.
    async fn run_attempts<F, Fut, T>(
        &self,
        op: &mut F,
        cancel: CancellationToken,
        caller: &CancellationToken,
    ) -> Guarded<T>
    where
        F: FnMut(CancellationToken) -> Fut,
        Fut: Future<Output = Outcome<T>>,
    {
        let breaker = self.circuit_breaker.as_deref();
        let mut attempt = |token: CancellationToken| {
            // Admission is decided before the operation is created so an open
            // breaker never invokes it.
            let call = breaker
                .map(CircuitBreaker::try_acquire)
                .transpose()
                .map(|permit| (permit, op(token.clone())));
            let pipeline = cancel.clone();
            let caller = caller.clone();

            async move {
                let (permit, fut) = match call {
                    Ok(call) => call,
                    Err(rejection) => return Ok::<_, Cancelled>(Err(rejection)),
                };
                let mut guard = AttemptGuard {
                    policy: self,
                    permit,
                    started: Instant::now(),
                    attempt: token,
                    pipeline,
                    caller,
                };
                let outcome = fut.await;
                if let Some(permit) = guard.permit.take() {
                    permit.record(&outcome);
                }
                Ok(outcome)
            }
        };

        match &self.retry {
            Some(retry) => retry.run(attempt, &cancel).await,
            None => {
                let fut = attempt(cancel.clone());
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => Err(Cancelled),
                    result = fut => result,
                }
            }
        }
    }
}

/// Breaker permit of one attempt in flight.
///
/// An attempt dropped because a deadline of this policy fired is settled as a
/// failure with that deadline's error. Any other drop abandons the permit.
struct AttemptGuard<'a> {
    policy: &'a ResiliencePolicy,
    permit: Option<CallPermit<'a>>,
    started: Instant,
    attempt: CancellationToken,
    pipeline: CancellationToken,
    caller: CancellationToken,
}

impl AttemptGuard<'_> {
    fn deadline_error(&self) -> Option<Error> {
        if !self.attempt.is_cancelled() || self.caller.is_cancelled() {
            return None;
        }
        let elapsed = self.started.elapsed();
        let deadline = if self.pipeline.is_cancelled() {
            self.policy.timeout.as_ref()
        } else {
            self.policy.retry.as_ref().and_then(RetryPolicy::attempt_timeout)
        };
        deadline.map(|timeout| timeout.timeout_error(elapsed))
    }
}

impl Drop for AttemptGuard<'_> {
    fn drop(&mut self) {
        let Some(permit) = self.permit.take() else {
            return;
        };
        if let Some(error) = self.deadline_error() {
            debug!(error = %error, "Attempt timed out while holding a breaker permit");
            permit.record_failure(&error);
        }
    }
}
