//! Retry pattern with configurable backoff strategies.
//!
//! ## Example
//!
//! ```rust,ignore
//! use bulwark::resilience::{Backoff, RetryConfig, RetryPolicy};
//! use std::time::Duration;
//!
//! let retry = RetryPolicy::new(
//!     RetryConfig::new(3)
//!         .with_backoff(Backoff::exponential(Duration::from_millis(100)))
//!         .with_retry_when(|e| e.is_transient()),
//! )?;
//!
//! let result = retry.execute(|_| async {
//!     external_service.fetch().await
//! }).await;
//! ```

use super::backoff::Backoff;
use super::settle;
use super::timeout::{TimeoutConfig, TimeoutPolicy};
use crate::error::{Cancelled, ConfigError, Error, Guarded, Outcome};
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Type alias for a retry error predicate function.
pub type RetryPredicate = Arc<dyn Fn(&Error) -> bool + Send + Sync>;

/// Type alias for the callback fired before each retry.
///
/// Receives the number of the attempt that failed and its error.
pub type RetryCallback = Arc<dyn Fn(u32, &Error) + Send + Sync>;

/// Retry configuration.
#[derive(Clone)]
pub struct RetryConfig {
    /// Name for logging.
    pub name: String,
    /// Maximum number of attempts (including initial).
    pub max_attempts: u32,
    /// Backoff strategy.
    pub backoff: Backoff,
    /// Predicate to determine if an error is retryable. `None` retries everything.
    pub retry_when: Option<RetryPredicate>,
    /// Deadline applied to every single attempt.
    pub attempt_timeout: Option<Duration>,
    /// Fired once for every retry that is about to happen.
    pub on_retry: Option<RetryCallback>,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            name: "default".to_string(),
            max_attempts: 3,
            backoff: Backoff::None,
            retry_when: None,
            attempt_timeout: None,
            on_retry: None,
        }
    }
}

impl RetryConfig {
    /// Create new retry configuration.
    pub fn new(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            ..Default::default()
        }
    }

    /// Set the name.
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Set the maximum number of attempts.
    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    /// Set the backoff strategy.
    pub fn with_backoff(mut self, backoff: Backoff) -> Self {
        self.backoff = backoff;
        self
    }

    /// Only retry errors matching the predicate.
    pub fn with_retry_when<F>(mut self, predicate: F) -> Self
    where
        F: Fn(&Error) -> bool + Send + Sync + 'static,
    {
        self.retry_when = Some(Arc::new(predicate));
        self
    }

    /// Wrap every attempt in its own timeout.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.attempt_timeout = Some(timeout);
        self
    }

    /// Register a callback fired before each retry.
    pub fn on_retry<F>(mut self, callback: F) -> Self
    where
        F: Fn(u32, &Error) + Send + Sync + 'static,
    {
        self.on_retry = Some(Arc::new(callback));
        self
    }
}

impl fmt::Debug for RetryConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RetryConfig")
            .field("name", &self.name)
            .field("max_attempts", &self.max_attempts)
            .field("backoff", &self.backoff)
            .field("retry_when", &self.retry_when.as_ref().map(|_| "Custom"))
            .field("attempt_timeout", &self.attempt_timeout)
            .field("on_retry", &self.on_retry.is_some())
            .finish()
    }
}

/// Retry executor.
#[derive(Clone, Debug)]
pub struct RetryPolicy {
    config: RetryConfig,
    attempt_timeout: Option<TimeoutPolicy>,
}

impl RetryPolicy {
    /// Create a new retry executor.
    ///
    /// Fails when `max_attempts` is zero or the per-attempt timeout is zero.
    pub fn new(config: RetryConfig) -> Result<Self, ConfigError> {
        if config.max_attempts == 0 {
            return Err(ConfigError::non_positive("max_attempts"));
        }

        let attempt_timeout = config
            .attempt_timeout
            .map(|timeout| {
                TimeoutPolicy::new(
                    TimeoutConfig::new(timeout).with_name(format!("{}.attempt", config.name)),
                )
            })
            .transpose()?;

        debug!(
            name = %config.name,
            max_attempts = config.max_attempts,
            backoff = ?config.backoff,
            "Retry policy initialized"
        );

        Ok(Self {
            config,
            attempt_timeout,
        })
    }

    /// Get the maximum number of attempts.
    pub fn max_attempts(&self) -> u32 {
        self.config.max_attempts
    }

    pub(crate) fn attempt_timeout(&self) -> Option<&TimeoutPolicy> {
        self.attempt_timeout.as_ref()
    }

    /// Execute with retry logic.
    pub async fn execute<F, Fut, T>(&self, op: F) -> Outcome<T>
    where
        F: FnMut(CancellationToken) -> Fut,
        Fut: Future<Output = Outcome<T>>,
    {
        let cancel = CancellationToken::new();
        settle(self.execute_with_cancel(op, &cancel).await)
    }

    /// Execute with retry logic, observing the caller's cancellation token.
    ///
    /// Cancellation aborts the attempt in flight as well as a pending backoff wait.
    pub async fn execute_with_cancel<F, Fut, T>(
        &self,
        mut op: F,
        cancel: &CancellationToken,
    ) -> Guarded<T>
    where
        F: FnMut(CancellationToken) -> Fut,
        Fut: Future<Output = Outcome<T>>,
    {
        self.run(
            |token| {
                let fut = op(token);
                async move { Ok(fut.await) }
            },
            cancel,
        )
        .await
    }

    /// The attempt loop. Every attempt is created by `attempt` with the token it must observe.
    pub(crate) async fn run<F, Fut, T>(&self, mut attempt: F, cancel: &CancellationToken) -> Guarded<T>
    where
        F: FnMut(CancellationToken) -> Fut,
        Fut: Future<Output = Guarded<T>>,
    {
        let mut number = 1;

        loop {
            if cancel.is_cancelled() {
                return Err(Cancelled);
            }

            let outcome = match &self.attempt_timeout {
                Some(timeout) => {
                    let scope = cancel.child_token();
                    let fut = attempt(scope.clone());
                    timeout.race(fut, cancel, scope).await?
                }
                None => {
                    let fut = attempt(cancel.clone());
                    tokio::select! {
                        biased;
                        _ = cancel.cancelled() => return Err(Cancelled),
                        result = fut => result?,
                    }
                }
            };

            let error = match outcome {
                Ok(value) => {
                    self.log_success(number);
                    return Ok(Ok(value));
                }
                Err(error) => error,
            };

            let Some(delay) = self.next_delay(number, &error) else {
                return Ok(Err(error));
            };

            if !delay.is_zero() {
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => return Err(Cancelled),
                    _ = tokio::time::sleep(delay) => {}
                }
            }

            number += 1;
        }
    }

    /// Execute a blocking operation with retry logic.
    ///
    /// Backoff delays block the calling thread. The per-attempt timeout is not
    /// applied since a blocking call cannot be interrupted.
    pub fn execute_blocking<F, T>(&self, mut op: F) -> Outcome<T>
    where
        F: FnMut() -> Outcome<T>,
    {
        let mut number = 1;
        loop {
            let error = match op() {
                Ok(value) => {
                    self.log_success(number);
                    return Ok(value);
                }
                Err(error) => error,
            };

            let delay = self.next_delay(number, &error).ok_or(error)?;
            if !delay.is_zero() {
                std::thread::sleep(delay);
            }
            number += 1;
        }
    }

    fn log_success(&self, attempt: u32) {
        if attempt > 1 {
            debug!(name = %self.config.name, attempt, "Retry succeeded");
        }
    }

    /// Decide what follows a failed attempt. `None` ends the loop with `error`.
    fn next_delay(&self, number: u32, error: &Error) -> Option<Duration> {
        let max_attempts = self.config.max_attempts;
        if number >= max_attempts {
            warn!(
                name = %self.config.name,
                attempt = number,
                max_attempts,
                error = %error,
                "Final retry attempt failed"
            );
            return None;
        }

        if !self.is_retryable(error) {
            debug!(
                name = %self.config.name,
                attempt = number,
                error = %error,
                "Error is not retryable"
            );
            return None;
        }

        if let Some(on_retry) = &self.config.on_retry {
            on_retry(number, error);
        }

        let delay = self.config.backoff.delay(number);
        debug!(
            name = %self.config.name,
            attempt = number,
            delay = ?delay,
            error = %error,
            "Retry attempt failed, waiting before retry"
        );
        Some(delay)
    }

    fn is_retryable(&self, error: &Error) -> bool {
        match &self.config.retry_when {
            Some(predicate) => predicate(error),
            None => true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use std::sync::atomic::{AtomicU32, Ordering};
    use tokio::time::Instant;

    #[tokio::test]
    async fn test_retry_succeeds_on_first_try() {
        let retries = Arc::new(AtomicU32::new(0));
        let counter = retries.clone();
        let retry = RetryPolicy::new(RetryConfig::new(3).on_retry(move |_, _| {
            counter.fetch_add(1, Ordering::SeqCst);
        }))
        .unwrap();

        let result = retry.execute(|_| async { Ok(42) }).await;

        assert_eq!(result.unwrap(), 42);
        assert_eq!(retries.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_retry_succeeds_on_second_try() {
        let attempts = AtomicU32::new(0);
        let retry = RetryPolicy::new(RetryConfig::new(3)).unwrap();

        let result = retry
            .execute(|_| {
                let attempt = attempts.fetch_add(1, Ordering::SeqCst);
                async move {
                    if attempt == 0 {
                        Err(Error::external_service("first failure"))
                    } else {
                        Ok(42)
                    }
                }
            })
            .await;

        assert_eq!(result.unwrap(), 42);
        assert_eq!(attempts.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_retry_exhausted_returns_last_error() {
        let attempts = AtomicU32::new(0);
        let callbacks = Arc::new(Mutex::new(Vec::new()));
        let seen = callbacks.clone();
        let retry = RetryPolicy::new(RetryConfig::new(4).on_retry(move |attempt, error| {
            seen.lock().push((attempt, error.message()));
        }))
        .unwrap();

        let result: Outcome<()> = retry
            .execute(|_| {
                let attempt = attempts.fetch_add(1, Ordering::SeqCst) + 1;
                async move { Err(Error::external_service(format!("failure {}", attempt))) }
            })
            .await;

        assert_eq!(attempts.load(Ordering::SeqCst), 4);
        assert_eq!(result, Err(Error::external_service("failure 4")));
        assert_eq!(
            *callbacks.lock(),
            vec![
                (1, "failure 1".to_string()),
                (2, "failure 2".to_string()),
                (3, "failure 3".to_string()),
            ]
        );
    }

    #[tokio::test]
    async fn test_predicate_stops_retrying() {
        let attempts = AtomicU32::new(0);
        let retry =
            RetryPolicy::new(RetryConfig::new(5).with_retry_when(|e| e.is_transient())).unwrap();

        let result: Outcome<()> = retry
            .execute(|_| {
                attempts.fetch_add(1, Ordering::SeqCst);
                async { Err(Error::validation("bad input")) }
            })
            .await;

        assert_eq!(attempts.load(Ordering::SeqCst), 1);
        assert_eq!(result, Err(Error::validation("bad input")));
    }

    #[tokio::test(start_paused = true)]
    async fn test_backoff_waits_between_attempts() {
        let attempts = AtomicU32::new(0);
        let retry = RetryPolicy::new(
            RetryConfig::new(3).with_backoff(Backoff::constant(Duration::from_millis(10))),
        )
        .unwrap();

        let started = Instant::now();
        let result = retry
            .execute(|_| {
                let attempt = attempts.fetch_add(1, Ordering::SeqCst);
                async move {
                    if attempt < 2 {
                        Err(Error::external_service("flaky"))
                    } else {
                        Ok("done")
                    }
                }
            })
            .await;

        assert_eq!(result.unwrap(), "done");
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
        assert!(started.elapsed() >= Duration::from_millis(20));
    }

    #[tokio::test(start_paused = true)]
    async fn test_per_attempt_timeout() {
        let attempts = AtomicU32::new(0);
        let errors = Arc::new(Mutex::new(Vec::new()));
        let seen = errors.clone();
        let retry = RetryPolicy::new(
            RetryConfig::new(3)
                .with_timeout(Duration::from_millis(50))
                .on_retry(move |_, error| seen.lock().push(error.kind())),
        )
        .unwrap();

        let result = retry
            .execute(|_| {
                let attempt = attempts.fetch_add(1, Ordering::SeqCst);
                async move {
                    if attempt == 0 {
                        tokio::time::sleep(Duration::from_secs(5)).await;
                    }
                    Ok(attempt)
                }
            })
            .await;

        assert_eq!(result.unwrap(), 1);
        assert_eq!(*errors.lock(), vec![crate::error::ErrorKind::Timeout]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_during_backoff() {
        let attempts = Arc::new(AtomicU32::new(0));
        let retry = RetryPolicy::new(
            RetryConfig::new(10).with_backoff(Backoff::constant(Duration::from_secs(10))),
        )
        .unwrap();
        let cancel = CancellationToken::new();

        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            trigger.cancel();
        });

        let counter = attempts.clone();
        let result: Guarded<()> = retry
            .execute_with_cancel(
                move |_| {
                    counter.fetch_add(1, Ordering::SeqCst);
                    async { Err(Error::external_service("down")) }
                },
                &cancel,
            )
            .await;

        assert_eq!(result, Err(Cancelled));
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_execute_blocking_retries_with_backoff() {
        let retries = Arc::new(AtomicU32::new(0));
        let counter = retries.clone();
        let retry = RetryPolicy::new(
            RetryConfig::new(3)
                .with_backoff(Backoff::constant(Duration::from_millis(5)))
                .on_retry(move |_, _| {
                    counter.fetch_add(1, Ordering::SeqCst);
                }),
        )
        .unwrap();

        let mut attempts = 0;
        let started = std::time::Instant::now();
        let result = retry.execute_blocking(|| {
            attempts += 1;
            if attempts < 3 {
                Err(Error::external_service("flaky"))
            } else {
                Ok(attempts)
            }
        });

        assert_eq!(result, Ok(3));
        assert_eq!(retries.load(Ordering::SeqCst), 2);
        assert!(started.elapsed() >= Duration::from_millis(10));
    }

    #[test]
    fn test_execute_blocking_stops_on_predicate_and_exhaustion() {
        let retry =
            RetryPolicy::new(RetryConfig::new(4).with_retry_when(|e| e.is_transient())).unwrap();

        let mut attempts = 0;
        let result: Outcome<()> = retry.execute_blocking(|| {
            attempts += 1;
            Err(Error::validation("bad input"))
        });
        assert_eq!(result, Err(Error::validation("bad input")));
        assert_eq!(attempts, 1);

        let mut attempts = 0;
        let result: Outcome<()> = retry.execute_blocking(|| {
            attempts += 1;
            Err(Error::external_service(format!("failure {}", attempts)))
        });
        assert_eq!(result, Err(Error::external_service("failure 4")));
        assert_eq!(attempts, 4);
    }

    #[test]
    fn test_zero_attempts_rejected() {
        let err = RetryPolicy::new(RetryConfig::new(0)).unwrap_err();
        assert_eq!(err, ConfigError::NonPositive { field: "max_attempts" });
    }

    #[test]
    fn test_zero_attempt_timeout_rejected() {
        let err = RetryPolicy::new(RetryConfig::new(3).with_timeout(Duration::ZERO)).unwrap_err();
        assert_eq!(err, ConfigError::NonPositive { field: "timeout" });
    }
}
