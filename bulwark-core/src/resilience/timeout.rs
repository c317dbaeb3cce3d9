//! Timeout pattern for operations.
//!
//! The operation races a deadline. On expiry the operation is cancelled and a
//! [`Error::Timeout`] (or the configured replacement) is returned. Caller
//! cancellation is reported as [`Cancelled`], never as a timeout.
//!
//! ## Example
//!
//! ```rust,ignore
//! use bulwark::resilience::{TimeoutConfig, TimeoutPolicy};
//! use std::time::Duration;
//!
//! let timeout = TimeoutPolicy::new(TimeoutConfig::new(Duration::from_secs(5)))?;
//!
//! let result = timeout.execute(|cancel| async move {
//!     slow_operation(cancel).await
//! }).await;
//! ```

use super::settle;
use crate::error::{Cancelled, ConfigError, Error, Guarded, Outcome};
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Type alias for a function building the error reported on expiry.
///
/// The argument is the elapsed time when the deadline fired.
pub type TimeoutErrorFactory = Arc<dyn Fn(Duration) -> Error + Send + Sync>;

/// Timeout configuration.
#[derive(Clone)]
pub struct TimeoutConfig {
    /// Name for logging.
    pub name: String,
    /// Timeout duration.
    pub timeout: Duration,
    /// Replaces the default [`Error::Timeout`].
    pub error_factory: Option<TimeoutErrorFactory>,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            name: "default".to_string(),
            timeout: Duration::from_secs(30),
            error_factory: None,
        }
    }
}

impl TimeoutConfig {
    /// Create a new timeout configuration.
    pub fn new(timeout: Duration) -> Self {
        Self {
            timeout,
            ..Default::default()
        }
    }

    /// Set the name.
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Set the timeout duration.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Build the expiry error from the elapsed time.
    pub fn with_timeout_error<F>(mut self, factory: F) -> Self
    where
        F: Fn(Duration) -> Error + Send + Sync + 'static,
    {
        self.error_factory = Some(Arc::new(factory));
        self
    }
}

impl fmt::Debug for TimeoutConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TimeoutConfig")
            .field("name", &self.name)
            .field("timeout", &self.timeout)
            .field("error_factory", &self.error_factory.is_some())
            .finish()
    }
}

/// Races operations against a deadline.
#[derive(Clone, Debug)]
pub struct TimeoutPolicy {
    config: TimeoutConfig,
}

impl TimeoutPolicy {
    /// Create a new timeout policy.
    ///
    /// Fails when the timeout is zero.
    pub fn new(config: TimeoutConfig) -> Result<Self, ConfigError> {
        if config.timeout.is_zero() {
            return Err(ConfigError::non_positive("timeout"));
        }

        debug!(name = %config.name, timeout = ?config.timeout, "Timeout policy initialized");
        Ok(Self { config })
    }

    /// Create with a duration.
    pub fn with_duration(timeout: Duration) -> Result<Self, ConfigError> {
        Self::new(TimeoutConfig::new(timeout))
    }

    /// Get the timeout duration.
    pub fn timeout(&self) -> Duration {
        self.config.timeout
    }

    /// Execute with timeout.
    pub async fn execute<F, Fut, T>(&self, op: F) -> Outcome<T>
    where
        F: FnOnce(CancellationToken) -> Fut,
        Fut: Future<Output = Outcome<T>>,
    {
        let cancel = CancellationToken::new();
        settle(self.execute_with_cancel(op, &cancel).await)
    }

    /// Execute with timeout, observing the caller's cancellation token.
    ///
    /// The operation receives a token that is cancelled when either the
    /// caller cancels or the deadline fires.
    pub async fn execute_with_cancel<F, Fut, T>(
        &self,
        op: F,
        cancel: &CancellationToken,
    ) -> Guarded<T>
    where
        F: FnOnce(CancellationToken) -> Fut,
        Fut: Future<Output = Outcome<T>>,
    {
        if cancel.is_cancelled() {
            return Err(Cancelled);
        }

        let scope = cancel.child_token();
        let fut = op(scope.clone());
        self.race(async move { Ok(fut.await) }, cancel, scope).await
    }

    /// Race an already created future against the deadline.
    ///
    /// `scope` must be a child of `cancel`; it is cancelled when the deadline
    /// fires so the work it was handed to stops.
    pub(crate) async fn race<Fut, T>(
        &self,
        fut: Fut,
        cancel: &CancellationToken,
        scope: CancellationToken,
    ) -> Guarded<T>
    where
        Fut: Future<Output = Guarded<T>>,
    {
        let started = Instant::now();
        // The scope is cancelled before the raced future is dropped.
        let deadline = async {
            tokio::time::sleep(self.config.timeout).await;
            scope.cancel();
        };

        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(Cancelled),
            result = fut => result,
            _ = deadline => {
                let elapsed = started.elapsed();
                warn!(
                    name = %self.config.name,
                    timeout = ?self.config.timeout,
                    elapsed = ?elapsed,
                    "Operation timed out"
                );
                Ok(Err(self.timeout_error(elapsed)))
            }
        }
    }

    pub(crate) fn timeout_error(&self, elapsed: Duration) -> Error {
        match &self.config.error_factory {
            Some(factory) => factory(elapsed),
            None => Error::timeout(elapsed, self.config.timeout),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    #[tokio::test(start_paused = true)]
    async fn test_timeout_completes() {
        let timeout = TimeoutPolicy::with_duration(Duration::from_secs(1)).unwrap();

        let result = timeout.execute(|_| async { Ok(42) }).await;

        assert_eq!(result.unwrap(), 42);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_expires() {
        let timeout = TimeoutPolicy::with_duration(Duration::from_millis(10)).unwrap();

        let result: Outcome<i32> = timeout
            .execute(|_| async {
                tokio::time::sleep(Duration::from_millis(100)).await;
                Ok(42)
            })
            .await;

        match result {
            Err(Error::Timeout { elapsed, timeout }) => {
                assert_eq!(timeout, Duration::from_millis(10));
                assert!(elapsed >= Duration::from_millis(10));
            }
            other => panic!("expected timeout, got {:?}", other),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_operation_error_passes_through() {
        let timeout = TimeoutPolicy::with_duration(Duration::from_secs(1)).unwrap();

        let result: Outcome<i32> = timeout
            .execute(|_| async { Err(Error::not_found("user 9")) })
            .await;

        assert_eq!(result, Err(Error::not_found("user 9")));
    }

    #[tokio::test(start_paused = true)]
    async fn test_custom_timeout_error() {
        let config = TimeoutConfig::new(Duration::from_millis(5))
            .with_timeout_error(|elapsed| Error::external_service(format!("slow: {:?}", elapsed)));
        let timeout = TimeoutPolicy::new(config).unwrap();

        let result: Outcome<()> = timeout
            .execute(|_| async {
                tokio::time::sleep(Duration::from_secs(1)).await;
                Ok(())
            })
            .await;

        assert!(matches!(result, Err(Error::ExternalService(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_cancels_operation_token() {
        let timeout = TimeoutPolicy::with_duration(Duration::from_millis(10)).unwrap();
        let seen = Arc::new(Mutex::new(None));

        let slot = seen.clone();
        let _: Outcome<()> = timeout
            .execute(move |token| {
                *slot.lock() = Some(token.clone());
                async move {
                    tokio::time::sleep(Duration::from_secs(1)).await;
                    Ok(())
                }
            })
            .await;

        let token = seen.lock().take().unwrap();
        assert!(token.is_cancelled());
    }

    #[tokio::test(start_paused = true)]
    async fn test_caller_cancellation_is_not_timeout() {
        let timeout = TimeoutPolicy::with_duration(Duration::from_secs(10)).unwrap();
        let cancel = CancellationToken::new();

        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(5)).await;
            trigger.cancel();
        });

        let result: Guarded<()> = timeout
            .execute_with_cancel(
                |_| async {
                    tokio::time::sleep(Duration::from_secs(60)).await;
                    Ok(())
                },
                &cancel,
            )
            .await;

        assert_eq!(result, Err(Cancelled));
    }

    #[tokio::test]
    async fn test_already_cancelled_never_invokes() {
        let timeout = TimeoutPolicy::with_duration(Duration::from_secs(1)).unwrap();
        let cancel = CancellationToken::new();
        cancel.cancel();

        let result: Guarded<()> = timeout
            .execute_with_cancel(|_| -> std::future::Ready<Outcome<()>> { panic!("invoked") }, &cancel)
            .await;

        assert_eq!(result, Err(Cancelled));
    }

    #[test]
    fn test_zero_timeout_rejected() {
        let err = TimeoutPolicy::with_duration(Duration::ZERO).unwrap_err();
        assert_eq!(err, ConfigError::NonPositive { field: "timeout" });
    }
}
