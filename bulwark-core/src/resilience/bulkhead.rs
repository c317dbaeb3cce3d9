//! Bulkhead pattern for resource isolation.
//!
//! The bulkhead pattern limits concurrent access to a resource,
//! preventing a single component from consuming all available resources.
//! Callers beyond `max_concurrency` wait in a bounded queue; when the queue
//! is full too, they are rejected immediately.
//!
//! ## Example
//!
//! ```rust,ignore
//! use bulwark::resilience::{Bulkhead, BulkheadConfig};
//!
//! let bulkhead = Bulkhead::new(
//!     BulkheadConfig::new("reports", 10).with_max_queue_size(50),
//! )?;
//!
//! let result = bulkhead.execute(|cancel| async move {
//!     expensive_operation(cancel).await
//! }).await;
//! ```

use super::settle;
use crate::error::{Cancelled, ConfigError, Error, Guarded, Outcome};
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::{Semaphore, SemaphorePermit};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// Type alias for the rejection callback.
pub type RejectedCallback = Arc<dyn Fn() + Send + Sync>;

/// Bulkhead configuration.
#[derive(Clone)]
pub struct BulkheadConfig {
    /// Name of the bulkhead (for logging/metrics).
    pub name: String,
    /// Maximum concurrent executions.
    pub max_concurrency: usize,
    /// Maximum callers waiting for an execution slot. Zero disables queueing.
    pub max_queue_size: usize,
    /// Fired whenever a caller is rejected.
    pub on_rejected: Option<RejectedCallback>,
}

impl Default for BulkheadConfig {
    fn default() -> Self {
        Self {
            name: "default".to_string(),
            max_concurrency: 10,
            max_queue_size: 0,
            on_rejected: None,
        }
    }
}

impl BulkheadConfig {
    /// Create a new configuration.
    pub fn new(name: impl Into<String>, max_concurrency: usize) -> Self {
        Self {
            name: name.into(),
            max_concurrency,
            ..Default::default()
        }
    }

    /// Set the maximum concurrency.
    pub fn with_max_concurrency(mut self, max_concurrency: usize) -> Self {
        self.max_concurrency = max_concurrency;
        self
    }

    /// Set the queue size.
    pub fn with_max_queue_size(mut self, size: usize) -> Self {
        self.max_queue_size = size;
        self
    }

    /// Register a rejection callback.
    pub fn on_rejected<F>(mut self, callback: F) -> Self
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.on_rejected = Some(Arc::new(callback));
        self
    }
}

impl fmt::Debug for BulkheadConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BulkheadConfig")
            .field("name", &self.name)
            .field("max_concurrency", &self.max_concurrency)
            .field("max_queue_size", &self.max_queue_size)
            .field("on_rejected", &self.on_rejected.is_some())
            .finish()
    }
}

/// Bulkhead for limiting concurrent access.
pub struct Bulkhead {
    config: BulkheadConfig,
    slots: Semaphore,
    queue: Semaphore,
    total_calls: AtomicU64,
    total_rejections: AtomicU64,
}

impl Bulkhead {
    /// Create a new bulkhead.
    ///
    /// Fails when `max_concurrency` is zero or either limit exceeds what a
    /// semaphore can hold.
    pub fn new(config: BulkheadConfig) -> Result<Arc<Self>, ConfigError> {
        if config.max_concurrency == 0 {
            return Err(ConfigError::non_positive("max_concurrency"));
        }
        if config.max_concurrency > Semaphore::MAX_PERMITS {
            return Err(ConfigError::OutOfRange {
                field: "max_concurrency",
                value: config.max_concurrency.to_string(),
                expected: "at most Semaphore::MAX_PERMITS",
            });
        }
        if config.max_queue_size > Semaphore::MAX_PERMITS {
            return Err(ConfigError::OutOfRange {
                field: "max_queue_size",
                value: config.max_queue_size.to_string(),
                expected: "at most Semaphore::MAX_PERMITS",
            });
        }

        info!(
            name = %config.name,
            max_concurrency = config.max_concurrency,
            max_queue_size = config.max_queue_size,
            "Bulkhead initialized"
        );

        Ok(Arc::new(Self {
            slots: Semaphore::new(config.max_concurrency),
            queue: Semaphore::new(config.max_queue_size),
            config,
            total_calls: AtomicU64::new(0),
            total_rejections: AtomicU64::new(0),
        }))
    }

    /// Get the bulkhead name.
    pub fn name(&self) -> &str {
        &self.config.name
    }

    /// Get current number of executing calls.
    pub fn active_count(&self) -> usize {
        self.config.max_concurrency - self.slots.available_permits()
    }

    /// Get current number of queued calls.
    pub fn queued_count(&self) -> usize {
        self.config.max_queue_size - self.queue.available_permits()
    }

    /// Get free execution slots.
    pub fn available_permits(&self) -> usize {
        self.slots.available_permits()
    }

    /// Check if the bulkhead has a free execution slot.
    pub fn has_capacity(&self) -> bool {
        self.slots.available_permits() > 0
    }

    /// Wait for an execution slot.
    ///
    /// Resolves to the slot, to [`Error::BulkheadRejected`] when both the
    /// slots and the queue are full, or to [`Cancelled`] when the caller
    /// cancels while queued.
    pub async fn acquire(&self, cancel: &CancellationToken) -> Guarded<BulkheadPermit<'_>> {
        if cancel.is_cancelled() {
            return Err(Cancelled);
        }
        self.total_calls.fetch_add(1, Ordering::Relaxed);

        if let Ok(permit) = self.slots.try_acquire() {
            return Ok(Ok(BulkheadPermit { _permit: permit }));
        }

        let Ok(queue_slot) = self.queue.try_acquire() else {
            return Ok(Err(self.reject()));
        };
        debug!(name = %self.config.name, "Bulkhead full, queueing request");

        let acquired = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                debug!(name = %self.config.name, "Queued request cancelled");
                return Err(Cancelled);
            }
            acquired = self.slots.acquire() => acquired,
        };
        drop(queue_slot);

        match acquired {
            Ok(permit) => Ok(Ok(BulkheadPermit { _permit: permit })),
            // The slot semaphore is never closed.
            Err(_) => Ok(Err(self.reject())),
        }
    }

    fn reject(&self) -> Error {
        self.total_rejections.fetch_add(1, Ordering::Relaxed);
        debug!(
            name = %self.config.name,
            max_concurrency = self.config.max_concurrency,
            max_queue_size = self.config.max_queue_size,
            "Bulkhead rejected request"
        );
        if let Some(callback) = &self.config.on_rejected {
            callback();
        }
        Error::bulkhead_rejected(self.config.max_concurrency, self.config.max_queue_size)
    }

    /// Execute with bulkhead protection.
    pub async fn execute<F, Fut, T>(&self, op: F) -> Outcome<T>
    where
        F: FnOnce(CancellationToken) -> Fut,
        Fut: Future<Output = Outcome<T>>,
    {
        let cancel = CancellationToken::new();
        settle(self.execute_with_cancel(op, &cancel).await)
    }

    /// Execute with bulkhead protection, observing the caller's cancellation token.
    pub async fn execute_with_cancel<F, Fut, T>(
        &self,
        op: F,
        cancel: &CancellationToken,
    ) -> Guarded<T>
    where
        F: FnOnce(CancellationToken) -> Fut,
        Fut: Future<Output = Outcome<T>>,
    {
        let _permit = match self.acquire(cancel).await? {
            Ok(permit) => permit,
            Err(rejection) => return Ok(Err(rejection)),
        };

        let fut = op(cancel.clone());
        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(Cancelled),
            outcome = fut => Ok(outcome),
        }
    }

    /// Get bulkhead statistics.
    pub fn stats(&self) -> BulkheadStats {
        BulkheadStats {
            name: self.config.name.clone(),
            max_concurrency: self.config.max_concurrency,
            max_queue_size: self.config.max_queue_size,
            active_count: self.active_count(),
            queued_count: self.queued_count(),
            available_permits: self.available_permits(),
            total_calls: self.total_calls.load(Ordering::Relaxed),
            total_rejections: self.total_rejections.load(Ordering::Relaxed),
        }
    }
}

impl fmt::Debug for Bulkhead {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Bulkhead")
            .field("name", &self.config.name)
            .field("active", &self.active_count())
            .field("queued", &self.queued_count())
            .finish()
    }
}

/// An execution slot held for the duration of one call. Released on drop.
pub struct BulkheadPermit<'a> {
    _permit: SemaphorePermit<'a>,
}

impl fmt::Debug for BulkheadPermit<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BulkheadPermit").finish_non_exhaustive()
    }
}

/// Bulkhead statistics.
#[derive(Debug, Clone)]
pub struct BulkheadStats {
    /// Bulkhead name.
    pub name: String,
    /// Maximum concurrent executions.
    pub max_concurrency: usize,
    /// Maximum queued callers.
    pub max_queue_size: usize,
    /// Current active executions.
    pub active_count: usize,
    /// Current queued callers.
    pub queued_count: usize,
    /// Available permits.
    pub available_permits: usize,
    /// Total calls.
    pub total_calls: u64,
    /// Total rejections.
    pub total_rejections: u64,
}

impl BulkheadStats {
    /// Calculate utilization (0.0 - 1.0).
    pub fn utilization(&self) -> f64 {
        self.active_count as f64 / self.max_concurrency as f64
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::task::Poll;
    use std::time::Duration;

    #[tokio::test]
    async fn test_bulkhead_allows_concurrent() {
        let bulkhead = Bulkhead::new(BulkheadConfig::new("test", 2)).unwrap();

        let result = bulkhead.execute(|_| async { Ok(42) }).await;

        assert_eq!(result.unwrap(), 42);
        assert_eq!(bulkhead.active_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_bulkhead_never_exceeds_max_concurrency() {
        let bulkhead = Bulkhead::new(BulkheadConfig::new("test", 3).with_max_queue_size(20)).unwrap();
        let running = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..12 {
            let bulkhead = bulkhead.clone();
            let running = running.clone();
            let peak = peak.clone();
            handles.push(tokio::spawn(async move {
                bulkhead
                    .execute(|_| async move {
                        let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                        peak.fetch_max(now, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(10)).await;
                        running.fetch_sub(1, Ordering::SeqCst);
                        Ok(())
                    })
                    .await
            }));
        }

        for handle in handles {
            assert!(handle.await.unwrap().is_ok());
        }
        assert_eq!(peak.load(Ordering::SeqCst), 3);
        assert_eq!(bulkhead.stats().total_calls, 12);
    }

    #[tokio::test]
    async fn test_bulkhead_rejects_when_slots_and_queue_full() {
        let rejected = Arc::new(AtomicUsize::new(0));
        let counter = rejected.clone();
        let bulkhead = Bulkhead::new(
            BulkheadConfig::new("test", 2)
                .with_max_queue_size(1)
                .on_rejected(move || {
                    counter.fetch_add(1, Ordering::SeqCst);
                }),
        )
        .unwrap();
        let cancel = CancellationToken::new();

        let first = bulkhead.acquire(&cancel).await.unwrap().unwrap();
        let _second = bulkhead.acquire(&cancel).await.unwrap().unwrap();

        let mut queued = tokio_test::task::spawn(bulkhead.acquire(&cancel));
        assert!(queued.poll().is_pending());
        assert_eq!(bulkhead.queued_count(), 1);

        let invoked = AtomicUsize::new(0);
        let result: Outcome<()> = bulkhead
            .execute(|_| {
                invoked.fetch_add(1, Ordering::SeqCst);
                async { Ok(()) }
            })
            .await;

        assert_eq!(result, Err(Error::bulkhead_rejected(2, 1)));
        assert_eq!(invoked.load(Ordering::SeqCst), 0);
        assert_eq!(rejected.load(Ordering::SeqCst), 1);

        drop(first);
        assert!(queued.is_woken());
        match queued.poll() {
            Poll::Ready(Ok(Ok(_permit))) => {}
            _ => panic!("queued caller should be admitted"),
        }
        assert_eq!(bulkhead.queued_count(), 0);
    }

    #[tokio::test]
    async fn test_zero_queue_rejects_immediately() {
        let bulkhead = Bulkhead::new(BulkheadConfig::new("test", 1)).unwrap();
        let cancel = CancellationToken::new();

        let _held = bulkhead.acquire(&cancel).await.unwrap().unwrap();
        let result: Outcome<()> = bulkhead.execute(|_| async { Ok(()) }).await;

        assert!(result.unwrap_err().is_bulkhead_rejected());
        assert_eq!(bulkhead.stats().total_rejections, 1);
    }

    #[tokio::test]
    async fn test_cancel_while_queued() {
        let bulkhead = Bulkhead::new(BulkheadConfig::new("test", 1).with_max_queue_size(1)).unwrap();
        let cancel = CancellationToken::new();

        let _held = bulkhead.acquire(&cancel).await.unwrap().unwrap();

        let waiter = CancellationToken::new();
        let mut queued = tokio_test::task::spawn(bulkhead.acquire(&waiter));
        assert!(queued.poll().is_pending());

        waiter.cancel();
        assert!(matches!(queued.poll(), Poll::Ready(Err(Cancelled))));
        drop(queued);
        assert_eq!(bulkhead.queued_count(), 0);
    }

    #[tokio::test]
    async fn test_stats() {
        let bulkhead = Bulkhead::new(BulkheadConfig::new("stats", 4)).unwrap();
        let cancel = CancellationToken::new();
        let _held = bulkhead.acquire(&cancel).await.unwrap().unwrap();

        let stats = bulkhead.stats();
        assert_eq!(stats.active_count, 1);
        assert_eq!(stats.available_permits, 3);
        assert_eq!(stats.utilization(), 0.25);
    }

    #[test]
    fn test_invalid_config() {
        let err = Bulkhead::new(BulkheadConfig::new("x", 0)).unwrap_err();
        assert_eq!(err, ConfigError::NonPositive { field: "max_concurrency" });

        let err = Bulkhead::new(BulkheadConfig::new("x", 1).with_max_queue_size(usize::MAX)).unwrap_err();
        assert!(matches!(err, ConfigError::OutOfRange { field: "max_queue_size", .. }));
    }
}
