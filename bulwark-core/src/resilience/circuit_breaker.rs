//! Circuit Breaker pattern implementation.
//!
//! The circuit breaker prevents cascade failures by counting consecutive
//! failures and "opening" the circuit to reject calls once a threshold is
//! reached.
//!
//! ## States
//!
//! - **Closed**: Normal operation, calls pass through and failures are counted
//! - **Open**: Circuit is tripped, calls are rejected without running
//! - **Half-Open**: After the reset timeout, exactly one trial call is admitted
//!
//! ## Example
//!
//! ```rust,ignore
//! use bulwark::resilience::{CircuitBreaker, CircuitBreakerConfig};
//! use std::time::Duration;
//!
//! let circuit = CircuitBreaker::new(
//!     CircuitBreakerConfig::new("payments")
//!         .with_failure_threshold(5)
//!         .with_reset_timeout(Duration::from_secs(30)),
//! )?;
//!
//! let result = circuit.execute(|| async {
//!     payments.charge(order).await
//! }).await;
//!
//! match result {
//!     Ok(receipt) => Ok(receipt),
//!     Err(Error::CircuitOpen { retry_after }) => defer(retry_after),
//!     Err(e) => Err(e),
//! }
//! ```

use crate::error::{Cancelled, ConfigError, Error, Guarded, Outcome};
use parking_lot::Mutex;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Type alias for the predicate deciding whether an error counts as a failure.
pub type BreakPredicate = Arc<dyn Fn(&Error) -> bool + Send + Sync>;

/// Type alias for the state transition callback `(from, to)`.
pub type StateChangeCallback = Arc<dyn Fn(CircuitState, CircuitState) + Send + Sync>;

/// Circuit breaker state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    /// Circuit is closed, requests pass through normally.
    Closed,
    /// Circuit is open, requests are rejected.
    Open,
    /// Circuit is half-open, testing recovery.
    HalfOpen,
}

impl fmt::Display for CircuitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Closed => write!(f, "Closed"),
            Self::Open => write!(f, "Open"),
            Self::HalfOpen => write!(f, "HalfOpen"),
        }
    }
}

/// Circuit breaker configuration.
#[derive(Clone)]
pub struct CircuitBreakerConfig {
    /// Name of the circuit breaker (for logging).
    pub name: String,
    /// Number of consecutive failures before opening the circuit.
    pub failure_threshold: u32,
    /// Time to wait before admitting a trial call.
    pub reset_timeout: Duration,
    /// Decides which errors count as failures. `None` counts every error.
    pub break_when: Option<BreakPredicate>,
    /// Fired on every state transition, in order, after the state lock is released.
    pub on_state_change: Option<StateChangeCallback>,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            name: "default".to_string(),
            failure_threshold: 5,
            reset_timeout: Duration::from_secs(30),
            break_when: None,
            on_state_change: None,
        }
    }
}

impl CircuitBreakerConfig {
    /// Create a new configuration with a name.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    /// Set the failure threshold.
    pub fn with_failure_threshold(mut self, threshold: u32) -> Self {
        self.failure_threshold = threshold;
        self
    }

    /// Set the reset timeout.
    pub fn with_reset_timeout(mut self, timeout: Duration) -> Self {
        self.reset_timeout = timeout;
        self
    }

    /// Only count errors matching the predicate as failures.
    pub fn with_break_when<F>(mut self, predicate: F) -> Self
    where
        F: Fn(&Error) -> bool + Send + Sync + 'static,
    {
        self.break_when = Some(Arc::new(predicate));
        self
    }

    /// Register a state transition callback.
    pub fn on_state_change<F>(mut self, callback: F) -> Self
    where
        F: Fn(CircuitState, CircuitState) + Send + Sync + 'static,
    {
        self.on_state_change = Some(Arc::new(callback));
        self
    }
}

impl fmt::Debug for CircuitBreakerConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CircuitBreakerConfig")
            .field("name", &self.name)
            .field("failure_threshold", &self.failure_threshold)
            .field("reset_timeout", &self.reset_timeout)
            .field("break_when", &self.break_when.is_some())
            .field("on_state_change", &self.on_state_change.is_some())
            .finish()
    }
}

/// Internal circuit breaker state. Only touched under the breaker's lock.
struct CircuitBreakerState {
    state: CircuitState,
    consecutive_failures: u32,
    opened_at: Option<Instant>,
    trial_in_flight: bool,
    pending_transitions: Vec<(CircuitState, CircuitState)>,
}

/// Circuit breaker for protecting against cascade failures.
///
/// One breaker is created per logical dependency and shared by every caller
/// of that dependency, usually as `Arc<CircuitBreaker>`. Admission decisions
/// never suspend.
pub struct CircuitBreaker {
    config: CircuitBreakerConfig,
    inner: Mutex<CircuitBreakerState>,
    notifying: Mutex<()>,
    total_requests: AtomicU64,
    total_failures: AtomicU64,
    total_successes: AtomicU64,
    total_rejections: AtomicU64,
}

impl CircuitBreaker {
    /// Create a new circuit breaker with the given configuration.
    ///
    /// Fails when the failure threshold or reset timeout is zero.
    pub fn new(config: CircuitBreakerConfig) -> Result<Arc<Self>, ConfigError> {
        if config.failure_threshold == 0 {
            return Err(ConfigError::non_positive("failure_threshold"));
        }
        if config.reset_timeout.is_zero() {
            return Err(ConfigError::non_positive("reset_timeout"));
        }

        info!(
            name = %config.name,
            failure_threshold = config.failure_threshold,
            reset_timeout = ?config.reset_timeout,
            "Circuit breaker initialized"
        );

        Ok(Arc::new(Self {
            config,
            inner: Mutex::new(CircuitBreakerState {
                state: CircuitState::Closed,
                consecutive_failures: 0,
                opened_at: None,
                trial_in_flight: false,
                pending_transitions: Vec::new(),
            }),
            notifying: Mutex::new(()),
            total_requests: AtomicU64::new(0),
            total_failures: AtomicU64::new(0),
            total_successes: AtomicU64::new(0),
            total_rejections: AtomicU64::new(0),
        }))
    }

    /// Get the current circuit state.
    ///
    /// An open circuit stays `Open` until a call arrives after the reset timeout.
    pub fn state(&self) -> CircuitState {
        self.inner.lock().state
    }

    /// Get the circuit breaker name.
    pub fn name(&self) -> &str {
        &self.config.name
    }

    /// Get the current consecutive failure count.
    pub fn failure_count(&self) -> u32 {
        self.inner.lock().consecutive_failures
    }

    /// Ask for admission of one call.
    ///
    /// Returns a permit that must be settled with the call's outcome, or the
    /// [`Error::CircuitOpen`] rejection. Dropping an unsettled trial permit
    /// frees the half-open slot for the next caller.
    pub fn try_acquire(&self) -> Result<CallPermit<'_>, Error> {
        self.total_requests.fetch_add(1, Ordering::Relaxed);
        let now = Instant::now();
        let mut inner = self.inner.lock();

        let rejection = match inner.state {
            CircuitState::Closed => {
                return Ok(CallPermit::new(self, false));
            }
            CircuitState::Open => {
                let opened_at = *inner.opened_at.get_or_insert(now);
                let elapsed = now.saturating_duration_since(opened_at);
                if elapsed >= self.config.reset_timeout {
                    self.transition(&mut inner, CircuitState::HalfOpen);
                    inner.trial_in_flight = true;
                    drop(inner);
                    self.notify();
                    return Ok(CallPermit::new(self, true));
                }
                self.config.reset_timeout - elapsed
            }
            CircuitState::HalfOpen => {
                if !inner.trial_in_flight {
                    inner.trial_in_flight = true;
                    return Ok(CallPermit::new(self, true));
                }
                Duration::ZERO
            }
        };
        drop(inner);

        self.total_rejections.fetch_add(1, Ordering::Relaxed);
        debug!(
            name = %self.config.name,
            retry_after = ?rejection,
            "Circuit breaker rejected request"
        );
        Err(Error::circuit_open(rejection))
    }

    /// Execute a function with circuit breaker protection.
    pub async fn execute<F, Fut, T>(&self, op: F) -> Outcome<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Outcome<T>>,
    {
        let permit = self.try_acquire()?;
        let outcome = op().await;
        permit.record(&outcome);
        outcome
    }

    /// Execute with circuit breaker protection, observing the caller's cancellation token.
    ///
    /// A cancelled call is neither a success nor a failure.
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

        let permit = match self.try_acquire() {
            Ok(permit) => permit,
            Err(rejection) => return Ok(Err(rejection)),
        };

        let fut = op(cancel.clone());
        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(Cancelled),
            outcome = fut => {
                permit.record(&outcome);
                Ok(outcome)
            }
        }
    }

    fn counts_as_failure(&self, error: &Error) -> bool {
        match &self.config.break_when {
            Some(predicate) => predicate(error),
            None => true,
        }
    }

    fn on_success(&self, trial: bool) {
        self.total_successes.fetch_add(1, Ordering::Relaxed);
        {
            let mut inner = self.inner.lock();

            match inner.state {
                CircuitState::Closed => {
                    inner.consecutive_failures = 0;
                }
                CircuitState::HalfOpen if trial => {
                    inner.trial_in_flight = false;
                    inner.consecutive_failures = 0;
                    inner.opened_at = None;
                    self.transition(&mut inner, CircuitState::Closed);
                }
                _ => {
                    debug!(name = %self.config.name, state = %inner.state, "Ignoring stale success");
                }
            }
        }
        self.notify();
    }

    fn on_failure(&self, trial: bool) {
        self.total_failures.fetch_add(1, Ordering::Relaxed);
        {
            let mut inner = self.inner.lock();

            match inner.state {
                CircuitState::Closed => {
                    inner.consecutive_failures += 1;
                    if inner.consecutive_failures >= self.config.failure_threshold {
                        warn!(
                            name = %self.config.name,
                            failures = inner.consecutive_failures,
                            "Circuit breaker OPENED"
                        );
                        inner.consecutive_failures = 0;
                        inner.opened_at = Some(Instant::now());
                        self.transition(&mut inner, CircuitState::Open);
                    }
                }
                CircuitState::HalfOpen if trial => {
                    warn!(name = %self.config.name, "Trial call failed, circuit breaker re-OPENED");
                    inner.trial_in_flight = false;
                    inner.opened_at = Some(Instant::now());
                    self.transition(&mut inner, CircuitState::Open);
                }
                _ => {
                    debug!(name = %self.config.name, state = %inner.state, "Ignoring stale failure");
                }
            }
        }
        self.notify();
    }

    fn on_abandoned(&self, trial: bool) {
        if !trial {
            return;
        }
        let mut inner = self.inner.lock();
        if inner.state == CircuitState::HalfOpen {
            debug!(name = %self.config.name, "Trial call abandoned, releasing half-open slot");
            inner.trial_in_flight = false;
        }
    }

    fn transition(&self, inner: &mut CircuitBreakerState, to: CircuitState) {
        let from = inner.state;
        if from == to {
            return;
        }
        inner.state = to;

        match to {
            CircuitState::Closed => info!(name = %self.config.name, "Circuit breaker CLOSED"),
            CircuitState::HalfOpen => {
                debug!(name = %self.config.name, "Circuit breaker transitioning to HALF-OPEN")
            }
            CircuitState::Open => {}
        }

        if self.config.on_state_change.is_some() {
            inner.pending_transitions.push((from, to));
        }
    }

    /// Fire queued state change callbacks. Must be called without the state lock.
    ///
    /// One caller drains the queue at a time so callbacks observe transitions in
    /// order. A transition caused from inside a callback is picked up by the
    /// drain loop already running.
    fn notify(&self) {
        let Some(callback) = &self.config.on_state_change else {
            return;
        };

        loop {
            let Some(draining) = self.notifying.try_lock() else {
                return;
            };
            loop {
                let batch = std::mem::take(&mut self.inner.lock().pending_transitions);
                if batch.is_empty() {
                    break;
                }
                for (from, to) in batch {
                    callback(from, to);
                }
            }
            drop(draining);

            if self.inner.lock().pending_transitions.is_empty() {
                return;
            }
        }
    }

    /// Manually reset the circuit breaker to closed state.
    pub fn reset(&self) {
        {
            let mut inner = self.inner.lock();
            inner.consecutive_failures = 0;
            inner.opened_at = None;
            inner.trial_in_flight = false;
            self.transition(&mut inner, CircuitState::Closed);
        }
        self.notify();
    }

    /// Manually force the circuit open, restarting the reset timeout.
    pub fn force_open(&self) {
        {
            let mut inner = self.inner.lock();
            warn!(name = %self.config.name, "Circuit breaker forced OPEN");
            inner.consecutive_failures = 0;
            inner.opened_at = Some(Instant::now());
            inner.trial_in_flight = false;
            self.transition(&mut inner, CircuitState::Open);
        }
        self.notify();
    }

    /// Get total requests processed.
    pub fn total_requests(&self) -> u64 {
        self.total_requests.load(Ordering::Relaxed)
    }

    /// Get total successful requests.
    pub fn total_successes(&self) -> u64 {
        self.total_successes.load(Ordering::Relaxed)
    }

    /// Get total failed requests.
    pub fn total_failures(&self) -> u64 {
        self.total_failures.load(Ordering::Relaxed)
    }

    /// Get total rejected requests (circuit open).
    pub fn total_rejections(&self) -> u64 {
        self.total_rejections.load(Ordering::Relaxed)
    }

    /// Get circuit breaker statistics.
    pub fn stats(&self) -> CircuitBreakerStats {
        let (state, current_failure_count) = {
            let inner = self.inner.lock();
            (inner.state, inner.consecutive_failures)
        };

        CircuitBreakerStats {
            name: self.config.name.clone(),
            state,
            total_requests: self.total_requests(),
            total_successes: self.total_successes(),
            total_failures: self.total_failures(),
            total_rejections: self.total_rejections(),
            current_failure_count,
        }
    }
}

impl fmt::Debug for CircuitBreaker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CircuitBreaker")
            .field("name", &self.config.name)
            .field("state", &self.state())
            .finish()
    }
}

/// Admission granted by [`CircuitBreaker::try_acquire`].
#[must_use = "a permit must be settled with the outcome of the call"]
pub struct CallPermit<'a> {
    breaker: &'a CircuitBreaker,
    trial: bool,
    settled: bool,
}

impl<'a> CallPermit<'a> {
    fn new(breaker: &'a CircuitBreaker, trial: bool) -> Self {
        Self {
            breaker,
            trial,
            settled: false,
        }
    }

    /// Whether this permit is the half-open trial call.
    pub fn is_trial(&self) -> bool {
        self.trial
    }

    /// Settle the permit with the call's outcome.
    ///
    /// Errors rejected by the break predicate leave the failure count alone;
    /// for a trial call they prove the dependency answers and close the circuit.
    pub fn record<T>(self, outcome: &Outcome<T>) {
        match outcome {
            Ok(_) => self.record_success(),
            Err(error) => self.record_failure(error),
        }
    }

    /// Settle the permit as a success.
    pub fn record_success(mut self) {
        self.settled = true;
        self.breaker.on_success(self.trial);
    }

    /// Settle the permit with a failure.
    pub fn record_failure(mut self, error: &Error) {
        self.settled = true;
        if self.breaker.counts_as_failure(error) {
            self.breaker.on_failure(self.trial);
        } else if self.trial {
            self.breaker.on_success(true);
        }
    }
}

impl Drop for CallPermit<'_> {
    fn drop(&mut self) {
        if !self.settled {
            self.breaker.on_abandoned(self.trial);
        }
    }
}

/// Circuit breaker statistics.
#[derive(Debug, Clone)]
pub struct CircuitBreakerStats {
    /// Circuit breaker name.
    pub name: String,
    /// Current state.
    pub state: CircuitState,
    /// Total requests.
    pub total_requests: u64,
    /// Total successes.
    pub total_successes: u64,
    /// Total failures.
    pub total_failures: u64,
    /// Total rejections.
    pub total_rejections: u64,
    /// Current consecutive failure count.
    pub current_failure_count: u32,
}

impl CircuitBreakerStats {
    /// Calculate success rate (0.0 - 1.0).
    pub fn success_rate(&self) -> f64 {
        if self.total_requests == 0 {
            1.0
        } else {
            self.total_successes as f64 / self.total_requests as f64
        }
    }

    /// Calculate failure rate (0.0 - 1.0).
    pub fn failure_rate(&self) -> f64 {
        if self.total_requests == 0 {
            0.0
        } else {
            self.total_failures as f64 / self.total_requests as f64
        }
    }
}
