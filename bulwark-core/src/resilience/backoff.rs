//! Backoff strategies used between retry attempts.
//!
//! A backoff is a pure function from the 1-based number of the attempt that
//! just failed to the time to wait before the next one.
//!
//! ```rust,ignore
//! use bulwark::resilience::Backoff;
//! use std::time::Duration;
//!
//! let backoff = Backoff::exponential(Duration::from_millis(100))
//!     .with_max_delay(Duration::from_millis(300));
//!
//! assert_eq!(backoff.delay(1), Duration::from_millis(100));
//! assert_eq!(backoff.delay(2), Duration::from_millis(200));
//! assert_eq!(backoff.delay(3), Duration::from_millis(300));
//! ```

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

/// Type alias for a user supplied backoff function.
pub type BackoffFn = Arc<dyn Fn(u32) -> Duration + Send + Sync>;

/// Backoff strategy for retries.
#[derive(Clone, Default)]
pub enum Backoff {
    /// No delay between retries.
    #[default]
    None,
    /// Constant delay between retries.
    Constant(Duration),
    /// Linear backoff: `initial + increment * (attempt - 1)`.
    Linear {
        /// Delay after the first attempt.
        initial: Duration,
        /// Added for every further attempt.
        increment: Duration,
        /// Upper bound.
        max_delay: Duration,
    },
    /// Exponential backoff: `initial * multiplier^(attempt - 1)`.
    Exponential {
        /// Delay after the first attempt.
        initial: Duration,
        /// Growth factor (typically 2.0).
        multiplier: f64,
        /// Upper bound.
        max_delay: Duration,
    },
    /// Arbitrary function of the attempt number.
    Custom(BackoffFn),
}

impl Backoff {
    /// Create constant backoff.
    pub fn constant(delay: Duration) -> Self {
        Self::Constant(delay)
    }

    /// Create linear backoff without an upper bound.
    pub fn linear(initial: Duration, increment: Duration) -> Self {
        Self::Linear {
            initial,
            increment,
            max_delay: Duration::MAX,
        }
    }

    /// Create exponential backoff doubling on every attempt, without an upper bound.
    pub fn exponential(initial: Duration) -> Self {
        Self::Exponential {
            initial,
            multiplier: 2.0,
            max_delay: Duration::MAX,
        }
    }

    /// Create backoff from a function of the attempt number.
    pub fn custom<F>(f: F) -> Self
    where
        F: Fn(u32) -> Duration + Send + Sync + 'static,
    {
        Self::Custom(Arc::new(f))
    }

    /// Set the growth factor of an exponential backoff.
    pub fn with_multiplier(self, multiplier: f64) -> Self {
        match self {
            Self::Exponential {
                initial, max_delay, ..
            } => Self::Exponential {
                initial,
                multiplier,
                max_delay,
            },
            other => other,
        }
    }

    /// Set the maximum delay of a linear or exponential backoff.
    pub fn with_max_delay(self, max_delay: Duration) -> Self {
        match self {
            Self::Linear {
                initial, increment, ..
            } => Self::Linear {
                initial,
                increment,
                max_delay,
            },
            Self::Exponential {
                initial,
                multiplier,
                ..
            } => Self::Exponential {
                initial,
                multiplier,
                max_delay,
            },
            other => other,
        }
    }

    /// Delay to wait after the given attempt (1-based; 0 is treated as 1).
    pub fn delay(&self, attempt: u32) -> Duration {
        let n = attempt.max(1) - 1;
        match self {
            Self::None => Duration::ZERO,
            Self::Constant(d) => *d,
            Self::Linear {
                initial,
                increment,
                max_delay,
            } => initial
                .saturating_add(increment.saturating_mul(n))
                .min(*max_delay),
            Self::Exponential {
                initial,
                multiplier,
                max_delay,
            } => {
                let nanos = initial.as_nanos() as f64 * multiplier.powi(n.min(i32::MAX as u32) as i32);
                let delay = if nanos.is_finite() && nanos < u64::MAX as f64 {
                    Duration::from_nanos(nanos.max(0.0) as u64)
                } else {
                    Duration::MAX
                };
                delay.min(*max_delay)
            }
            Self::Custom(f) => f(attempt.max(1)),
        }
    }
}

impl fmt::Debug for Backoff {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::None => write!(f, "None"),
            Self::Constant(d) => f.debug_tuple("Constant").field(d).finish(),
            Self::Linear {
                initial,
                increment,
                max_delay,
            } => f
                .debug_struct("Linear")
                .field("initial", initial)
                .field("increment", increment)
                .field("max_delay", max_delay)
                .finish(),
            Self::Exponential {
                initial,
                multiplier,
                max_delay,
            } => f
                .debug_struct("Exponential")
                .field("initial", initial)
                .field("multiplier", multiplier)
                .field("max_delay", max_delay)
                .finish(),
            Self::Custom(_) => write!(f, "Custom"),
        }
    }
}
