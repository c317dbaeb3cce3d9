// Error types for the Bulwark policies

use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;
use thiserror::Error;

/// Result of a protected operation: a success value or a typed [`Error`].
pub type Outcome<T> = Result<T, Error>;

/// Result of a call that may be interrupted by caller cancellation.
///
/// The outer `Err(Cancelled)` is the only interrupt that crosses policy
/// layers; every failure of the operation itself travels inside the
/// [`Outcome`].
pub type Guarded<T> = Result<Outcome<T>, Cancelled>;

/// Message, machine code and metadata shared by the descriptive error kinds.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ErrorDetail {
    pub message: String,
    pub code: Option<String>,
    pub metadata: BTreeMap<String, String>,
}

impl ErrorDetail {
    /// Create a detail with only a message.
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            code: None,
            metadata: BTreeMap::new(),
        }
    }
}

impl fmt::Display for ErrorDetail {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.code {
            Some(code) => write!(f, "{} [{}]", self.message, code),
            None => write!(f, "{}", self.message),
        }
    }
}

/// Closed taxonomy of failures carried in an [`Outcome`].
#[derive(Error, Debug, Clone, PartialEq)]
pub enum Error {
    #[error("Validation error: {0}")]
    Validation(ErrorDetail),

    #[error("Not found: {0}")]
    NotFound(ErrorDetail),

    #[error("Unauthorized: {0}")]
    Unauthorized(ErrorDetail),

    #[error("Forbidden: {0}")]
    Forbidden(ErrorDetail),

    #[error("Conflict: {0}")]
    Conflict(ErrorDetail),

    #[error("Bad request: {0}")]
    BadRequest(ErrorDetail),

    #[error("External service error: {0}")]
    ExternalService(ErrorDetail),

    #[error("Internal error: {0}")]
    Internal(ErrorDetail),

    #[error("Operation timed out after {elapsed:?} (timeout {timeout:?})")]
    Timeout { elapsed: Duration, timeout: Duration },

    #[error("Circuit breaker is open, retry after {retry_after:?}")]
    CircuitOpen { retry_after: Duration },

    #[error(
        "Bulkhead rejected call (max concurrency {max_concurrency}, max queue {max_queue_size})"
    )]
    BulkheadRejected {
        max_concurrency: usize,
        max_queue_size: usize,
    },
}

/// Discriminant of [`Error`], handy for predicates and metrics labels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    Validation,
    NotFound,
    Unauthorized,
    Forbidden,
    Conflict,
    BadRequest,
    ExternalService,
    Internal,
    Timeout,
    CircuitOpen,
    BulkheadRejected,
}

impl ErrorKind {
    /// Get the kind name.
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::Validation => "validation",
            ErrorKind::NotFound => "not_found",
            ErrorKind::Unauthorized => "unauthorized",
            ErrorKind::Forbidden => "forbidden",
            ErrorKind::Conflict => "conflict",
            ErrorKind::BadRequest => "bad_request",
            ErrorKind::ExternalService => "external_service",
            ErrorKind::Internal => "internal",
            ErrorKind::Timeout => "timeout",
            ErrorKind::CircuitOpen => "circuit_open",
            ErrorKind::BulkheadRejected => "bulkhead_rejected",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Error {
    /// Create a validation error.
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation(ErrorDetail::new(message))
    }

    /// Create a not found error.
    pub fn not_found(message: impl Into<String>) -> Self {
        Self::NotFound(ErrorDetail::new(message))
    }

    /// Create an unauthorized error.
    pub fn unauthorized(message: impl Into<String>) -> Self {
        Self::Unauthorized(ErrorDetail::new(message))
    }

    /// Create a forbidden error.
    pub fn forbidden(message: impl Into<String>) -> Self {
        Self::Forbidden(ErrorDetail::new(message))
    }

    /// Create a conflict error.
    pub fn conflict(message: impl Into<String>) -> Self {
        Self::Conflict(ErrorDetail::new(message))
    }

    /// Create a bad request error.
    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::BadRequest(ErrorDetail::new(message))
    }

    /// Create an external service error.
    pub fn external_service(message: impl Into<String>) -> Self {
        Self::ExternalService(ErrorDetail::new(message))
    }

    /// Create an internal error.
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal(ErrorDetail::new(message))
    }

    /// Create a timeout error.
    pub fn timeout(elapsed: Duration, timeout: Duration) -> Self {
        Self::Timeout { elapsed, timeout }
    }

    /// Create a circuit open rejection.
    pub fn circuit_open(retry_after: Duration) -> Self {
        Self::CircuitOpen { retry_after }
    }

    /// Create a bulkhead rejection.
    pub fn bulkhead_rejected(max_concurrency: usize, max_queue_size: usize) -> Self {
        Self::BulkheadRejected {
            max_concurrency,
            max_queue_size,
        }
    }

    /// Attach a machine-readable code. No-op for the policy rejection kinds.
    pub fn with_code(mut self, code: impl Into<String>) -> Self {
        if let Some(detail) = self.detail_mut() {
            detail.code = Some(code.into());
        }
        self
    }

    /// Attach a metadata entry. No-op for the policy rejection kinds.
    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        if let Some(detail) = self.detail_mut() {
            detail.metadata.insert(key.into(), value.into());
        }
        self
    }

    /// Get the error kind.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Validation(_) => ErrorKind::Validation,
            Self::NotFound(_) => ErrorKind::NotFound,
            Self::Unauthorized(_) => ErrorKind::Unauthorized,
            Self::Forbidden(_) => ErrorKind::Forbidden,
            Self::Conflict(_) => ErrorKind::Conflict,
            Self::BadRequest(_) => ErrorKind::BadRequest,
            Self::ExternalService(_) => ErrorKind::ExternalService,
            Self::Internal(_) => ErrorKind::Internal,
            Self::Timeout { .. } => ErrorKind::Timeout,
            Self::CircuitOpen { .. } => ErrorKind::CircuitOpen,
            Self::BulkheadRejected { .. } => ErrorKind::BulkheadRejected,
        }
    }

    /// Human readable message without the kind prefix.
    pub fn message(&self) -> String {
        match self.detail() {
            Some(detail) => detail.message.clone(),
            None => self.to_string(),
        }
    }

    /// Get the error code, if any.
    pub fn code(&self) -> Option<&str> {
        self.detail().and_then(|d| d.code.as_deref())
    }

    /// Get the attached metadata, if any.
    pub fn metadata(&self) -> Option<&BTreeMap<String, String>> {
        self.detail().map(|d| &d.metadata)
    }

    /// Whether this is a timeout.
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }

    /// Whether this is a circuit open rejection.
    pub fn is_circuit_open(&self) -> bool {
        matches!(self, Self::CircuitOpen { .. })
    }

    /// Whether this is a bulkhead rejection.
    pub fn is_bulkhead_rejected(&self) -> bool {
        matches!(self, Self::BulkheadRejected { .. })
    }

    /// Failures that may go away on their own if the call is repeated later.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::ExternalService(_)
                | Self::Timeout { .. }
                | Self::CircuitOpen { .. }
                | Self::BulkheadRejected { .. }
        )
    }

    fn detail(&self) -> Option<&ErrorDetail> {
        match self {
            Self::Validation(d)
            | Self::NotFound(d)
            | Self::Unauthorized(d)
            | Self::Forbidden(d)
            | Self::Conflict(d)
            | Self::BadRequest(d)
            | Self::ExternalService(d)
            | Self::Internal(d) => Some(d),
            _ => None,
        }
    }

    fn detail_mut(&mut self) -> Option<&mut ErrorDetail> {
        match self {
            Self::Validation(d)
            | Self::NotFound(d)
            | Self::Unauthorized(d)
            | Self::Forbidden(d)
            | Self::Conflict(d)
            | Self::BadRequest(d)
            | Self::ExternalService(d)
            | Self::Internal(d) => Some(d),
            _ => None,
        }
    }
}

/// The caller cancelled the call before it settled.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
#[error("Operation cancelled by caller")]
pub struct Cancelled;

/// Rejected policy configuration, reported at construction time.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("{field} must be greater than zero")]
    NonPositive { field: &'static str },

    #[error("{field} is out of range: {value} (expected {expected})")]
    OutOfRange {
        field: &'static str,
        value: String,
        expected: &'static str,
    },
}

impl ConfigError {
    pub(crate) fn non_positive(field: &'static str) -> Self {
        Self::NonPositive { field }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_kind_and_message() {
        let err = Error::external_service("upstream returned 503").with_code("UPSTREAM_503");

        assert_eq!(err.kind(), ErrorKind::ExternalService);
        assert_eq!(err.message(), "upstream returned 503");
        assert_eq!(err.code(), Some("UPSTREAM_503"));
        assert_eq!(
            err.to_string(),
            "External service error: upstream returned 503 [UPSTREAM_503]"
        );
    }

    #[test]
    fn test_metadata() {
        let err = Error::validation("bad email").with_metadata("field", "email");
        let metadata = err.metadata().unwrap();
        assert_eq!(metadata.get("field").map(String::as_str), Some("email"));
    }

    #[test]
    fn test_policy_errors_ignore_code() {
        let err = Error::circuit_open(Duration::from_secs(3)).with_code("IGNORED");
        assert_eq!(err.code(), None);
        assert!(err.is_circuit_open());
        assert!(err.is_transient());
    }

    #[test]
    fn test_transient_classification() {
        assert!(Error::timeout(Duration::from_millis(5), Duration::from_millis(5)).is_transient());
        assert!(Error::bulkhead_rejected(1, 0).is_transient());
        assert!(!Error::not_found("user 7").is_transient());
        assert!(!Error::validation("x").is_transient());
    }

    #[test]
    fn test_config_error_display() {
        let err = ConfigError::non_positive("max_attempts");
        assert_eq!(err.to_string(), "max_attempts must be greater than zero");
    }
}
