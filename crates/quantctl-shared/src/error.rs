//! # Error Taxonomy
//!
//! A single orthogonal set of error kinds shared by every component in the
//! workspace. Each crate/component defines its own `thiserror` enum for the
//! errors it can actually produce, and exposes a `kind()` accessor that maps
//! back onto [`ErrorKind`] so callers can make retry/surface decisions
//! without matching on every concrete variant.

use std::time::Duration;
use thiserror::Error;

/// Orthogonal error classification, independent of which component raised it.
///
/// Mirrors the error-kind table in the system specification: policy is a
/// property of the *kind*, not the component.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Broker, health probe, or exchange adapter I/O that is worth retrying.
    TransientIo,
    /// A bounded queue rejected a publish; surfaced, never retried.
    QueueFull,
    /// A state machine rejected a transition.
    InvalidState,
    /// A gatekeeper validation gate failed; reasons are attached by the caller.
    ValidationFailed,
    /// A restart/retry budget was exhausted.
    ResourceExhausted,
    /// Cooperative cancellation observed at a suspension point.
    Cancelled,
    /// An operation exceeded its configured deadline.
    Timeout,
    /// An invariant was violated; the owning component should abort.
    Fatal,
}

impl ErrorKind {
    /// Whether this kind is, in general, worth retrying with backoff.
    pub fn is_retriable(&self) -> bool {
        matches!(self, ErrorKind::TransientIo)
    }
}

/// Top-level error type for the `quantctl-shared` crate and the workspace's
/// ambient concerns (config, logging, messaging transport).
#[derive(Debug, Error)]
pub enum QuantctlError {
    #[error("transient I/O error: {0}")]
    TransientIo(String),

    #[error("queue is full")]
    QueueFull,

    #[error("invalid state transition: {0}")]
    InvalidState(String),

    #[error("validation failed: {0:?}")]
    ValidationFailed(Vec<String>),

    #[error("resource exhausted: {0}")]
    ResourceExhausted(String),

    #[error("operation cancelled")]
    Cancelled,

    #[error("operation timed out after {0:?}")]
    Timeout(Duration),

    #[error("fatal invariant violation: {0}")]
    Fatal(String),

    #[error("messaging error: {0}")]
    MessagingError(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Serialization(#[from] serde_json::Error),

    #[error(transparent)]
    Database(#[from] sqlx::Error),
}

impl QuantctlError {
    /// Map this error onto the orthogonal taxonomy.
    pub fn kind(&self) -> ErrorKind {
        match self {
            QuantctlError::TransientIo(_) | QuantctlError::Io(_) | QuantctlError::Database(_) => {
                ErrorKind::TransientIo
            }
            QuantctlError::QueueFull => ErrorKind::QueueFull,
            QuantctlError::InvalidState(_) => ErrorKind::InvalidState,
            QuantctlError::ValidationFailed(_) => ErrorKind::ValidationFailed,
            QuantctlError::ResourceExhausted(_) => ErrorKind::ResourceExhausted,
            QuantctlError::Cancelled => ErrorKind::Cancelled,
            QuantctlError::Timeout(_) => ErrorKind::Timeout,
            QuantctlError::Fatal(_) => ErrorKind::Fatal,
            QuantctlError::MessagingError(_) | QuantctlError::Serialization(_) => {
                ErrorKind::TransientIo
            }
            QuantctlError::Config(_) => ErrorKind::Fatal,
        }
    }

    /// Whether a caller should retry this error with backoff.
    pub fn is_retriable(&self) -> bool {
        self.kind().is_retriable()
    }
}

/// Convenience alias used throughout the workspace.
pub type QuantctlResult<T> = std::result::Result<T, QuantctlError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transient_io_is_retriable() {
        assert!(QuantctlError::TransientIo("broker down".into()).is_retriable());
    }

    #[test]
    fn validation_failed_is_not_retriable() {
        assert!(!QuantctlError::ValidationFailed(vec!["sharpe<0.5".into()]).is_retriable());
    }

    #[test]
    fn fatal_is_not_retriable() {
        assert!(!QuantctlError::Fatal("invariant violated".into()).is_retriable());
    }
}
