//! Core error taxonomy.
//!
//! Internal plumbing uses `anyhow::Result` throughout, matching the rest of
//! the crate's ambient style. `CoreError` is the typed error surfaced at
//! public API boundaries so callers can match on `kind()` without string
//! sniffing.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Error kind discriminator, independent of the concrete error type.
///
/// Mirrors the retry/terminal semantics in the job lifecycle: `kind()`
/// tells a caller (or the worker loop) whether a failure is worth retrying
/// without needing to downcast.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorKind {
    /// Malformed submission, unknown provider type, invalid cron expression.
    /// Reported synchronously; never retried.
    Validation,
    /// Queue full, pool at capacity. Surfaced to the caller immediately.
    Capacity,
    /// Network timeouts, 5xx, connection reset. Eligible for retry.
    Transient,
    /// 4xx (except rate-limit), credential failure, not-found. Never retried.
    Permanent,
    /// Job deadline elapsed. Retried iff attempts remain.
    Timeout,
    /// Caller-initiated abort. Never retried; terminal.
    Cancelled,
    /// Store unavailable, pool closed, manager shut down. Fail-fast.
    Fatal,
}

impl ErrorKind {
    /// Whether a failure of this kind is eligible for retry, assuming the
    /// job's attempt budget isn't exhausted.
    pub fn is_retryable(self) -> bool {
        matches!(self, ErrorKind::Transient | ErrorKind::Timeout)
    }
}

/// Typed error returned at the public API boundary of the core.
#[derive(Debug, Error)]
pub enum CoreError {
    #[error("validation: {0}")]
    Validation(String),

    #[error("at capacity: {0}")]
    Capacity(String),

    #[error("unknown provider type: {0}")]
    UnknownProvider(String),

    #[error("queue is full (max_queue_size reached)")]
    QueueFull,

    #[error("queue is empty")]
    QueueEmpty,

    #[error("at capacity waiting for a connection")]
    AtCapacity,

    #[error("job {0} not found")]
    JobNotFound(uuid::Uuid),

    #[error("job {0} was cancelled")]
    Cancelled(uuid::Uuid),

    #[error("operation timed out")]
    Timeout,

    #[error("manager is shutting down")]
    ShuttingDown,

    #[error(transparent)]
    Store(#[from] anyhow::Error),
}

impl CoreError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            CoreError::Validation(_) | CoreError::UnknownProvider(_) => ErrorKind::Validation,
            CoreError::Capacity(_) | CoreError::QueueFull | CoreError::AtCapacity => {
                ErrorKind::Capacity
            }
            CoreError::QueueEmpty => ErrorKind::Validation,
            CoreError::JobNotFound(_) => ErrorKind::Permanent,
            CoreError::Cancelled(_) => ErrorKind::Cancelled,
            CoreError::Timeout => ErrorKind::Timeout,
            CoreError::ShuttingDown => ErrorKind::Fatal,
            CoreError::Store(_) => ErrorKind::Fatal,
        }
    }
}

pub type Result<T> = std::result::Result<T, CoreError>;
