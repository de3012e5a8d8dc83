use std::fmt;

use serde::Serialize;
use thiserror::Error;

// =============================================================================
// Queue errors
// =============================================================================

/// Errors returned by the queue operations.
///
/// Blocking calls never report "full": they wait for space instead. Only the
/// non-blocking `try_enqueue` hands the item back through [`TryEnqueueError`].
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum QueueError {
    #[error("queue capacity must be at least 1")]
    ZeroCapacity,

    #[error("queue is closed: end-of-stream was already signalled")]
    Closed,

    #[error("end-of-stream was already signalled for this queue")]
    ShutdownAlreadySignalled,

    #[error("queue operation cancelled")]
    Cancelled,

    #[error("timed out after {millis}ms waiting on the queue")]
    Timeout { millis: u128 },
}

impl QueueError {
    pub fn timeout(duration: std::time::Duration) -> Self {
        Self::Timeout {
            millis: duration.as_millis(),
        }
    }
}

/// Result of a non-blocking enqueue that could not proceed.
#[derive(Debug, PartialEq, Eq)]
pub enum TryEnqueueError<T> {
    Full(T),
    Queue(QueueError),
}

impl<T> fmt::Display for TryEnqueueError<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TryEnqueueError::Full(_) => f.write_str("queue is full"),
            TryEnqueueError::Queue(err) => fmt::Display::fmt(err, f),
        }
    }
}

impl<T: fmt::Debug> std::error::Error for TryEnqueueError<T> {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            TryEnqueueError::Full(_) => None,
            TryEnqueueError::Queue(err) => Some(err),
        }
    }
}

impl<T> From<QueueError> for TryEnqueueError<T> {
    fn from(err: QueueError) -> Self {
        TryEnqueueError::Queue(err)
    }
}

impl<T> TryEnqueueError<T> {
    /// Recovers the rejected payload, if the queue handed it back.
    pub fn into_inner(self) -> Option<T> {
        match self {
            TryEnqueueError::Full(item) => Some(item),
            TryEnqueueError::Queue(_) => None,
        }
    }
}

// =============================================================================
// Processing errors
// =============================================================================

/// Failure raised by a processor for a single item.
///
/// Local to the consumer that hit it: logged, recorded in its report, and
/// never fed back into the queue.
#[derive(Error, Debug, Clone, PartialEq, Eq, Serialize)]
pub enum ProcessError {
    #[error("processing failed: {0}")]
    Failed(String),

    #[error("processor panicked: {0}")]
    Panicked(String),
}

impl ProcessError {
    pub fn failed(message: impl Into<String>) -> Self {
        Self::Failed(message.into())
    }
}

// =============================================================================
// Pool errors
// =============================================================================

#[derive(Error, Debug)]
pub enum PoolError {
    #[error("pool needs at least one consumer")]
    NoConsumers,

    #[error("failed to spawn consumer thread {id}: {source}")]
    Spawn {
        id: usize,
        #[source]
        source: std::io::Error,
    },

    #[error("consumer {id} terminated abnormally")]
    ConsumerLost { id: usize },

    #[error(transparent)]
    Queue(#[from] QueueError),
}

// =============================================================================
// Configuration errors
// =============================================================================

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid value for field '{field}': {reason}")]
    InvalidValue { field: String, reason: String },
}

impl ConfigError {
    pub fn invalid_value(field: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidValue {
            field: field.into(),
            reason: reason.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_timeout_message_reports_millis() {
        let err = QueueError::timeout(Duration::from_millis(250));
        assert_eq!(err.to_string(), "timed out after 250ms waiting on the queue");
    }

    #[test]
    fn test_try_enqueue_error_returns_payload() {
        let err: TryEnqueueError<&str> = TryEnqueueError::Full("Task 1");
        assert_eq!(err.into_inner(), Some("Task 1"));

        let err: TryEnqueueError<&str> = QueueError::Closed.into();
        assert_eq!(err.to_string(), "queue is closed: end-of-stream was already signalled");
        assert_eq!(err.into_inner(), None);
    }

    #[test]
    fn test_pool_error_wraps_queue_error() {
        let err: PoolError = QueueError::Cancelled.into();
        assert!(matches!(err, PoolError::Queue(QueueError::Cancelled)));
        assert_eq!(err.to_string(), "queue operation cancelled");
    }
}
