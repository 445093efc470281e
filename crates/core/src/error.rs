// Central Error Type for the Queue Subsystem

use thiserror::Error;

/// Queue-level error type
#[derive(Error, Debug)]
pub enum QueueError {
    /// Duplicate suppressed by a unique queue. Callers treat this as success.
    #[error("item already in queue")]
    AlreadyInQueue,

    /// Missing item behind a live counter; the queue is corrupted
    #[error("not found: {0}")]
    NotFound(String),

    #[error("backend error: {0}")]
    Backend(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("queue {0:?} is closed")]
    Closed(String),

    #[error("deadline exceeded")]
    DeadlineExceeded,

    #[error("operation cancelled")]
    Cancelled,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl QueueError {
    pub fn is_already_in_queue(&self) -> bool {
        matches!(self, QueueError::AlreadyInQueue)
    }

    /// Errors caused by shutdown rather than by the backend itself
    pub fn is_cancellation(&self) -> bool {
        matches!(self, QueueError::Cancelled | QueueError::Closed(_))
    }
}

/// Result type alias using QueueError
pub type Result<T> = std::result::Result<T, QueueError>;

// Note: sqlx / redis error conversion lives in the infra crates
// (orphan rules keep From<sqlx::Error> out of here)
