// Base Queue Port (Interface)

use crate::error::Result;
use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

/// Minimal persistent-list contract implemented by every backend.
///
/// Payloads are opaque bytes; FIFO order is preserved per backend. Backends
/// constructed as "unique" also keep a membership set so that a payload can
/// only be queued once at a time.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait BaseQueue: Send + Sync {
    /// Append `data` to the tail.
    ///
    /// Unique backends return `QueueError::AlreadyInQueue` for a payload that
    /// is already queued. Blocks (with backoff) while the queue is full.
    async fn push_item(&self, cancel: &CancellationToken, data: &[u8]) -> Result<()>;

    /// Remove and return the head item.
    ///
    /// Blocking backends poll until an item appears or `cancel` fires
    /// (`QueueError::Cancelled`). The dummy backend returns `Ok(None)`.
    async fn pop_item(&self, cancel: &CancellationToken) -> Result<Option<Vec<u8>>>;

    /// Membership test against the dedup set (always false for plain queues)
    async fn has_item(&self, data: &[u8]) -> Result<bool>;

    /// Current queue depth
    async fn len(&self) -> Result<usize>;

    /// Clear the queue and its dedup set
    async fn remove_all(&self) -> Result<()>;

    /// Release this queue's share of the underlying connection (idempotent)
    async fn close(&self) -> Result<()>;
}
