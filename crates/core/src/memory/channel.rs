// In-memory channel backend
//
// Bounded FIFO held in process memory. Not durable: whatever is queued at
// exit is lost.

use crate::application::backoff::{backoff_ret_err, Attempt, BackoffConfig};
use crate::application::worker_pool::constants::PUSH_BLOCK_TIME;
use crate::error::{QueueError, Result};
use crate::port::BaseQueue;
use async_trait::async_trait;
use std::collections::{HashSet, VecDeque};
use std::sync::{Mutex, MutexGuard, PoisonError};
use tokio::sync::Notify;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

#[derive(Default)]
struct ChannelState {
    items: VecDeque<Vec<u8>>,
    members: HashSet<Vec<u8>>,
}

pub struct ChannelQueue {
    state: Mutex<ChannelState>,
    available: Notify,
    length: usize,
    unique: bool,
    backoff: BackoffConfig,
}

impl ChannelQueue {
    pub fn new(length: usize, unique: bool, backoff: BackoffConfig) -> Self {
        Self {
            state: Mutex::new(ChannelState::default()),
            available: Notify::new(),
            length: length.max(1),
            unique,
            backoff,
        }
    }

    fn lock(&self) -> MutexGuard<'_, ChannelState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn try_push(&self, data: &[u8]) -> Result<Attempt<()>> {
        let mut state = self.lock();
        if self.unique && state.members.contains(data) {
            return Err(QueueError::AlreadyInQueue);
        }
        if state.items.len() >= self.length {
            return Ok(Attempt::Retry);
        }
        if self.unique {
            state.members.insert(data.to_vec());
        }
        state.items.push_back(data.to_vec());
        drop(state);

        self.available.notify_one();
        Ok(Attempt::Done(()))
    }

    fn try_pop(&self) -> Option<Vec<u8>> {
        let mut state = self.lock();
        let item = state.items.pop_front()?;
        if self.unique {
            state.members.remove(&item);
        }
        let more = !state.items.is_empty();
        drop(state);

        // pass the wakeup on to the next idle worker
        if more {
            self.available.notify_one();
        }
        Some(item)
    }
}

#[async_trait]
impl BaseQueue for ChannelQueue {
    async fn push_item(&self, cancel: &CancellationToken, data: &[u8]) -> Result<()> {
        let deadline = Instant::now() + PUSH_BLOCK_TIME;
        backoff_ret_err(cancel, self.backoff, Some(deadline), || async {
            self.try_push(data)
        })
        .await
    }

    async fn pop_item(&self, cancel: &CancellationToken) -> Result<Option<Vec<u8>>> {
        loop {
            if cancel.is_cancelled() {
                return Err(QueueError::Cancelled);
            }
            let notified = self.available.notified();
            if let Some(item) = self.try_pop() {
                return Ok(Some(item));
            }
            tokio::select! {
                _ = notified => {}
                _ = cancel.cancelled() => return Err(QueueError::Cancelled),
            }
        }
    }

    async fn has_item(&self, data: &[u8]) -> Result<bool> {
        if !self.unique {
            return Ok(false);
        }
        Ok(self.lock().members.contains(data))
    }

    async fn len(&self) -> Result<usize> {
        Ok(self.lock().items.len())
    }

    async fn remove_all(&self) -> Result<()> {
        let mut state = self.lock();
        state.items.clear();
        state.members.clear();
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn tiny_backoff() -> BackoffConfig {
        BackoffConfig::new(Duration::from_millis(1), Duration::from_millis(1))
    }

    #[tokio::test]
    async fn test_fifo_order() {
        let q = ChannelQueue::new(10, false, tiny_backoff());
        let cancel = CancellationToken::new();
        for item in ["p1", "p2", "p3"] {
            q.push_item(&cancel, item.as_bytes()).await.unwrap();
        }
        for item in ["p1", "p2", "p3"] {
            assert_eq!(q.pop_item(&cancel).await.unwrap().unwrap(), item.as_bytes());
        }
        assert_eq!(q.len().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_unique_push_pop_push() {
        let q = ChannelQueue::new(10, true, tiny_backoff());
        let cancel = CancellationToken::new();

        q.push_item(&cancel, b"A").await.unwrap();
        let err = q.push_item(&cancel, b"A").await.unwrap_err();
        assert!(err.is_already_in_queue());
        assert_eq!(q.len().await.unwrap(), 1);
        assert!(q.has_item(b"A").await.unwrap());

        assert_eq!(q.pop_item(&cancel).await.unwrap().unwrap(), b"A");
        assert!(!q.has_item(b"A").await.unwrap());
        q.push_item(&cancel, b"A").await.unwrap();
        assert_eq!(q.len().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_pop_blocks_until_push() {
        let q = std::sync::Arc::new(ChannelQueue::new(10, false, tiny_backoff()));
        let cancel = CancellationToken::new();

        let popper = {
            let q = q.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move { q.pop_item(&cancel).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        q.push_item(&cancel, b"late").await.unwrap();

        let popped = popper.await.unwrap().unwrap();
        assert_eq!(popped.unwrap(), b"late");
    }

    #[tokio::test]
    async fn test_pop_cancelled() {
        let q = ChannelQueue::new(10, false, tiny_backoff());
        let cancel = CancellationToken::new();
        cancel.cancel();
        assert!(matches!(
            q.pop_item(&cancel).await,
            Err(QueueError::Cancelled)
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_full_queue_push_times_out() {
        let q = ChannelQueue::new(1, false, tiny_backoff());
        let cancel = CancellationToken::new();
        q.push_item(&cancel, b"1").await.unwrap();
        let err = q.push_item(&cancel, b"2").await.unwrap_err();
        assert!(matches!(err, QueueError::DeadlineExceeded));
        assert_eq!(q.len().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_remove_all_clears_set() {
        let q = ChannelQueue::new(10, true, tiny_backoff());
        let cancel = CancellationToken::new();
        q.push_item(&cancel, b"x").await.unwrap();
        q.remove_all().await.unwrap();
        assert_eq!(q.len().await.unwrap(), 0);
        q.push_item(&cancel, b"x").await.unwrap();
    }
}
