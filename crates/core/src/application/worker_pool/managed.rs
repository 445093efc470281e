// Type-erased view of a worker-pool queue for the manager and admin tools

use super::{QueueState, WorkerPoolQueue};
use crate::domain::QueueType;
use crate::error::Result;
use async_trait::async_trait;
use std::time::Duration;

#[async_trait]
pub trait ManagedQueue: Send + Sync {
    fn name(&self) -> &str;

    fn queue_type(&self) -> QueueType;

    fn item_type_name(&self) -> &'static str;

    fn state(&self) -> QueueState;

    fn worker_max_number(&self) -> usize;

    fn set_worker_max_number(&self, max: usize);

    fn active_workers(&self) -> usize;

    async fn len(&self) -> Result<usize>;

    async fn remove_all_items(&self) -> Result<()>;

    async fn flush(&self, timeout: Duration) -> Result<()>;

    async fn shutdown_wait(&self, timeout: Duration) -> Result<()>;
}

#[async_trait]
impl<T> ManagedQueue for WorkerPoolQueue<T>
where
    T: Send + Sync + 'static,
{
    fn name(&self) -> &str {
        WorkerPoolQueue::name(self)
    }

    fn queue_type(&self) -> QueueType {
        WorkerPoolQueue::queue_type(self)
    }

    fn item_type_name(&self) -> &'static str {
        WorkerPoolQueue::item_type_name(self)
    }

    fn state(&self) -> QueueState {
        WorkerPoolQueue::state(self)
    }

    fn worker_max_number(&self) -> usize {
        WorkerPoolQueue::worker_max_number(self)
    }

    fn set_worker_max_number(&self, max: usize) {
        WorkerPoolQueue::set_worker_max_number(self, max)
    }

    fn active_workers(&self) -> usize {
        WorkerPoolQueue::active_workers(self)
    }

    async fn len(&self) -> Result<usize> {
        WorkerPoolQueue::len(self).await
    }

    async fn remove_all_items(&self) -> Result<()> {
        WorkerPoolQueue::remove_all_items(self).await
    }

    async fn flush(&self, timeout: Duration) -> Result<()> {
        WorkerPoolQueue::flush(self, timeout).await
    }

    async fn shutdown_wait(&self, timeout: Duration) -> Result<()> {
        WorkerPoolQueue::shutdown_wait(self, timeout).await
    }
}
