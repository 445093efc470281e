// No-op backend: persistence disabled

use crate::error::Result;
use crate::port::BaseQueue;
use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

/// Accepts every push and never yields an item
#[derive(Debug, Default, Clone, Copy)]
pub struct DummyQueue;

impl DummyQueue {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl BaseQueue for DummyQueue {
    async fn push_item(&self, _cancel: &CancellationToken, _data: &[u8]) -> Result<()> {
        Ok(())
    }

    async fn pop_item(&self, _cancel: &CancellationToken) -> Result<Option<Vec<u8>>> {
        Ok(None)
    }

    async fn has_item(&self, _data: &[u8]) -> Result<bool> {
        Ok(false)
    }

    async fn len(&self) -> Result<usize> {
        Ok(0)
    }

    async fn remove_all(&self) -> Result<()> {
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        Ok(())
    }
}
