// Backend selection: the one place a QueueType becomes a concrete backend

use async_trait::async_trait;
use std::sync::Arc;
use tracing::debug;
use workq_core::application::backoff::BackoffConfig;
use workq_core::domain::{BaseConfig, QueueType};
use workq_core::memory::{ChannelQueue, DummyQueue};
use workq_core::port::{BackendFactory, BaseQueue};
use workq_core::Result;
use workq_infra_level::{LevelQueue, LevelStoreManager};
use workq_infra_redis::{RedisClientManager, RedisQueue};

/// Builds every backend type and owns the shared connection registries
#[derive(Default)]
pub struct DefaultBackendFactory {
    levels: Arc<LevelStoreManager>,
    redis: Arc<RedisClientManager>,
    backoff: BackoffConfig,
}

impl DefaultBackendFactory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_backoff(backoff: BackoffConfig) -> Self {
        Self {
            backoff,
            ..Self::default()
        }
    }

    pub fn level_stores(&self) -> &Arc<LevelStoreManager> {
        &self.levels
    }

    pub fn redis_clients(&self) -> &Arc<RedisClientManager> {
        &self.redis
    }
}

#[async_trait]
impl BackendFactory for DefaultBackendFactory {
    async fn create(
        &self,
        queue_type: QueueType,
        config: &BaseConfig,
        unique: bool,
    ) -> Result<Arc<dyn BaseQueue>> {
        debug!(
            queue = %config.managed_name,
            queue_type = %queue_type,
            unique,
            "Creating queue backend"
        );
        let base: Arc<dyn BaseQueue> = match queue_type {
            QueueType::Level => Arc::new(
                LevelQueue::new(Arc::clone(&self.levels), config, unique, self.backoff).await?,
            ),
            QueueType::Redis => Arc::new(
                RedisQueue::new(Arc::clone(&self.redis), config, unique, self.backoff).await?,
            ),
            QueueType::Channel => Arc::new(ChannelQueue::new(config.length, unique, self.backoff)),
            QueueType::Dummy => Arc::new(DummyQueue::new()),
        };
        Ok(base)
    }
}
