// Backend Factory Port
//
// Core cannot depend on storage crates, so the composition root hands the
// queue manager something that turns a resolved config into a backend.

use crate::domain::{BaseConfig, QueueType};
use crate::error::Result;
use crate::port::BaseQueue;
use async_trait::async_trait;
use std::sync::Arc;

#[async_trait]
pub trait BackendFactory: Send + Sync {
    /// Build (or attach to) the backend for `queue_type`.
    ///
    /// Fails fast on configuration errors; nothing is partially constructed.
    async fn create(
        &self,
        queue_type: QueueType,
        config: &BaseConfig,
        unique: bool,
    ) -> Result<Arc<dyn BaseQueue>>;
}
