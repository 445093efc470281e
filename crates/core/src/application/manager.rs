// Named Queue Registry
//
// Built once at startup and shared by Arc. Caches one worker-pool queue per
// name so subsystems pointing at the same store share its connection.

use crate::application::shutdown::ShutdownToken;
use crate::application::worker_pool::{ManagedQueue, QueueState, WorkerPoolOptions, WorkerPoolQueue};
use crate::domain::{BaseConfig, QueueSettingsSet};
use crate::error::{QueueError, Result};
use crate::port::{BackendFactory, Handler, JsonCodec};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::any::Any;
use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tracing::{info, warn};

struct Entry {
    qid: i64,
    unique: bool,
    managed: Arc<dyn ManagedQueue>,
    typed: Arc<dyn Any + Send + Sync>,
}

pub struct QueueManager {
    settings: QueueSettingsSet,
    factory: Arc<dyn BackendFactory>,
    shutdown: ShutdownToken,
    options: WorkerPoolOptions,
    queues: Mutex<HashMap<String, Entry>>,
    next_qid: AtomicI64,
}

impl QueueManager {
    pub fn new(
        settings: QueueSettingsSet,
        factory: Arc<dyn BackendFactory>,
        shutdown: ShutdownToken,
    ) -> Self {
        Self::with_options(settings, factory, shutdown, WorkerPoolOptions::default())
    }

    pub fn with_options(
        settings: QueueSettingsSet,
        factory: Arc<dyn BackendFactory>,
        shutdown: ShutdownToken,
        options: WorkerPoolOptions,
    ) -> Self {
        Self {
            settings,
            factory,
            shutdown,
            options,
            queues: Mutex::new(HashMap::new()),
            next_qid: AtomicI64::new(1),
        }
    }

    pub fn settings(&self) -> &QueueSettingsSet {
        &self.settings
    }

    /// Get or start the deduplicating queue `name`
    pub async fn create_unique_queue<T>(
        &self,
        name: &str,
        handler: Arc<dyn Handler<T>>,
    ) -> Result<Arc<WorkerPoolQueue<T>>>
    where
        T: Serialize + DeserializeOwned + Send + Sync + 'static,
    {
        self.get_or_create(name, handler, true).await
    }

    /// Get or start the plain FIFO queue `name`
    pub async fn create_simple_queue<T>(
        &self,
        name: &str,
        handler: Arc<dyn Handler<T>>,
    ) -> Result<Arc<WorkerPoolQueue<T>>>
    where
        T: Serialize + DeserializeOwned + Send + Sync + 'static,
    {
        self.get_or_create(name, handler, false).await
    }

    async fn get_or_create<T>(
        &self,
        name: &str,
        handler: Arc<dyn Handler<T>>,
        unique: bool,
    ) -> Result<Arc<WorkerPoolQueue<T>>>
    where
        T: Serialize + DeserializeOwned + Send + Sync + 'static,
    {
        let cached = self
            .lock()
            .get(name)
            .map(|entry| Self::cached(name, entry, unique));
        if let Some(found) = cached {
            return found;
        }

        // Backend setup does I/O, so it runs outside the lock
        let settings = self.settings.get_queue_settings(name)?;
        let config = BaseConfig::from_settings(name, &settings);
        let base = self
            .factory
            .create(settings.queue_type, &config, unique)
            .await?;
        let queue = WorkerPoolQueue::with_options(
            &settings,
            base,
            Arc::new(JsonCodec::new()),
            handler,
            &self.shutdown,
            self.options,
        );

        let existing = {
            let mut queues = self.lock();
            match queues.get(name) {
                Some(entry) => Some(Self::cached(name, entry, unique)),
                None => {
                    let qid = self.next_qid.fetch_add(1, Ordering::SeqCst);
                    queues.insert(
                        name.to_string(),
                        Entry {
                            qid,
                            unique,
                            managed: queue.clone(),
                            typed: queue.clone(),
                        },
                    );
                    info!(
                        queue = %name,
                        qid,
                        queue_type = %settings.queue_type,
                        unique,
                        "Registered managed queue"
                    );
                    None
                }
            }
        };

        if let Some(existing) = existing {
            // lost the race: drop our copy, it never ran
            queue.shutdown_wait(Duration::ZERO).await?;
            return existing;
        }

        self.shutdown.spawn(Arc::clone(&queue).run());
        Ok(queue)
    }

    /// A cached queue is only handed out for the same item type and flavor
    fn cached<T>(name: &str, entry: &Entry, unique: bool) -> Result<Arc<WorkerPoolQueue<T>>>
    where
        T: Send + Sync + 'static,
    {
        if entry.unique != unique {
            let flavor = if entry.unique { "unique" } else { "simple" };
            return Err(QueueError::Config(format!(
                "queue {name:?} already exists as a {flavor} queue"
            )));
        }
        Arc::clone(&entry.typed)
            .downcast::<WorkerPoolQueue<T>>()
            .map_err(|_| {
                QueueError::Config(format!(
                    "queue {name:?} already exists with item type {}",
                    entry.managed.item_type_name()
                ))
            })
    }

    /// All registered queues ordered by qid
    pub fn managed_queues(&self) -> Vec<(i64, Arc<dyn ManagedQueue>)> {
        let mut all: Vec<_> = self
            .lock()
            .values()
            .map(|e| (e.qid, Arc::clone(&e.managed)))
            .collect();
        all.sort_by_key(|(qid, _)| *qid);
        all
    }

    pub fn get_managed_queue(&self, qid: i64) -> Option<Arc<dyn ManagedQueue>> {
        self.lock()
            .values()
            .find(|e| e.qid == qid)
            .map(|e| Arc::clone(&e.managed))
    }

    pub fn get_by_name(&self, name: &str) -> Option<Arc<dyn ManagedQueue>> {
        self.lock().get(name).map(|e| Arc::clone(&e.managed))
    }

    /// Flush every running queue, stopping at the first failure
    pub async fn flush_all(&self, timeout: Duration) -> Result<()> {
        for (qid, queue) in self.managed_queues() {
            if queue.state() != QueueState::Running {
                continue;
            }
            if let Err(e) = queue.flush(timeout).await {
                warn!(queue = %queue.name(), qid, error = %e, "Failed to flush queue");
                return Err(e);
            }
        }
        Ok(())
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, Entry>> {
        self.queues.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::application::backoff::BackoffConfig;
    use crate::application::shutdown::shutdown_channel;
    use crate::domain::{QueueSettings, QueueType};
    use crate::memory::{ChannelQueue, DummyQueue};
    use crate::port::BaseQueue;
    use async_trait::async_trait;
    use std::sync::atomic::AtomicUsize;

    #[derive(Default)]
    struct MemoryFactory {
        created: AtomicUsize,
    }

    #[async_trait]
    impl BackendFactory for MemoryFactory {
        async fn create(
            &self,
            queue_type: QueueType,
            config: &BaseConfig,
            unique: bool,
        ) -> Result<Arc<dyn BaseQueue>> {
            self.created.fetch_add(1, Ordering::SeqCst);
            match queue_type {
                QueueType::Channel => Ok(Arc::new(ChannelQueue::new(
                    config.length,
                    unique,
                    BackoffConfig::new(Duration::from_millis(1), Duration::from_millis(1)),
                ))),
                QueueType::Dummy => Ok(Arc::new(DummyQueue::new())),
                other => Err(QueueError::Config(format!("unsupported in tests: {other}"))),
            }
        }
    }

    fn manager(factory: Arc<MemoryFactory>, token: ShutdownToken) -> QueueManager {
        let settings = QueueSettingsSet {
            queue: QueueSettings {
                queue_type: QueueType::Channel,
                batch_length: 2,
                max_workers: 1,
                ..Default::default()
            },
            ..Default::default()
        };
        QueueManager::with_options(
            settings,
            factory,
            token,
            WorkerPoolOptions {
                backoff: BackoffConfig::new(Duration::from_millis(1), Duration::from_millis(1)),
                batch_wait: Duration::from_millis(10),
                requeue_delay: Duration::ZERO,
            },
        )
    }

    fn noop_handler() -> Arc<dyn Handler<String>> {
        Arc::new(|_items: Vec<String>| -> Vec<String> { Vec::new() })
    }

    #[tokio::test]
    async fn test_repeated_name_returns_cached_queue() {
        let (tx, token) = shutdown_channel();
        let factory = Arc::new(MemoryFactory::default());
        let mgr = manager(factory.clone(), token);

        let a = mgr.create_unique_queue("mirror", noop_handler()).await.unwrap();
        let b = mgr.create_unique_queue("mirror", noop_handler()).await.unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(factory.created.load(Ordering::SeqCst), 1);

        let stats = mgr.create_simple_queue("stats", noop_handler()).await.unwrap();
        assert!(!Arc::ptr_eq(&a, &stats));
        assert_eq!(factory.created.load(Ordering::SeqCst), 2);

        tx.shutdown_and_wait(Duration::from_secs(5)).await;
    }

    #[tokio::test]
    async fn test_qids_and_lookup() {
        let (tx, token) = shutdown_channel();
        let mgr = manager(Arc::new(MemoryFactory::default()), token);

        mgr.create_simple_queue("first", noop_handler()).await.unwrap();
        mgr.create_simple_queue("second", noop_handler()).await.unwrap();

        let all = mgr.managed_queues();
        let names: Vec<_> = all.iter().map(|(qid, q)| (*qid, q.name().to_string())).collect();
        assert_eq!(names, vec![(1, "first".to_string()), (2, "second".to_string())]);

        assert_eq!(mgr.get_managed_queue(2).unwrap().name(), "second");
        assert!(mgr.get_managed_queue(99).is_none());
        assert_eq!(mgr.get_by_name("first").unwrap().queue_type(), QueueType::Channel);

        tx.shutdown_and_wait(Duration::from_secs(5)).await;
    }

    #[tokio::test]
    async fn test_item_type_mismatch_is_config_error() {
        let (tx, token) = shutdown_channel();
        let mgr = manager(Arc::new(MemoryFactory::default()), token);

        mgr.create_simple_queue("tags", noop_handler()).await.unwrap();
        let handler: Arc<dyn Handler<u64>> = Arc::new(|_items: Vec<u64>| -> Vec<u64> { Vec::new() });
        let err = mgr.create_simple_queue("tags", handler).await.err().unwrap();
        assert!(matches!(err, QueueError::Config(_)));

        tx.shutdown_and_wait(Duration::from_secs(5)).await;
    }

    #[tokio::test]
    async fn test_unique_flag_mismatch_is_config_error() {
        let (tx, token) = shutdown_channel();
        let factory = Arc::new(MemoryFactory::default());
        let mgr = manager(factory.clone(), token);

        mgr.create_unique_queue("mirror", noop_handler()).await.unwrap();
        let err = mgr
            .create_simple_queue("mirror", noop_handler())
            .await
            .err()
            .unwrap();
        assert!(matches!(&err, QueueError::Config(msg) if msg.contains("unique")));

        mgr.create_simple_queue("stats", noop_handler()).await.unwrap();
        assert!(mgr
            .create_unique_queue("stats", noop_handler())
            .await
            .is_err());
        assert_eq!(factory.created.load(Ordering::SeqCst), 2);
        assert_eq!(mgr.managed_queues().len(), 2);

        tx.shutdown_and_wait(Duration::from_secs(5)).await;
    }

    #[tokio::test]
    async fn test_backend_error_registers_nothing() {
        let (_tx, token) = shutdown_channel();
        let mut mgr = manager(Arc::new(MemoryFactory::default()), token);
        mgr.settings.queue.queue_type = QueueType::Redis;
        mgr.settings.queue.conn_str = "redis://127.0.0.1:6379/0".to_string();

        assert!(mgr.create_simple_queue("automerge", noop_handler()).await.is_err());
        assert!(mgr.managed_queues().is_empty());
    }

    #[tokio::test]
    async fn test_flush_all_waits_for_handlers() {
        let (tx, token) = shutdown_channel();
        let mgr = manager(Arc::new(MemoryFactory::default()), token);
        let seen = Arc::new(Mutex::new(Vec::new()));
        let recorded = seen.clone();
        let handler: Arc<dyn Handler<String>> = Arc::new(move |items: Vec<String>| -> Vec<String> {
            recorded.lock().unwrap().extend(items);
            Vec::new()
        });

        let q = mgr.create_unique_queue("notify", handler).await.unwrap();
        for repo in ["a/b", "c/d", "e/f"] {
            q.push(&repo.to_string()).await.unwrap();
        }
        mgr.flush_all(Duration::from_secs(5)).await.unwrap();
        assert_eq!(seen.lock().unwrap().len(), 3);

        tx.shutdown_and_wait(Duration::from_secs(5)).await;
        assert_eq!(q.state(), QueueState::Closed);
    }
}
