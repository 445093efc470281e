// Level Queue - persistent FIFO on the embedded store

use crate::connection::{level_data_dir, LevelStore, LevelStoreManager};
use crate::error::map_sqlx_error;
use crate::keys::{delete_prefix, prefixed_key, queue_item_key};
use async_trait::async_trait;
use sqlx::SqliteConnection;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error};
use workq_core::application::backoff::{backoff_ret_err, Attempt, BackoffConfig};
use workq_core::application::worker_pool::constants::PUSH_BLOCK_TIME;
use workq_core::domain::BaseConfig;
use workq_core::port::BaseQueue;
use workq_core::{QueueError, Result};

/// Head/tail ids; the queue is empty when `low > high`
#[derive(Debug, Clone, Copy)]
struct Counters {
    low: i64,
    high: i64,
}

impl Counters {
    fn len(&self) -> usize {
        usize::try_from(self.high - self.low + 1).unwrap_or(0)
    }
}

pub struct LevelQueue {
    stores: Arc<LevelStoreManager>,
    store: Arc<LevelStore>,
    dir: PathBuf,
    name: String,
    queue_prefix: Vec<u8>,
    /// Set only for unique queues
    set_prefix: Option<Vec<u8>>,
    low_key: Vec<u8>,
    high_key: Vec<u8>,
    length: usize,
    backoff: BackoffConfig,
    closed: AtomicBool,
}

impl LevelQueue {
    pub async fn new(
        stores: Arc<LevelStoreManager>,
        config: &BaseConfig,
        unique: bool,
        backoff: BackoffConfig,
    ) -> Result<Self> {
        let dir = level_data_dir(config)?;
        let store = stores.acquire(&dir).await?;

        let queue_prefix = config.queue_full_name.as_bytes().to_vec();
        debug!(
            queue = %config.queue_full_name,
            dir = %dir.display(),
            unique,
            "Created level queue"
        );

        Ok(Self {
            stores,
            store,
            dir,
            name: config.queue_full_name.clone(),
            low_key: prefixed_key(&queue_prefix, b"low"),
            high_key: prefixed_key(&queue_prefix, b"high"),
            queue_prefix,
            set_prefix: unique.then(|| config.set_full_name.as_bytes().to_vec()),
            length: config.length.max(1),
            backoff,
            closed: AtomicBool::new(false),
        })
    }

    fn marker_key(&self, data: &[u8]) -> Option<Vec<u8>> {
        self.set_prefix
            .as_deref()
            .map(|prefix| prefixed_key(prefix, data))
    }

    async fn read_counters(&self, conn: &mut SqliteConnection) -> Result<Counters> {
        let low = read_id(conn, &self.low_key).await?.unwrap_or(1);
        let high = read_id(conn, &self.high_key).await?.unwrap_or(0);
        Ok(Counters { low, high })
    }

    async fn try_push(&self, data: &[u8]) -> Result<Attempt<()>> {
        let mut tx = self.store.pool().begin().await.map_err(map_sqlx_error)?;

        let marker = self.marker_key(data);
        if let Some(marker) = &marker {
            if get(&mut tx, marker).await?.is_some() {
                return Err(QueueError::AlreadyInQueue);
            }
        }

        let counters = self.read_counters(&mut tx).await?;
        if counters.len() >= self.length {
            return Ok(Attempt::Retry);
        }

        let id = counters.high + 1;
        put(&mut tx, &queue_item_key(&self.queue_prefix, id), data).await?;
        put(&mut tx, &self.low_key, &counters.low.to_be_bytes()).await?;
        put(&mut tx, &self.high_key, &id.to_be_bytes()).await?;
        if let Some(marker) = &marker {
            put(&mut tx, marker, b"").await?;
        }

        tx.commit().await.map_err(map_sqlx_error)?;
        Ok(Attempt::Done(()))
    }

    async fn try_pop(&self) -> Result<Attempt<Vec<u8>>> {
        let mut tx = self.store.pool().begin().await.map_err(map_sqlx_error)?;

        let counters = self.read_counters(&mut tx).await?;
        if counters.low > counters.high {
            return Ok(Attempt::Retry);
        }

        let key = queue_item_key(&self.queue_prefix, counters.low);
        let Some(data) = get(&mut tx, &key).await? else {
            error!(
                queue = %self.name,
                id = counters.low,
                high = counters.high,
                "Level queue head item is missing, queue is corrupted"
            );
            return Err(QueueError::NotFound(format!(
                "level queue {} item {}",
                self.name, counters.low
            )));
        };

        delete(&mut tx, &key).await?;
        put(&mut tx, &self.low_key, &(counters.low + 1).to_be_bytes()).await?;
        if let Some(marker) = self.marker_key(&data) {
            delete(&mut tx, &marker).await?;
        }

        tx.commit().await.map_err(map_sqlx_error)?;
        Ok(Attempt::Done(data))
    }
}

#[async_trait]
impl BaseQueue for LevelQueue {
    async fn push_item(&self, cancel: &CancellationToken, data: &[u8]) -> Result<()> {
        let deadline = Instant::now() + PUSH_BLOCK_TIME;
        backoff_ret_err(cancel, self.backoff, Some(deadline), || self.try_push(data)).await
    }

    async fn pop_item(&self, cancel: &CancellationToken) -> Result<Option<Vec<u8>>> {
        backoff_ret_err(cancel, self.backoff, None, || self.try_pop())
            .await
            .map(Some)
    }

    async fn has_item(&self, data: &[u8]) -> Result<bool> {
        let Some(marker) = self.marker_key(data) else {
            return Ok(false);
        };
        Ok(self.store.get(&marker).await?.is_some())
    }

    async fn len(&self) -> Result<usize> {
        let mut conn = self.store.pool().acquire().await.map_err(map_sqlx_error)?;
        Ok(self.read_counters(&mut conn).await?.len())
    }

    async fn remove_all(&self) -> Result<()> {
        let mut tx = self.store.pool().begin().await.map_err(map_sqlx_error)?;
        let mut removed = delete_prefix(&mut tx, &self.queue_prefix).await?;
        if let Some(set_prefix) = &self.set_prefix {
            removed += delete_prefix(&mut tx, set_prefix).await?;
        }
        tx.commit().await.map_err(map_sqlx_error)?;
        debug!(queue = %self.name, removed, "Cleared level queue");
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        if !self.closed.swap(true, Ordering::SeqCst) {
            self.stores.release(&self.dir).await;
        }
        Ok(())
    }
}

async fn get(conn: &mut SqliteConnection, key: &[u8]) -> Result<Option<Vec<u8>>> {
    sqlx::query_scalar("SELECT value FROM kv WHERE key = ?")
        .bind(key)
        .fetch_optional(conn)
        .await
        .map_err(map_sqlx_error)
}

async fn put(conn: &mut SqliteConnection, key: &[u8], value: &[u8]) -> Result<()> {
    sqlx::query("INSERT OR REPLACE INTO kv (key, value) VALUES (?, ?)")
        .bind(key)
        .bind(value)
        .execute(conn)
        .await
        .map_err(map_sqlx_error)?;
    Ok(())
}

async fn delete(conn: &mut SqliteConnection, key: &[u8]) -> Result<()> {
    sqlx::query("DELETE FROM kv WHERE key = ?")
        .bind(key)
        .execute(conn)
        .await
        .map_err(map_sqlx_error)?;
    Ok(())
}

async fn read_id(conn: &mut SqliteConnection, key: &[u8]) -> Result<Option<i64>> {
    let Some(raw) = get(conn, key).await? else {
        return Ok(None);
    };
    let bytes: [u8; 8] = raw.as_slice().try_into().map_err(|_| {
        QueueError::Backend(format!(
            "level queue counter {} is malformed",
            String::from_utf8_lossy(key)
        ))
    })?;
    Ok(Some(i64::from_be_bytes(bytes)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keys::{list_level_queue_keys, remove_level_queue_keys};
    use std::time::Duration;
    use tokio_test::assert_ok;

    fn tiny_backoff() -> BackoffConfig {
        BackoffConfig::new(Duration::from_millis(1), Duration::from_millis(1))
    }

    fn config(dir: &std::path::Path, queue: &str, set: &str, length: usize) -> BaseConfig {
        BaseConfig {
            managed_name: queue.to_string(),
            data_full_dir: dir.to_path_buf(),
            conn_str: String::new(),
            length,
            queue_full_name: queue.to_string(),
            set_full_name: set.to_string(),
        }
    }

    #[tokio::test]
    async fn test_plain_queue_fifo() {
        let tmp = tempfile::tempdir().unwrap();
        let stores = Arc::new(LevelStoreManager::new());
        let q = LevelQueue::new(stores.clone(), &config(tmp.path(), "plain", "plain_set", 10), false, tiny_backoff())
            .await
            .unwrap();
        let cancel = CancellationToken::new();

        for item in [&b"a"[..], b"b", b"a"] {
            assert_ok!(q.push_item(&cancel, item).await);
        }
        assert_eq!(q.len().await.unwrap(), 3);
        assert!(!q.has_item(b"a").await.unwrap());

        for item in [&b"a"[..], b"b", b"a"] {
            assert_eq!(q.pop_item(&cancel).await.unwrap().unwrap(), item);
        }
        assert_eq!(q.len().await.unwrap(), 0);

        q.close().await.unwrap();
        q.close().await.unwrap();
        assert_eq!(stores.open_count(), 0);
    }

    #[tokio::test]
    async fn test_unique_queue_dedups_until_popped() {
        let tmp = tempfile::tempdir().unwrap();
        let stores = Arc::new(LevelStoreManager::new());
        let q = LevelQueue::new(stores, &config(tmp.path(), "uq", "uq_set", 10), true, tiny_backoff())
            .await
            .unwrap();
        let cancel = CancellationToken::new();

        q.push_item(&cancel, b"A").await.unwrap();
        assert!(q.push_item(&cancel, b"A").await.unwrap_err().is_already_in_queue());
        assert_eq!(q.len().await.unwrap(), 1);
        assert!(q.has_item(b"A").await.unwrap());

        assert_eq!(q.pop_item(&cancel).await.unwrap().unwrap(), b"A");
        assert!(!q.has_item(b"A").await.unwrap());
        q.push_item(&cancel, b"A").await.unwrap();
        assert_eq!(q.len().await.unwrap(), 1);

        q.remove_all().await.unwrap();
        assert_eq!(q.len().await.unwrap(), 0);
        assert!(!q.has_item(b"A").await.unwrap());
        q.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_pop_waits_for_push_and_honors_cancel() {
        let tmp = tempfile::tempdir().unwrap();
        let stores = Arc::new(LevelStoreManager::new());
        let q = Arc::new(
            LevelQueue::new(stores, &config(tmp.path(), "blocking", "blocking_set", 10), false, tiny_backoff())
                .await
                .unwrap(),
        );

        let cancel = CancellationToken::new();
        let popper = {
            let q = q.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move { q.pop_item(&cancel).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        q.push_item(&cancel, b"late").await.unwrap();
        assert_eq!(popper.await.unwrap().unwrap().unwrap(), b"late");

        let stop = CancellationToken::new();
        stop.cancel();
        assert!(matches!(q.pop_item(&stop).await, Err(QueueError::Cancelled)));
        q.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_full_queue_push_blocks() {
        let tmp = tempfile::tempdir().unwrap();
        let stores = Arc::new(LevelStoreManager::new());
        let q = LevelQueue::new(stores, &config(tmp.path(), "full", "full_set", 1), false, tiny_backoff())
            .await
            .unwrap();
        let cancel = CancellationToken::new();

        q.push_item(&cancel, b"1").await.unwrap();
        let stop = cancel.child_token();
        let canceller = stop.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            canceller.cancel();
        });
        // blocks for room until the token fires
        assert!(matches!(q.push_item(&stop, b"2").await, Err(QueueError::Cancelled)));
        assert_eq!(q.len().await.unwrap(), 1);
        q.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_corrupted_queue_recovery() {
        let tmp = tempfile::tempdir().unwrap();
        let dir = tmp.path().join("levelqueue-test");
        let stores = Arc::new(LevelStoreManager::new());
        let store = stores.acquire(&dir).await.unwrap();
        let cancel = CancellationToken::new();

        store.put(b"other-key", b"other-value").await.unwrap();

        let cfg = config(&dir, "queue_name", "set_name", 100);
        let lq = LevelQueue::new(stores.clone(), &cfg, true, tiny_backoff()).await.unwrap();
        lq.push_item(&cancel, b"item-1").await.unwrap();

        let item_key = queue_item_key(b"queue_name", 1);
        assert_eq!(store.get(&item_key).await.unwrap(), Some(b"item-1".to_vec()));

        // low, high, one item, one set entry and "other-key"
        assert_eq!(list_level_queue_keys(&store).await.unwrap().len(), 5);

        store.delete(&item_key).await.unwrap();
        let err = lq.pop_item(&cancel).await.unwrap_err();
        assert!(matches!(err, QueueError::NotFound(_)));
        // stays broken
        assert!(matches!(lq.pop_item(&cancel).await, Err(QueueError::NotFound(_))));
        lq.close().await.unwrap();

        remove_level_queue_keys(&store, b"queue_name").await.unwrap();
        remove_level_queue_keys(&store, b"set_name").await.unwrap();
        assert_eq!(
            list_level_queue_keys(&store).await.unwrap(),
            vec![b"other-key".to_vec()]
        );

        let lq = LevelQueue::new(stores.clone(), &cfg, true, tiny_backoff()).await.unwrap();
        lq.push_item(&cancel, b"item-new-1").await.unwrap();
        assert_eq!(lq.pop_item(&cancel).await.unwrap().unwrap(), b"item-new-1");
        lq.close().await.unwrap();
        stores.release(&dir).await;
    }

    #[tokio::test]
    async fn test_items_survive_reopen() {
        let tmp = tempfile::tempdir().unwrap();
        let cfg = config(tmp.path(), "durable", "durable_set", 10);
        let cancel = CancellationToken::new();

        let stores = Arc::new(LevelStoreManager::new());
        let q = LevelQueue::new(stores.clone(), &cfg, false, tiny_backoff()).await.unwrap();
        q.push_item(&cancel, b"one").await.unwrap();
        q.push_item(&cancel, b"two").await.unwrap();
        q.close().await.unwrap();
        assert_eq!(stores.open_count(), 0);

        let q = LevelQueue::new(Arc::new(LevelStoreManager::new()), &cfg, false, tiny_backoff())
            .await
            .unwrap();
        assert_eq!(q.len().await.unwrap(), 2);
        assert_eq!(q.pop_item(&cancel).await.unwrap().unwrap(), b"one");
        q.close().await.unwrap();
    }
}
