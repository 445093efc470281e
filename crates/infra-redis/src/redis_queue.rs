// Redis Queue - server-side list, optional server-side set for dedup

use crate::client::{is_transient, map_redis_error, RedisClientManager};
use crate::options::parse_redis_options;
use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::Script;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use workq_core::application::backoff::{backoff_ret_err, Attempt, BackoffConfig};
use workq_core::application::worker_pool::constants::PUSH_BLOCK_TIME;
use workq_core::domain::BaseConfig;
use workq_core::port::BaseQueue;
use workq_core::{QueueError, Result};

/// Mark and enqueue in one step; returns 0 when the payload is already queued
const UNIQUE_PUSH_SCRIPT: &str = r#"
if redis.call('SADD', KEYS[2], ARGV[1]) == 0 then
    return 0
end
redis.call('RPUSH', KEYS[1], ARGV[1])
return 1
"#;

/// Dequeue and unmark in one step
const UNIQUE_POP_SCRIPT: &str = r#"
local data = redis.call('LPOP', KEYS[1])
if not data then
    return false
end
redis.call('SREM', KEYS[2], data)
return data
"#;

pub struct RedisQueue {
    clients: Arc<RedisClientManager>,
    client_key: String,
    conn: ConnectionManager,
    queue_key: String,
    /// Set only for unique queues
    set_key: Option<String>,
    length: usize,
    backoff: BackoffConfig,
    push_script: Script,
    pop_script: Script,
    closed: AtomicBool,
}

impl RedisQueue {
    /// Connect (with backoff) and verify the server answers PING
    pub async fn new(
        clients: Arc<RedisClientManager>,
        config: &BaseConfig,
        unique: bool,
        backoff: BackoffConfig,
    ) -> Result<Self> {
        let options = parse_redis_options(&config.conn_str)?;
        let cancel = CancellationToken::new();
        let deadline = Instant::now() + PUSH_BLOCK_TIME;

        let conn = backoff_ret_err(&cancel, backoff, Some(deadline), || async {
            match clients.acquire(&config.conn_str, &options.target).await {
                Ok(conn) => Ok(Attempt::Done(conn)),
                Err(e) if is_transient(&e) => {
                    warn!(queue = %config.queue_full_name, error = %e, "Redis not reachable yet");
                    Ok(Attempt::Retry)
                }
                Err(e) => Err(map_redis_error(e)),
            }
        })
        .await?;

        let queue = Self {
            client_key: config.conn_str.clone(),
            conn,
            queue_key: options
                .queue_name
                .unwrap_or_else(|| config.queue_full_name.clone()),
            set_key: unique.then(|| {
                options
                    .set_name
                    .unwrap_or_else(|| config.set_full_name.clone())
            }),
            length: config.length.max(1),
            backoff,
            push_script: Script::new(UNIQUE_PUSH_SCRIPT),
            pop_script: Script::new(UNIQUE_POP_SCRIPT),
            closed: AtomicBool::new(false),
            clients,
        };

        if let Err(e) = queue.ping(&cancel, deadline).await {
            queue.close().await?;
            return Err(e);
        }

        info!(
            queue = %queue.queue_key,
            set = ?queue.set_key,
            "Created redis queue"
        );
        Ok(queue)
    }

    async fn ping(&self, cancel: &CancellationToken, deadline: Instant) -> Result<()> {
        backoff_ret_err(cancel, self.backoff, Some(deadline), || async {
            let mut conn = self.conn.clone();
            let pong: redis::RedisResult<String> = redis::cmd("PING").query_async(&mut conn).await;
            match pong {
                Ok(_) => Ok(Attempt::Done(())),
                Err(e) if is_transient(&e) => {
                    debug!(error = %e, "Redis PING failed, retrying");
                    Ok(Attempt::Retry)
                }
                Err(e) => Err(map_redis_error(e)),
            }
        })
        .await
    }

    async fn try_push(&self, data: &[u8]) -> Result<Attempt<()>> {
        let mut conn = self.conn.clone();

        let queued: redis::RedisResult<usize> =
            redis::cmd("LLEN").arg(&self.queue_key).query_async(&mut conn).await;
        match queued {
            Ok(n) if n >= self.length => return Ok(Attempt::Retry),
            Ok(_) => {}
            Err(e) if is_transient(&e) => return Ok(Attempt::Retry),
            Err(e) => return Err(map_redis_error(e)),
        }

        match &self.set_key {
            Some(set_key) => {
                let added: i64 = self
                    .push_script
                    .key(&self.queue_key)
                    .key(set_key)
                    .arg(data)
                    .invoke_async(&mut conn)
                    .await
                    .map_err(map_redis_error)?;
                if added == 0 {
                    return Err(QueueError::AlreadyInQueue);
                }
            }
            None => {
                let _len: i64 = redis::cmd("RPUSH")
                    .arg(&self.queue_key)
                    .arg(data)
                    .query_async(&mut conn)
                    .await
                    .map_err(map_redis_error)?;
            }
        }
        Ok(Attempt::Done(()))
    }

    async fn try_pop(&self) -> Result<Attempt<Vec<u8>>> {
        let mut conn = self.conn.clone();

        let popped: redis::RedisResult<Option<Vec<u8>>> = match &self.set_key {
            Some(set_key) => {
                self.pop_script
                    .key(&self.queue_key)
                    .key(set_key)
                    .invoke_async(&mut conn)
                    .await
            }
            None => {
                redis::cmd("LPOP")
                    .arg(&self.queue_key)
                    .query_async(&mut conn)
                    .await
            }
        };

        match popped {
            Ok(Some(data)) => Ok(Attempt::Done(data)),
            Ok(None) => Ok(Attempt::Retry),
            Err(e) if is_transient(&e) => {
                warn!(queue = %self.queue_key, error = %e, "Redis pop failed, retrying");
                Ok(Attempt::Retry)
            }
            Err(e) => Err(map_redis_error(e)),
        }
    }
}

#[async_trait]
impl BaseQueue for RedisQueue {
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
        let Some(set_key) = &self.set_key else {
            return Ok(false);
        };
        let mut conn = self.conn.clone();
        let member: bool = redis::cmd("SISMEMBER")
            .arg(set_key)
            .arg(data)
            .query_async(&mut conn)
            .await
            .map_err(map_redis_error)?;
        Ok(member)
    }

    async fn len(&self) -> Result<usize> {
        let mut conn = self.conn.clone();
        let len: usize = redis::cmd("LLEN")
            .arg(&self.queue_key)
            .query_async(&mut conn)
            .await
            .map_err(map_redis_error)?;
        Ok(len)
    }

    async fn remove_all(&self) -> Result<()> {
        let mut conn = self.conn.clone();
        let mut del = redis::cmd("DEL");
        del.arg(&self.queue_key);
        if let Some(set_key) = &self.set_key {
            del.arg(set_key);
        }
        let removed: i64 = del.query_async(&mut conn).await.map_err(map_redis_error)?;
        debug!(queue = %self.queue_key, removed, "Cleared redis queue");
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        if !self.closed.swap(true, Ordering::SeqCst) {
            self.clients.release(&self.client_key);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use workq_core::domain::QueueSettings;

    // Live tests run only against a server named by this variable
    const REDIS_URL_ENV: &str = "WORKQ_TEST_REDIS_URL";

    fn live_config(name: &str) -> Option<BaseConfig> {
        let url = std::env::var(REDIS_URL_ENV).ok()?;
        let settings = QueueSettings {
            conn_str: url,
            length: 10,
            ..Default::default()
        };
        Some(BaseConfig::from_settings(name, &settings))
    }

    fn tiny_backoff() -> BackoffConfig {
        BackoffConfig::new(Duration::from_millis(1), Duration::from_millis(1))
    }

    #[tokio::test]
    async fn test_unreachable_server_fails_fast_on_bad_uri() {
        let settings = QueueSettings {
            conn_str: "memcached://localhost".to_string(),
            ..Default::default()
        };
        let config = BaseConfig::from_settings("bad", &settings);
        let clients = Arc::new(RedisClientManager::new());
        let err = RedisQueue::new(clients.clone(), &config, false, tiny_backoff())
            .await
            .err()
            .unwrap();
        assert!(matches!(err, QueueError::Config(_)));
        assert_eq!(clients.open_count(), 0);
    }

    #[tokio::test]
    async fn test_live_unique_queue() {
        let Some(config) = live_config("workq_test_unique") else {
            return;
        };
        let clients = Arc::new(RedisClientManager::new());
        let q = RedisQueue::new(clients.clone(), &config, true, tiny_backoff())
            .await
            .unwrap();
        let cancel = CancellationToken::new();
        q.remove_all().await.unwrap();

        q.push_item(&cancel, b"A").await.unwrap();
        assert!(q.push_item(&cancel, b"A").await.unwrap_err().is_already_in_queue());
        assert_eq!(q.len().await.unwrap(), 1);
        assert!(q.has_item(b"A").await.unwrap());

        assert_eq!(q.pop_item(&cancel).await.unwrap().unwrap(), b"A");
        assert!(!q.has_item(b"A").await.unwrap());
        q.push_item(&cancel, b"A").await.unwrap();
        assert_eq!(q.len().await.unwrap(), 1);

        q.remove_all().await.unwrap();
        q.close().await.unwrap();
        q.close().await.unwrap();
        assert_eq!(clients.open_count(), 0);
    }

    #[tokio::test]
    async fn test_live_plain_queue_fifo_and_cancel() {
        let Some(config) = live_config("workq_test_plain") else {
            return;
        };
        let clients = Arc::new(RedisClientManager::new());
        let q = RedisQueue::new(clients.clone(), &config, false, tiny_backoff())
            .await
            .unwrap();
        let cancel = CancellationToken::new();
        q.remove_all().await.unwrap();

        for item in [&b"1"[..], b"2", b"1"] {
            q.push_item(&cancel, item).await.unwrap();
        }
        for item in [&b"1"[..], b"2", b"1"] {
            assert_eq!(q.pop_item(&cancel).await.unwrap().unwrap(), item);
        }

        let stop = CancellationToken::new();
        stop.cancel();
        assert!(matches!(q.pop_item(&stop).await, Err(QueueError::Cancelled)));

        // a second queue on the same server shares the connection
        let other = RedisQueue::new(clients.clone(), &config, false, tiny_backoff())
            .await
            .unwrap();
        assert_eq!(clients.open_count(), 1);
        other.close().await.unwrap();
        assert_eq!(clients.open_count(), 1);
        q.close().await.unwrap();
        assert_eq!(clients.open_count(), 0);
    }
}
