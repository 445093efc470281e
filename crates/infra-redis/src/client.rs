// Shared Redis connections
//
// One multiplexed ConnectionManager per connection string; queues pointing
// at the same server share it. The registry lock is never held across I/O.

use crate::options::RedisTarget;
use redis::aio::ConnectionManager;
use redis::sentinel::{Sentinel, SentinelNodeConnectionInfo};
use redis::{Client, RedisConnectionInfo, RedisError, RedisResult};
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};
use tracing::{debug, info};
use workq_core::QueueError;

/// Errors worth retrying: the server is (re)starting or the link dropped
pub fn is_transient(err: &RedisError) -> bool {
    err.is_io_error() || err.is_connection_refusal() || err.is_timeout() || err.is_connection_dropped()
}

pub(crate) fn map_redis_error(err: RedisError) -> QueueError {
    if is_transient(&err) {
        QueueError::Backend(format!("redis connection: {err}"))
    } else {
        QueueError::Backend(format!("redis: {err}"))
    }
}

struct Holder {
    conn: ConnectionManager,
    refs: usize,
}

#[derive(Default)]
pub struct RedisClientManager {
    clients: Mutex<HashMap<String, Holder>>,
}

impl RedisClientManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Share the connection for `key`, dialing `target` on first use
    pub async fn acquire(&self, key: &str, target: &RedisTarget) -> RedisResult<ConnectionManager> {
        if let Some(conn) = self.share(key) {
            return Ok(conn);
        }

        let dialed = connect(target).await?;
        let mut clients = self.lock();
        let holder = clients.entry(key.to_string()).or_insert_with(|| {
            info!("Opened redis connection");
            Holder {
                conn: dialed,
                refs: 0,
            }
        });
        holder.refs += 1;
        Ok(holder.conn.clone())
    }

    /// Drop one reference; the connection goes away with the last one
    pub fn release(&self, key: &str) {
        let mut clients = self.lock();
        let Some(holder) = clients.get_mut(key) else {
            return;
        };
        holder.refs = holder.refs.saturating_sub(1);
        if holder.refs == 0 {
            clients.remove(key);
            info!("Closed redis connection");
        } else {
            debug!(refs = holder.refs, "Released redis connection");
        }
    }

    pub fn open_count(&self) -> usize {
        self.lock().len()
    }

    fn share(&self, key: &str) -> Option<ConnectionManager> {
        let mut clients = self.lock();
        let holder = clients.get_mut(key)?;
        holder.refs += 1;
        Some(holder.conn.clone())
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, Holder>> {
        self.clients.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

async fn connect(target: &RedisTarget) -> RedisResult<ConnectionManager> {
    let client = match target {
        RedisTarget::Direct(url) => Client::open(url.as_str())?,
        RedisTarget::Sentinel {
            nodes,
            master_name,
            db,
            username,
            password,
        } => {
            let mut sentinel = Sentinel::build(nodes.clone())?;
            let node_info = SentinelNodeConnectionInfo {
                tls_mode: None,
                redis_connection_info: Some(RedisConnectionInfo {
                    db: *db,
                    username: username.clone(),
                    password: password.clone(),
                    ..Default::default()
                }),
            };
            debug!(master = %master_name, sentinels = nodes.len(), "Resolving redis master");
            sentinel.async_master_for(master_name, Some(&node_info)).await?
        }
    };
    ConnectionManager::new(client).await
}
