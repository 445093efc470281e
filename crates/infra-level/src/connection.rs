// Embedded Store Connection
//
// One SQLite file per data directory, shared by every queue configured with
// that directory. The manager ref-counts holders; the last release closes
// the pool.

use crate::error::map_sqlx_error;
use crate::migration::run_migrations;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tracing::{debug, info};
use workq_core::domain::{leveldb_data_dir, to_leveldb_uri, BaseConfig};
use workq_core::{QueueError, Result};

/// File created inside each data directory
pub const STORE_FILE_NAME: &str = "queue.db";

/// Resolve the data directory of a level queue.
///
/// `conn_str` wins over `data_full_dir`. Only `leveldb://` (or a bare path)
/// is accepted and the directory must be absolute.
pub fn level_data_dir(config: &BaseConfig) -> Result<PathBuf> {
    let dir = if config.conn_str.is_empty() {
        Some(config.data_full_dir.clone())
    } else {
        if let Some((scheme, _)) = config.conn_str.split_once("://") {
            if scheme != "leveldb" {
                return Err(QueueError::Config(format!(
                    "invalid leveldb connection string: {:?}",
                    config.conn_str
                )));
            }
        }
        leveldb_data_dir(&to_leveldb_uri(&config.conn_str))
    };

    match dir {
        Some(dir) if dir.is_absolute() => Ok(dir),
        Some(dir) => Err(QueueError::Config(format!(
            "invalid leveldb data dir: {dir:?}"
        ))),
        None => Err(QueueError::Config(format!(
            "invalid leveldb data dir: {:?}",
            config.conn_str
        ))),
    }
}

/// Ordered byte-keyed store in one data directory
pub struct LevelStore {
    dir: PathBuf,
    pool: SqlitePool,
}

impl LevelStore {
    /// Open (creating if missing) the store in `dir`
    pub async fn open(dir: &Path) -> Result<Self> {
        tokio::fs::create_dir_all(dir).await?;

        let options = SqliteConnectOptions::new()
            .filename(dir.join(STORE_FILE_NAME))
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(Duration::from_secs(5))
            .create_if_missing(true);

        // A single connection serializes every transaction on this store
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await
            .map_err(map_sqlx_error)?;

        run_migrations(&pool).await?;
        info!(dir = %dir.display(), "Opened level store");

        Ok(Self {
            dir: dir.to_path_buf(),
            pool,
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub(crate) fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub async fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        sqlx::query_scalar("SELECT value FROM kv WHERE key = ?")
            .bind(key)
            .fetch_optional(&self.pool)
            .await
            .map_err(map_sqlx_error)
    }

    pub async fn put(&self, key: &[u8], value: &[u8]) -> Result<()> {
        sqlx::query("INSERT OR REPLACE INTO kv (key, value) VALUES (?, ?)")
            .bind(key)
            .bind(value)
            .execute(&self.pool)
            .await
            .map_err(map_sqlx_error)?;
        Ok(())
    }

    pub async fn delete(&self, key: &[u8]) -> Result<()> {
        sqlx::query("DELETE FROM kv WHERE key = ?")
            .bind(key)
            .execute(&self.pool)
            .await
            .map_err(map_sqlx_error)?;
        Ok(())
    }

    pub async fn close(&self) {
        self.pool.close().await;
        info!(dir = %self.dir.display(), "Closed level store");
    }
}

struct Holder {
    store: Arc<LevelStore>,
    refs: usize,
}

/// Shared level stores keyed by data directory
#[derive(Default)]
pub struct LevelStoreManager {
    stores: Mutex<HashMap<PathBuf, Holder>>,
}

impl LevelStoreManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Share the store for `dir`, opening it on first use
    pub async fn acquire(&self, dir: &Path) -> Result<Arc<LevelStore>> {
        if let Some(store) = self.share(dir) {
            return Ok(store);
        }

        let opened = Arc::new(LevelStore::open(dir).await?);
        let winner = {
            let mut stores = self.lock();
            match stores.get_mut(dir) {
                Some(holder) => {
                    holder.refs += 1;
                    Some(Arc::clone(&holder.store))
                }
                None => {
                    stores.insert(
                        dir.to_path_buf(),
                        Holder {
                            store: Arc::clone(&opened),
                            refs: 1,
                        },
                    );
                    None
                }
            }
        };

        match winner {
            Some(store) => {
                opened.close().await;
                Ok(store)
            }
            None => Ok(opened),
        }
    }

    /// Drop one reference; the last one closes the store
    pub async fn release(&self, dir: &Path) {
        let last = {
            let mut stores = self.lock();
            match stores.get_mut(dir) {
                Some(holder) if holder.refs > 1 => {
                    holder.refs -= 1;
                    debug!(dir = %dir.display(), refs = holder.refs, "Released level store");
                    None
                }
                Some(_) => stores.remove(dir).map(|h| h.store),
                None => None,
            }
        };

        if let Some(store) = last {
            store.close().await;
        }
    }

    /// Number of open stores
    pub fn open_count(&self) -> usize {
        self.lock().len()
    }

    fn share(&self, dir: &Path) -> Option<Arc<LevelStore>> {
        let mut stores = self.lock();
        let holder = stores.get_mut(dir)?;
        holder.refs += 1;
        Some(Arc::clone(&holder.store))
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<PathBuf, Holder>> {
        self.stores.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use workq_core::domain::QueueSettings;

    fn config(datadir: &str, conn_str: &str) -> BaseConfig {
        let settings = QueueSettings {
            datadir: PathBuf::from(datadir),
            conn_str: conn_str.to_string(),
            ..Default::default()
        };
        BaseConfig::from_settings("test", &settings)
    }

    #[test]
    fn test_rejects_other_schemes() {
        let err = level_data_dir(&config("", "redis://")).unwrap_err();
        assert!(err.to_string().contains("invalid leveldb connection string"));
    }

    #[test]
    fn test_rejects_relative_data_dir() {
        let err = level_data_dir(&config("relative", "")).unwrap_err();
        assert!(err.to_string().contains("invalid leveldb data dir"));

        let err = level_data_dir(&config("", "leveldb://relative/dir")).unwrap_err();
        assert!(err.to_string().contains("invalid leveldb data dir"));
    }

    #[test]
    fn test_rejected_dir_is_named_in_error() {
        let err = level_data_dir(&config("/var/ok", "leveldb://relative/dir")).unwrap_err();
        let msg = err.to_string();
        assert!(msg.contains("relative/dir"), "{msg}");
        assert!(!msg.contains("/var/ok"), "{msg}");
    }

    #[test]
    fn test_conn_str_wins_over_datadir() {
        let dir = level_data_dir(&config("/var/a", "leveldb:///var/b?nosync=true")).unwrap();
        assert_eq!(dir, PathBuf::from("/var/b"));
        let dir = level_data_dir(&config("/var/a", "/var/c")).unwrap();
        assert_eq!(dir, PathBuf::from("/var/c"));
        let dir = level_data_dir(&config("/var/a", "")).unwrap();
        assert_eq!(dir, PathBuf::from("/var/a"));
    }

    #[tokio::test]
    async fn test_store_kv_roundtrip() {
        let tmp = tempfile::tempdir().unwrap();
        let store = LevelStore::open(&tmp.path().join("store")).await.unwrap();

        assert_eq!(store.get(b"k").await.unwrap(), None);
        store.put(b"k", b"v1").await.unwrap();
        store.put(b"k", b"v2").await.unwrap();
        assert_eq!(store.get(b"k").await.unwrap(), Some(b"v2".to_vec()));
        store.delete(b"k").await.unwrap();
        assert_eq!(store.get(b"k").await.unwrap(), None);
        store.close().await;
    }

    #[tokio::test]
    async fn test_manager_shares_and_closes_on_last_release() {
        let tmp = tempfile::tempdir().unwrap();
        let dir = tmp.path().join("shared");
        let mgr = LevelStoreManager::new();

        let a = mgr.acquire(&dir).await.unwrap();
        let b = mgr.acquire(&dir).await.unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(mgr.open_count(), 1);

        mgr.release(&dir).await;
        assert_eq!(mgr.open_count(), 1);
        a.put(b"still", b"open").await.unwrap();

        mgr.release(&dir).await;
        assert_eq!(mgr.open_count(), 0);
        assert!(b.get(b"still").await.is_err());
    }
}
