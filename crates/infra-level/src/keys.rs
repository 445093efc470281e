// Key layout and recovery utilities
//
//   <queue_prefix>-low / <queue_prefix>-high   head and tail ids (8-byte BE)
//   <queue_prefix>-<8-byte BE id>               queue item
//   <set_prefix>-<payload>                      dedup marker

use crate::connection::LevelStore;
use crate::error::map_sqlx_error;
use sqlx::SqliteConnection;
use tracing::{info, warn};
use workq_core::Result;

const KEY_SEPARATOR: u8 = b'-';

pub(crate) fn prefixed_key(prefix: &[u8], suffix: &[u8]) -> Vec<u8> {
    let mut key = Vec::with_capacity(prefix.len() + 1 + suffix.len());
    key.extend_from_slice(prefix);
    key.push(KEY_SEPARATOR);
    key.extend_from_slice(suffix);
    key
}

/// Key of item `id` in the queue stored under `prefix`
pub fn queue_item_key(prefix: &[u8], id: i64) -> Vec<u8> {
    prefixed_key(prefix, &id.to_be_bytes())
}

/// Half-open range `[prefix-, prefix.)` covering every key of `prefix`
fn prefix_bounds(prefix: &[u8]) -> (Vec<u8>, Vec<u8>) {
    let lower = prefixed_key(prefix, b"");
    let mut upper = prefix.to_vec();
    upper.push(KEY_SEPARATOR + 1);
    (lower, upper)
}

pub(crate) async fn delete_prefix(conn: &mut SqliteConnection, prefix: &[u8]) -> Result<u64> {
    let (lower, upper) = prefix_bounds(prefix);
    let done = sqlx::query("DELETE FROM kv WHERE key >= ? AND key < ?")
        .bind(lower)
        .bind(upper)
        .execute(conn)
        .await
        .map_err(map_sqlx_error)?;
    Ok(done.rows_affected())
}

/// Every key in the store, in order
pub async fn list_level_queue_keys(store: &LevelStore) -> Result<Vec<Vec<u8>>> {
    sqlx::query_scalar("SELECT key FROM kv ORDER BY key")
        .fetch_all(store.pool())
        .await
        .map_err(map_sqlx_error)
}

/// Delete every key under `prefix`, resetting a corrupted queue or set.
///
/// Idempotent: a second call removes nothing.
pub async fn remove_level_queue_keys(store: &LevelStore, prefix: &[u8]) -> Result<u64> {
    let mut conn = store.pool().acquire().await.map_err(map_sqlx_error)?;
    let removed = delete_prefix(&mut conn, prefix).await?;
    if removed > 0 {
        warn!(
            dir = %store.dir().display(),
            prefix = %String::from_utf8_lossy(prefix),
            removed,
            "Removed level queue keys"
        );
    } else {
        info!(prefix = %String::from_utf8_lossy(prefix), "No level queue keys to remove");
    }
    Ok(removed)
}
