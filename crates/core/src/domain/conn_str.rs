// Connection String Normalization
//
// Legacy forms accepted in configuration are rewritten into canonical URIs
// before any backend sees them.

use crate::error::{QueueError, Result};
use std::collections::BTreeMap;
use std::path::PathBuf;
use url::Url;

pub const LEVELDB_SCHEME_PREFIX: &str = "leveldb://";

const DEFAULT_REDIS_HOST: &str = "localhost:6379";
const DEFAULT_REDIS_DB: &str = "0";

/// Normalize an embedded-store connection string.
///
/// A bare filesystem path becomes `leveldb://<path>`.
pub fn to_leveldb_uri(conn: &str) -> String {
    if conn.starts_with(LEVELDB_SCHEME_PREFIX) {
        conn.to_string()
    } else {
        format!("{LEVELDB_SCHEME_PREFIX}{conn}")
    }
}

/// Extract the data directory from a `leveldb://` connection string
pub fn leveldb_data_dir(conn: &str) -> Option<PathBuf> {
    let rest = conn.strip_prefix(LEVELDB_SCHEME_PREFIX)?;
    let path = rest.split('?').next().unwrap_or_default();
    if path.is_empty() {
        return None;
    }
    Some(PathBuf::from(path))
}

/// Normalize a remote-list connection string into a `redis://` style URI.
///
/// Strings that already parse as URIs are returned unchanged. Otherwise the
/// legacy `key=value` forms (space or comma separated) are translated:
/// `addrs=127.0.0.1:6379 db=0` becomes `redis://127.0.0.1:6379/0`.
pub fn to_redis_uri(conn: &str) -> Result<Url> {
    if let Ok(uri) = Url::parse(conn) {
        return Ok(uri);
    }

    let mut scheme = "redis";
    let mut host = DEFAULT_REDIS_HOST.to_string();
    let mut db = DEFAULT_REDIS_DB.to_string();
    let mut username: Option<String> = None;
    let mut password: Option<String> = None;
    let mut query: BTreeMap<String, Vec<String>> = BTreeMap::new();

    let fields = conn
        .split(|c: char| c == ',' || c.is_whitespace())
        .filter(|f| !f.is_empty());
    for field in fields {
        let Some((key, value)) = field.split_once('=') else {
            continue;
        };
        match key.to_ascii_lowercase().as_str() {
            "network" => {
                if value == "unix" {
                    scheme = "redis+socket";
                }
            }
            "addrs" | "addr" => host = value.to_string(),
            "password" => password = Some(value.to_string()),
            "username" => username = Some(value.to_string()),
            "db" => db = value.to_string(),
            "idle_timeout" => {
                let timeout = if value.parse::<u64>().is_ok() {
                    format!("{value}s")
                } else {
                    value.to_string()
                };
                query.entry("idle_timeout".to_string()).or_default().push(timeout);
            }
            _ => query
                .entry(key.to_string())
                .or_default()
                .push(value.to_string()),
        }
    }

    let base = if scheme == "redis+socket" {
        // socket path goes in the path, the database in the query
        query.entry("database".to_string()).or_default().push(db);
        format!("{scheme}://{host}")
    } else {
        format!("{scheme}://{host}/{db}")
    };
    let mut uri = Url::parse(&base)
        .map_err(|e| QueueError::Config(format!("invalid redis connection string {conn:?}: {e}")))?;

    if username.is_some() || password.is_some() {
        let user = username.unwrap_or_default();
        uri.set_username(&user)
            .and_then(|_| uri.set_password(password.as_deref()))
            .map_err(|_| QueueError::Config(format!("redis connection string {conn:?} cannot carry credentials")))?;
    }

    if !query.is_empty() {
        let mut pairs = uri.query_pairs_mut();
        for (key, values) in &query {
            for value in values {
                pairs.append_pair(key, value);
            }
        }
    }

    Ok(uri)
}
