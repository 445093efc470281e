// Redis connection options
//
// Input is the canonical URI produced by `to_redis_uri`. Adapter options in
// the query (key overrides, TLS verification, sentinel settings) are split
// off here; the rest becomes something the redis client understands.

use tracing::debug;
use url::Url;
use workq_core::{QueueError, Result};

const DEFAULT_HOST: &str = "localhost";
const DEFAULT_PORT: u16 = 6379;

/// Where the queue's commands go
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RedisTarget {
    /// URL accepted by `redis::Client::open`
    Direct(String),
    /// Master resolved through sentinels
    Sentinel {
        nodes: Vec<String>,
        master_name: String,
        db: i64,
        username: Option<String>,
        password: Option<String>,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RedisOptions {
    pub target: RedisTarget,
    /// Replaces the resolved queue key
    pub queue_name: Option<String>,
    /// Replaces the resolved set key
    pub set_name: Option<String>,
}

pub fn parse_redis_options(uri: &str) -> Result<RedisOptions> {
    let url = Url::parse(uri).map_err(|e| invalid(uri, &e.to_string()))?;

    let mut queue_name = None;
    let mut set_name = None;
    let mut skip_verify = false;
    let mut db_param = None;
    let mut sentinel_username = None;
    let mut sentinel_password = None;
    let mut master_name = None;
    let mut extra_nodes = Vec::new();

    for (key, value) in url.query_pairs() {
        match key.to_ascii_lowercase().as_str() {
            "queue_name" => queue_name = Some(value.into_owned()),
            "set_name" => set_name = Some(value.into_owned()),
            "skipverify" | "insecureskipverify" => skip_verify = parse_bool(&value),
            "database" | "db" => db_param = Some(parse_db(uri, &value)?),
            "sentinelusername" => sentinel_username = Some(value.into_owned()),
            "sentinelpassword" => sentinel_password = Some(value.into_owned()),
            "mastername" => master_name = Some(value.into_owned()),
            "addrs" => extra_nodes.extend(
                value
                    .split(',')
                    .filter(|a| !a.is_empty())
                    .map(str::to_string),
            ),
            other => debug!(option = other, "Ignoring redis connection option"),
        }
    }

    let target = match url.scheme() {
        "redis" | "rediss" => {
            let db = match db_param {
                Some(db) => db,
                None => path_db(uri, &url)?,
            };
            let mut target = format!("{}://", url.scheme());
            if !url.username().is_empty() || url.password().is_some() {
                // keep the already percent-encoded credentials
                target.push_str(&format!(
                    "{}:{}@",
                    url.username(),
                    url.password().unwrap_or_default()
                ));
            }
            target.push_str(&format!(
                "{}:{}/{}",
                url.host_str().unwrap_or(DEFAULT_HOST),
                url.port().unwrap_or(DEFAULT_PORT),
                db
            ));
            if skip_verify {
                if url.scheme() == "rediss" {
                    target.push_str("#insecure");
                } else {
                    debug!("skipverify has no effect without TLS");
                }
            }
            RedisTarget::Direct(target)
        }
        "redis+socket" | "redis+unix" | "unix" => {
            let path = url.path();
            if path.is_empty() || path == "/" {
                return Err(invalid(uri, "missing socket path"));
            }
            let mut target = Url::parse(&format!("redis+unix://{path}"))
                .map_err(|e| invalid(uri, &e.to_string()))?;
            {
                let mut pairs = target.query_pairs_mut();
                pairs.append_pair("db", &db_param.unwrap_or(0).to_string());
                if let Some(user) = decoded_username(&url) {
                    pairs.append_pair("user", &user);
                }
                if let Some(pass) = decoded_password(&url) {
                    pairs.append_pair("pass", &pass);
                }
            }
            RedisTarget::Direct(target.to_string())
        }
        "redis+sentinel" => {
            let master_name =
                master_name.ok_or_else(|| invalid(uri, "sentinel requires mastername"))?;
            let db = match db_param {
                Some(db) => db,
                None => path_db(uri, &url)?,
            };

            let mut addrs = Vec::new();
            if let Some(host) = url.host_str() {
                addrs.push(format!("{}:{}", host, url.port().unwrap_or(DEFAULT_PORT)));
            }
            addrs.extend(extra_nodes);
            if addrs.is_empty() {
                return Err(invalid(uri, "sentinel requires at least one address"));
            }

            let nodes = addrs
                .iter()
                .map(|addr| {
                    sentinel_node_url(addr, sentinel_username.as_deref(), sentinel_password.as_deref())
                        .ok_or_else(|| invalid(uri, &format!("bad sentinel address {addr:?}")))
                })
                .collect::<Result<Vec<_>>>()?;

            RedisTarget::Sentinel {
                nodes,
                master_name,
                db,
                username: decoded_username(&url),
                password: decoded_password(&url),
            }
        }
        other => return Err(invalid(uri, &format!("unsupported scheme {other:?}"))),
    };

    Ok(RedisOptions {
        target,
        queue_name,
        set_name,
    })
}

fn sentinel_node_url(addr: &str, username: Option<&str>, password: Option<&str>) -> Option<String> {
    let mut node = Url::parse(&format!("redis://{addr}")).ok()?;
    if let Some(user) = username {
        node.set_username(user).ok()?;
    }
    if password.is_some() {
        node.set_password(password).ok()?;
    }
    Some(node.to_string())
}

fn path_db(uri: &str, url: &Url) -> Result<i64> {
    let raw = url.path().trim_matches('/');
    if raw.is_empty() {
        return Ok(0);
    }
    parse_db(uri, raw)
}

fn parse_db(uri: &str, raw: &str) -> Result<i64> {
    raw.parse::<i64>()
        .map_err(|_| invalid(uri, &format!("bad database number {raw:?}")))
}

fn parse_bool(raw: &str) -> bool {
    matches!(raw.to_ascii_lowercase().as_str(), "1" | "true" | "yes" | "on")
}

fn decoded_username(url: &Url) -> Option<String> {
    let user = url.username();
    (!user.is_empty()).then(|| decode_component(user))
}

fn decoded_password(url: &Url) -> Option<String> {
    url.password().map(decode_component)
}

fn decode_component(raw: &str) -> String {
    urlencoding::decode(raw)
        .map(|decoded| decoded.into_owned())
        .unwrap_or_else(|_| raw.to_string())
}

fn invalid(uri: &str, reason: &str) -> QueueError {
    QueueError::Config(format!("invalid redis connection string {uri:?}: {reason}"))
}
