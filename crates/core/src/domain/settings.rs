// Queue Settings
//
// A `[queue]` section supplies defaults, `[queues.<name>]` overrides them per
// managed queue.

use crate::domain::conn_str::{to_leveldb_uri, to_redis_uri};
use crate::domain::queue::QueueType;
use crate::error::{QueueError, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use tracing::debug;

pub const DEFAULT_DATADIR: &str = "queues/common";
pub const DEFAULT_LENGTH: usize = 100_000;
pub const DEFAULT_BATCH_LENGTH: usize = 20;
pub const DEFAULT_QUEUE_NAME: &str = "_queue";
pub const DEFAULT_SET_NAME: &str = "_unique";
pub const MAX_DEFAULT_WORKERS: usize = 10;

/// Effective settings for one named queue
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueSettings {
    #[serde(skip)]
    pub name: String,
    #[serde(rename = "type")]
    pub queue_type: QueueType,
    pub datadir: PathBuf,
    pub conn_str: String,
    /// Maximum number of items the backend holds before push blocks
    pub length: usize,
    pub batch_length: usize,
    pub queue_name: String,
    pub set_name: String,
    pub max_workers: usize,
}

impl Default for QueueSettings {
    fn default() -> Self {
        Self {
            name: String::new(),
            queue_type: QueueType::Level,
            datadir: PathBuf::from(DEFAULT_DATADIR),
            conn_str: String::new(),
            length: DEFAULT_LENGTH,
            batch_length: DEFAULT_BATCH_LENGTH,
            queue_name: DEFAULT_QUEUE_NAME.to_string(),
            set_name: DEFAULT_SET_NAME.to_string(),
            max_workers: default_max_workers(),
        }
    }
}

/// Half the available CPUs, at least 1, at most 10
fn default_max_workers() -> usize {
    let cpus = std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(2);
    (cpus / 2).clamp(1, MAX_DEFAULT_WORKERS)
}

/// Per-queue override; unset fields fall back to the `[queue]` defaults
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueSettingsOverride {
    #[serde(rename = "type")]
    pub queue_type: Option<QueueType>,
    pub datadir: Option<PathBuf>,
    pub conn_str: Option<String>,
    pub length: Option<usize>,
    pub batch_length: Option<usize>,
    pub queue_name: Option<String>,
    pub set_name: Option<String>,
    pub max_workers: Option<usize>,
}

impl QueueSettingsOverride {
    fn apply(&self, settings: &mut QueueSettings) {
        if let Some(t) = self.queue_type {
            settings.queue_type = t;
        }
        if let Some(d) = &self.datadir {
            settings.datadir = d.clone();
        }
        if let Some(c) = &self.conn_str {
            settings.conn_str = c.clone();
        }
        if let Some(l) = self.length {
            settings.length = l;
        }
        if let Some(b) = self.batch_length {
            settings.batch_length = b;
        }
        if let Some(q) = &self.queue_name {
            settings.queue_name = q.clone();
        }
        if let Some(s) = &self.set_name {
            settings.set_name = s.clone();
        }
        if let Some(w) = self.max_workers {
            settings.max_workers = w;
        }
    }
}

/// All queue settings of a process
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueSettingsSet {
    /// Base for relative data directories
    pub app_data_path: PathBuf,
    pub queue: QueueSettings,
    pub queues: HashMap<String, QueueSettingsOverride>,
}

impl QueueSettingsSet {
    /// Resolve the effective settings for `name`
    pub fn get_queue_settings(&self, name: &str) -> Result<QueueSettings> {
        let mut settings = self.queue.clone();
        settings.name = name.to_string();
        if let Some(o) = self.queues.get(name) {
            o.apply(&mut settings);
        }

        if settings.datadir.is_relative() {
            settings.datadir = self.app_data_path.join(&settings.datadir);
        }

        match settings.queue_type {
            QueueType::Level => {
                settings.conn_str = if settings.conn_str.is_empty() {
                    to_leveldb_uri(&settings.datadir.to_string_lossy())
                } else {
                    to_leveldb_uri(&settings.conn_str)
                };
            }
            QueueType::Redis => {
                if settings.conn_str.is_empty() {
                    return Err(QueueError::Config(format!(
                        "queue {name:?} uses the redis backend but has no conn_str"
                    )));
                }
                settings.conn_str = to_redis_uri(&settings.conn_str)?.to_string();
            }
            QueueType::Channel | QueueType::Dummy => {}
        }

        settings.length = settings.length.max(1);
        settings.batch_length = settings.batch_length.max(1);
        settings.max_workers = settings.max_workers.max(1);

        debug!(
            queue = %name,
            queue_type = %settings.queue_type,
            batch_length = settings.batch_length,
            max_workers = settings.max_workers,
            "Resolved queue settings"
        );
        Ok(settings)
    }
}
