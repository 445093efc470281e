// Daemon configuration: TOML file + WORKQ__ environment overrides

use anyhow::{Context, Result};
use config::{Config, Environment, File};
use serde::Deserialize;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;
use workq_core::application::worker_pool::constants::DEFAULT_SHUTDOWN_GRACE;
use workq_core::domain::{QueueSettings, QueueSettingsOverride, QueueSettingsSet};

pub const ENV_PREFIX: &str = "WORKQ";
const ENV_SEPARATOR: &str = "__";

/// Example:
///
/// ```toml
/// app_data_path = "/var/lib/workq"
///
/// [queue]
/// type = "level"
/// datadir = "queues/common"
///
/// [queues.mirror]
/// type = "redis"
/// conn_str = "addrs=127.0.0.1:6379 db=0"
/// ```
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DaemonConfig {
    pub app_data_path: PathBuf,
    pub queue: QueueSettings,
    pub queues: HashMap<String, QueueSettingsOverride>,
    /// Grace period before in-flight batches are abandoned at shutdown
    pub shutdown_grace_secs: u64,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            app_data_path: std::env::current_dir().unwrap_or_else(|_| PathBuf::from("/var/lib/workq")),
            queue: QueueSettings::default(),
            queues: HashMap::new(),
            shutdown_grace_secs: DEFAULT_SHUTDOWN_GRACE.as_secs(),
        }
    }
}

impl DaemonConfig {
    /// Load `path` (if given) and apply `WORKQ__SECTION__KEY` overrides
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(File::from(path).required(true));
        }
        builder = builder.add_source(
            Environment::with_prefix(ENV_PREFIX)
                .separator(ENV_SEPARATOR)
                .try_parsing(true),
        );

        let config = builder
            .build()
            .context("Failed to read configuration")?
            .try_deserialize::<DaemonConfig>()
            .context("Invalid configuration")?;
        Ok(config)
    }

    pub fn queue_settings(&self) -> QueueSettingsSet {
        QueueSettingsSet {
            app_data_path: self.app_data_path.clone(),
            queue: self.queue.clone(),
            queues: self.queues.clone(),
        }
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_secs(self.shutdown_grace_secs)
    }
}
