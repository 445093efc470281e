// Queue Domain Model

use crate::domain::settings::QueueSettings;
use crate::error::QueueError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

/// Suffix appended to the set key when it would collide with the queue key
pub const SET_NAME_DISAMBIGUATION: &str = "_unique";

/// Backend selected for a named queue
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QueueType {
    /// Embedded on-disk ordered key-value store
    #[default]
    Level,
    /// Remote list store
    Redis,
    /// In-process bounded FIFO (not durable)
    Channel,
    /// Persistence disabled, every operation is a no-op
    Dummy,
}

impl QueueType {
    pub fn as_str(&self) -> &'static str {
        match self {
            QueueType::Level => "level",
            QueueType::Redis => "redis",
            QueueType::Channel => "channel",
            QueueType::Dummy => "dummy",
        }
    }
}

impl fmt::Display for QueueType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for QueueType {
    type Err = QueueError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "level" => Ok(QueueType::Level),
            "redis" => Ok(QueueType::Redis),
            "channel" => Ok(QueueType::Channel),
            "dummy" => Ok(QueueType::Dummy),
            other => Err(QueueError::Config(format!("unknown queue type: {other}"))),
        }
    }
}

/// Fully resolved backend configuration for one named queue
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BaseConfig {
    pub managed_name: String,
    pub data_full_dir: PathBuf,
    pub conn_str: String,
    pub length: usize,
    pub queue_full_name: String,
    pub set_full_name: String,
}

impl BaseConfig {
    /// Derive queue and set keys for `managed_name`.
    ///
    /// Pure value transformation: the set key never equals the queue key.
    pub fn from_settings(managed_name: &str, settings: &QueueSettings) -> Self {
        let queue_full_name = format!("{managed_name}{}", settings.queue_name);
        let mut set_full_name = format!("{queue_full_name}{}", settings.set_name);
        if set_full_name == queue_full_name {
            set_full_name.push_str(SET_NAME_DISAMBIGUATION);
        }

        Self {
            managed_name: managed_name.to_string(),
            data_full_dir: settings.datadir.clone(),
            conn_str: settings.conn_str.clone(),
            length: settings.length,
            queue_full_name,
            set_full_name,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_base_config_names() {
        let settings = QueueSettings::default();
        let cfg = BaseConfig::from_settings("mirror", &settings);
        assert_eq!(cfg.queue_full_name, "mirror_queue");
        assert_eq!(cfg.set_full_name, "mirror_queue_unique");
        assert_eq!(cfg.length, settings.length);
    }

    #[test]
    fn test_set_name_disambiguation() {
        let settings = QueueSettings {
            queue_name: "-q".to_string(),
            set_name: String::new(),
            ..Default::default()
        };
        let cfg = BaseConfig::from_settings("stats", &settings);
        assert_eq!(cfg.queue_full_name, "stats-q");
        assert_eq!(cfg.set_full_name, "stats-q_unique");
        assert_ne!(cfg.queue_full_name, cfg.set_full_name);
    }

    #[test]
    fn test_queue_type_parse() {
        assert_eq!("LEVEL".parse::<QueueType>().unwrap(), QueueType::Level);
        assert_eq!("redis".parse::<QueueType>().unwrap(), QueueType::Redis);
        assert!("kafka".parse::<QueueType>().is_err());
        assert_eq!(QueueType::Dummy.to_string(), "dummy");
    }
}
