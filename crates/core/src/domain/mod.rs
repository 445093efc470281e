// Domain Layer - Queue names, settings and connection strings

pub mod conn_str;
pub mod queue;
pub mod settings;

// Re-exports
pub use conn_str::{leveldb_data_dir, to_leveldb_uri, to_redis_uri};
pub use queue::{BaseConfig, QueueType};
pub use settings::{QueueSettings, QueueSettingsOverride, QueueSettingsSet};
