// workq Infrastructure - Embedded store backend
// Implements: BaseQueue ("level" queues) on an ordered SQLite key-value table

mod connection;
mod error;
mod keys;
mod level_queue;
mod migration;

pub use connection::{level_data_dir, LevelStore, LevelStoreManager, STORE_FILE_NAME};
pub use keys::{list_level_queue_keys, queue_item_key, remove_level_queue_keys};
pub use level_queue::LevelQueue;
pub use migration::run_migrations;
