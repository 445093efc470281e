// Application Layer - Worker pool, registry and their helpers

pub mod backoff;
pub mod manager;
pub mod shutdown;
pub mod worker_pool;

// Re-exports
pub use backoff::{backoff_err, backoff_ret_err, Attempt, BackoffConfig};
pub use manager::QueueManager;
pub use shutdown::{shutdown_channel, ShutdownSender, ShutdownToken};
pub use worker_pool::{ManagedQueue, QueueState, WorkerPoolOptions, WorkerPoolQueue};
