// workq Core - Queue contract, worker pool & configuration
// NO infrastructure dependencies (backends that need a store live in infra crates)

pub mod application;
pub mod domain;
pub mod error;
pub mod memory;
pub mod port;

pub use error::{QueueError, Result};

pub const VERSION: &str = env!("CARGO_PKG_VERSION");
