// Port Layer - Interfaces for backends and consumers

pub mod backend_factory;
pub mod base_queue;
pub mod codec;
pub mod handler;

// Re-exports
pub use backend_factory::BackendFactory;
pub use base_queue::BaseQueue;
pub use codec::{ItemCodec, JsonCodec};
pub use handler::Handler;
