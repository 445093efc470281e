// workq Infrastructure - Redis backend
// Implements: BaseQueue ("redis" queues) on a Redis list (+ set for unique queues)

mod client;
mod options;
mod redis_queue;

pub use client::{is_transient, RedisClientManager};
pub use options::{parse_redis_options, RedisOptions, RedisTarget};
pub use redis_queue::RedisQueue;
