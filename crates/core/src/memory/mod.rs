// In-process backends (no store behind them)

mod channel;
mod dummy;

pub use channel::ChannelQueue;
pub use dummy::DummyQueue;
