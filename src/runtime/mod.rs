//! Runtime adapters for async callers.

pub mod tokio_bridge;

pub use tokio_bridge::{collect_async, stream_round, RoundStream};
