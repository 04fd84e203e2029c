//! Configuration models for pools and engines.

pub mod pool;

pub use pool::{EngineKind, ParallelConfig, ENV_PREFIX};
