//! Builders to construct pools from configuration and closures.

pub mod pool_builder;

pub use pool_builder::ParallelBuilder;
