//! Error types for pool construction, dispatch and result consumption.

use thiserror::Error;

use crate::core::outcome::WorkerFailure;

/// Configuration problems detected before any worker is spawned.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConfigError {
    /// Both an explicit device list and a device count were given.
    #[error("fill either `device_ids` or `n_devices`, not both")]
    ConflictingDevices,
    /// The explicit device list is empty.
    #[error("device_ids must not be empty")]
    EmptyDeviceIds,
    /// The device count is zero.
    #[error("n_devices must be greater than 0")]
    ZeroDevices,
    /// Zero workers per device requested.
    #[error("workers_per_device must be greater than 0")]
    ZeroWorkersPerDevice,
    /// Zero samples per batch requested.
    #[error("batch_size must be greater than 0")]
    ZeroBatchSize,
    /// The backing engine name is not recognised.
    #[error("unknown engine: {0}")]
    UnknownEngine(String),
    /// The configuration document could not be parsed.
    #[error("parse error: {0}")]
    Parse(String),
    /// An environment variable holds a value of the wrong shape.
    #[error("invalid value for {key}: {value}")]
    InvalidEnv {
        /// Variable name.
        key: String,
        /// Offending value.
        value: String,
    },
}

/// Errors surfaced by a pool while submitting tasks or consuming results.
#[derive(Debug, Error)]
pub enum PoolError {
    /// Construction was rejected by configuration validation.
    #[error("invalid configuration: {0}")]
    Config(#[from] ConfigError),

    /// A task failed inside an initialized worker.
    #[error("{0}")]
    Worker(WorkerFailure),

    /// A task was routed to a worker that never obtained a device slot.
    #[error("worker is not initialized: the device queue was empty when it started")]
    WorkerUninitialized,

    /// A task failed while running inline in debug mode.
    #[error(transparent)]
    Task(anyhow::Error),

    /// The initializer failed while running inline in debug mode.
    #[error("initializer failed on worker-{worker_id} ({device_id}): {message}")]
    Initializer {
        /// Worker the initializer ran for.
        worker_id: usize,
        /// Device bound to that worker.
        device_id: String,
        /// Rendered error chain.
        message: String,
    },

    /// The pool has been torn down and accepts no more work.
    #[error("pool has been shut down")]
    Shutdown,

    /// Every worker hung up on the result channel.
    #[error("result channel disconnected")]
    Disconnected,

    /// A worker thread could not be spawned.
    #[error("failed to spawn worker thread: {0}")]
    Spawn(#[from] std::io::Error),

    /// Batch arguments or batch results have an unusable shape.
    #[error("batch error: {0}")]
    Batch(String),

    /// Internal failure (bridge thread panic and similar).
    #[error("internal error: {0}")]
    Internal(String),
}

/// Result returned by user tasks and initializers.
pub type TaskResult<T> = Result<T, anyhow::Error>;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::device::DeviceId;

    #[test]
    fn test_config_error_display() {
        assert_eq!(
            ConfigError::ConflictingDevices.to_string(),
            "fill either `device_ids` or `n_devices`, not both"
        );
        assert_eq!(
            ConfigError::UnknownEngine("billiard".into()).to_string(),
            "unknown engine: billiard"
        );
    }

    #[test]
    fn test_pool_error_wraps_config() {
        let err: PoolError = ConfigError::ZeroDevices.into();
        assert_eq!(err.to_string(), "invalid configuration: n_devices must be greater than 0");
    }

    #[test]
    fn test_worker_error_carries_origin() {
        let failure = WorkerFailure {
            message: "boom".into(),
            worker_id: 3,
            device_id: DeviceId::cuda(1),
        };
        let err = PoolError::Worker(failure);
        assert_eq!(err.to_string(), "task failed in worker-3 (cuda:1): boom");
    }

    #[test]
    fn test_task_error_is_transparent() {
        let err = PoolError::Task(anyhow::anyhow!("raw failure"));
        assert_eq!(err.to_string(), "raw failure");
    }
}
