//! Tagged task outcomes and their consumer-side resolution.

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::warn;

use crate::core::device::{DeviceId, WorkerId};
use crate::core::error::PoolError;

/// A task failure captured inside an initialized worker.
///
/// Only the rendered message and origin identifiers survive the trip back to
/// the consumer; the original error value stays on the worker.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[error("task failed in worker-{worker_id} ({device_id}): {message}")]
pub struct WorkerFailure {
    /// Rendered error chain or panic message.
    pub message: String,
    /// Worker that ran the task.
    pub worker_id: WorkerId,
    /// Device bound to that worker.
    pub device_id: DeviceId,
}

/// Result of executing one task. Exactly one is produced per submitted task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "data", rename_all = "snake_case")]
pub enum Outcome<T> {
    /// The task returned a value.
    Success(T),
    /// The task returned an error or panicked.
    WorkerFailure(WorkerFailure),
    /// The worker never obtained a device slot and did not run the task.
    WorkerUninitialized,
}

impl<T> Outcome<T> {
    /// Whether the task produced a value.
    pub const fn is_success(&self) -> bool {
        matches!(self, Self::Success(_))
    }

    /// Turn the outcome into a value, a placeholder, or a pool error.
    ///
    /// `WorkerUninitialized` is an error even when `ignore_errors` is set:
    /// a worker without a device slot breaks the pool topology and must not
    /// feed placeholders into the result stream.
    ///
    /// # Errors
    ///
    /// - `PoolError::Worker` for a task failure when `ignore_errors` is off
    /// - `PoolError::WorkerUninitialized` for a broken worker
    pub fn resolve(self, ignore_errors: bool) -> Result<Option<T>, PoolError> {
        match self {
            Self::Success(value) => Ok(Some(value)),
            Self::WorkerFailure(failure) => {
                warn!(
                    worker_id = failure.worker_id,
                    device_id = %failure.device_id,
                    message = %failure.message,
                    "Task failed in worker"
                );
                if ignore_errors {
                    warn!("ignore_errors is set, filling the result with a placeholder");
                    Ok(None)
                } else {
                    Err(PoolError::Worker(failure))
                }
            }
            Self::WorkerUninitialized => Err(PoolError::WorkerUninitialized),
        }
    }
}
