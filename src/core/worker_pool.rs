//! Device-affine worker pool backed by dedicated OS threads.
//!
//! This module provides the `DevicePool` that owns the worker threads, the
//! device slot queue, the intake queue feeding the workers and the result
//! channel they post outcomes to.
//!
//! # Key Features
//!
//! - **Device affinity**: every worker claims one `(worker_id, device_id)` slot for life
//! - **Exactly one outcome per task**: errors and panics are captured as outcomes
//! - **Fail closed**: respawned workers without a slot answer instead of hanging
//! - **Pluggable intake**: `crossbeam` or `flume` queues selected by config
//!
//! # Example
//!
//! ```rust,ignore
//! use gpu_parallel::config::ParallelConfig;
//! use gpu_parallel::core::{DevicePool, DeviceId, Task};
//!
//! let config = ParallelConfig::new().with_n_devices(2);
//! let pool = DevicePool::<u32>::new(&config, &config.devices()?, None)?;
//! pool.submit(1, 0, Task::from_fn(|| Ok(42)))?;
//! let envelope = pool.recv()?;
//! ```

mod engine;
mod native;

use std::sync::atomic::{AtomicU64, Ordering};

use crate::core::outcome::Outcome;
use crate::core::task::Task;

pub use native::DevicePool;

/// Statistics about pool utilization.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PoolStats {
    /// Number of worker threads.
    pub worker_count: usize,

    /// Currently executing tasks.
    pub active_tasks: u64,

    /// Total tasks submitted.
    pub submitted_tasks: u64,

    /// Total tasks that produced an outcome.
    pub completed_tasks: u64,

    /// Tasks whose outcome was a `WorkerFailure`.
    pub failed_tasks: u64,

    /// Tasks answered by a broken worker.
    pub uninitialized_tasks: u64,

    /// Worker incarnations that found no device slot.
    pub broken_workers: u64,

    /// Worker incarnations replaced after an initializer failure.
    pub respawned_workers: u64,
}

/// Internal counters for pool statistics (thread-safe).
#[derive(Debug, Default)]
pub(crate) struct PoolCounters {
    pub active_tasks: AtomicU64,
    pub submitted_tasks: AtomicU64,
    pub completed_tasks: AtomicU64,
    pub failed_tasks: AtomicU64,
    pub uninitialized_tasks: AtomicU64,
    pub broken_workers: AtomicU64,
    pub respawned_workers: AtomicU64,
}

impl PoolCounters {
    /// Get a snapshot of current statistics.
    pub fn snapshot(&self, worker_count: usize) -> PoolStats {
        PoolStats {
            worker_count,
            active_tasks: self.active_tasks.load(Ordering::Relaxed),
            submitted_tasks: self.submitted_tasks.load(Ordering::Relaxed),
            completed_tasks: self.completed_tasks.load(Ordering::Relaxed),
            failed_tasks: self.failed_tasks.load(Ordering::Relaxed),
            uninitialized_tasks: self.uninitialized_tasks.load(Ordering::Relaxed),
            broken_workers: self.broken_workers.load(Ordering::Relaxed),
            respawned_workers: self.respawned_workers.load(Ordering::Relaxed),
        }
    }

    /// Account for an outcome just produced by a worker.
    pub fn record<T>(&self, outcome: &Outcome<T>) {
        self.completed_tasks.fetch_add(1, Ordering::Relaxed);
        match outcome {
            Outcome::Success(_) => {}
            Outcome::WorkerFailure(_) => {
                self.failed_tasks.fetch_add(1, Ordering::Relaxed);
            }
            Outcome::WorkerUninitialized => {
                self.uninitialized_tasks.fetch_add(1, Ordering::Relaxed);
            }
        }
    }
}

/// A task on its way to a worker.
pub(crate) struct Job<T> {
    pub round: u64,
    pub index: usize,
    pub task: Task<T>,
}

/// An outcome on its way back to the consumer, tagged with its origin.
#[derive(Debug)]
pub struct Envelope<T> {
    /// Submission round the task belonged to.
    pub round: u64,
    /// Zero-based index of the task within its round.
    pub index: usize,
    /// What the task produced.
    pub outcome: Outcome<T>,
}

/// What teardown found when joining the workers.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TeardownReport {
    /// Workers that exited within the join timeout.
    pub joined: usize,
    /// Workers still running after the timeout; they were detached.
    pub still_alive: usize,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::device::DeviceId;
    use crate::core::outcome::WorkerFailure;

    #[test]
    fn test_pool_stats_default() {
        let stats = PoolStats::default();
        assert_eq!(stats.worker_count, 0);
        assert_eq!(stats.active_tasks, 0);
        assert_eq!(stats.completed_tasks, 0);
    }

    #[test]
    fn test_counters_record_outcomes() {
        let counters = PoolCounters::default();
        counters.submitted_tasks.fetch_add(3, Ordering::Relaxed);
        counters.record(&Outcome::Success(1));
        counters.record(&Outcome::<i32>::WorkerFailure(WorkerFailure {
            message: "x".into(),
            worker_id: 0,
            device_id: DeviceId::cuda(0),
        }));
        counters.record(&Outcome::<i32>::WorkerUninitialized);

        let stats = counters.snapshot(4);
        assert_eq!(stats.worker_count, 4);
        assert_eq!(stats.submitted_tasks, 3);
        assert_eq!(stats.completed_tasks, 3);
        assert_eq!(stats.failed_tasks, 1);
        assert_eq!(stats.uninitialized_tasks, 1);
    }
}
