//! Per-worker runtime: slot claim, initialization and task execution.
//!
//! One `WorkerRuntime` is one incarnation of a worker. The backing pool
//! creates a fresh incarnation when a previous one died in its initializer;
//! the new incarnation then competes for a slot like any other worker and,
//! finding the device queue drained, becomes [`WorkerState::Broken`].

use std::any::Any;
use std::panic::{self, AssertUnwindSafe};

use thiserror::Error;
use tracing::{debug, error, info};

use crate::core::device::{DeviceQueue, WorkerSlot};
use crate::core::outcome::{Outcome, WorkerFailure};
use crate::core::task::{Initializer, Task};

/// Lifecycle state of a worker incarnation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
    /// Not started yet.
    Uninitialized,
    /// Claiming a slot and running the initializer.
    Initializing,
    /// Idle, waiting for a task.
    Ready,
    /// Executing a task.
    Running,
    /// No slot was available; every task yields `WorkerUninitialized`.
    Broken,
}

/// The initializer of a worker incarnation failed; the incarnation is dead.
#[derive(Debug, Clone, Error)]
#[error("initializer failed on {slot}: {message}")]
pub struct InitializerError {
    /// Slot the incarnation had claimed. It is not returned to the queue.
    pub slot: WorkerSlot,
    /// Rendered error chain or panic message.
    pub message: String,
}

/// State owned by one worker incarnation for its whole lifetime.
#[derive(Debug)]
pub struct WorkerRuntime {
    state: WorkerState,
    slot: Option<WorkerSlot>,
}

impl Default for WorkerRuntime {
    fn default() -> Self {
        Self::new()
    }
}

impl WorkerRuntime {
    /// Fresh, unstarted incarnation.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            state: WorkerState::Uninitialized,
            slot: None,
        }
    }

    /// Current state.
    #[must_use]
    pub const fn state(&self) -> WorkerState {
        self.state
    }

    /// Slot bound to this incarnation, if it claimed one.
    #[must_use]
    pub const fn slot(&self) -> Option<&WorkerSlot> {
        self.slot.as_ref()
    }

    /// Claim a device slot and run the initializer.
    ///
    /// An empty queue is not an error: the incarnation turns `Broken` and
    /// keeps serving tasks with `WorkerUninitialized`, so the consumer fails
    /// loudly instead of waiting forever.
    ///
    /// # Errors
    ///
    /// Returns `InitializerError` when the initializer returns an error or
    /// panics. The incarnation must not be used afterwards.
    pub fn start(
        &mut self,
        queue: &DeviceQueue,
        init: Option<&Initializer>,
    ) -> Result<(), InitializerError> {
        self.state = WorkerState::Initializing;

        let Some(slot) = queue.claim() else {
            error!("Device queue is empty, likely the pool is respawning a failed worker");
            error!("Worker is in broken state, it will return WorkerUninitialized for every task");
            self.state = WorkerState::Broken;
            return Ok(());
        };

        if let Some(init) = init {
            let failure = match panic::catch_unwind(AssertUnwindSafe(|| init(&slot))) {
                Ok(Ok(())) => None,
                Ok(Err(err)) => Some(format!("{err:#}")),
                Err(payload) => Some(panic_message(payload.as_ref())),
            };
            if let Some(message) = failure {
                self.state = WorkerState::Uninitialized;
                return Err(InitializerError { slot, message });
            }
        }

        info!(
            worker_id = slot.worker_id,
            device_id = %slot.device_id,
            "Worker initialized"
        );
        self.slot = Some(slot);
        self.state = WorkerState::Ready;
        Ok(())
    }

    /// Run one task and produce its outcome.
    ///
    /// Errors and panics raised by the task are captured as
    /// `WorkerFailure`; they never take the worker down.
    pub fn execute<T>(&mut self, index: usize, task: Task<T>) -> Outcome<T> {
        let slot = match (self.state, self.slot.as_ref()) {
            (WorkerState::Ready, Some(slot)) => slot,
            _ => {
                error!(
                    task_index = index,
                    "Worker is in broken state, returning WorkerUninitialized"
                );
                return Outcome::WorkerUninitialized;
            }
        };

        self.state = WorkerState::Running;
        debug!(task_index = index, "Start task");

        let outcome = match panic::catch_unwind(AssertUnwindSafe(|| task.run(slot))) {
            Ok(Ok(value)) => Outcome::Success(value),
            Ok(Err(err)) => {
                error!(task_index = index, error = %format!("{err:#}"), "Error during task");
                Outcome::WorkerFailure(WorkerFailure {
                    message: format!("{err:#}"),
                    worker_id: slot.worker_id,
                    device_id: slot.device_id.clone(),
                })
            }
            Err(payload) => {
                let message = panic_message(payload.as_ref());
                error!(task_index = index, panic = %message, "Task panicked");
                Outcome::WorkerFailure(WorkerFailure {
                    message,
                    worker_id: slot.worker_id,
                    device_id: slot.device_id.clone(),
                })
            }
        };

        self.state = WorkerState::Ready;
        debug!(task_index = index, "Result produced for task");
        outcome
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(msg) = payload.downcast_ref::<&str>() {
        format!("panic: {msg}")
    } else if let Some(msg) = payload.downcast_ref::<String>() {
        format!("panic: {msg}")
    } else {
        "panic with non-string payload".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::device::DeviceId;
    use crate::core::task::initializer;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    fn queue(slots: usize) -> DeviceQueue {
        DeviceQueue::new(&[DeviceId::cuda(0)], slots)
    }

    #[test]
    fn test_start_claims_slot_and_runs_initializer() {
        let calls = Arc::new(AtomicUsize::new(0));
        let seen = Arc::clone(&calls);
        let init = initializer(move |slot| {
            assert_eq!(slot.worker_id, 0);
            seen.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });

        let mut rt = WorkerRuntime::new();
        assert_eq!(rt.state(), WorkerState::Uninitialized);
        rt.start(&queue(1), Some(&init)).unwrap();

        assert_eq!(rt.state(), WorkerState::Ready);
        assert_eq!(rt.slot(), Some(&WorkerSlot::new(0, "cuda:0")));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_empty_queue_breaks_worker() {
        let q = queue(1);
        let _taken = q.claim();

        let mut rt = WorkerRuntime::new();
        rt.start(&q, None).unwrap();
        assert_eq!(rt.state(), WorkerState::Broken);

        let ran = Arc::new(AtomicUsize::new(0));
        let flag = Arc::clone(&ran);
        let outcome = rt.execute(
            0,
            Task::from_fn(move || {
                flag.fetch_add(1, Ordering::SeqCst);
                Ok(1)
            }),
        );
        assert_eq!(outcome, Outcome::WorkerUninitialized);
        assert_eq!(ran.load(Ordering::SeqCst), 0);
        assert_eq!(rt.state(), WorkerState::Broken);
    }

    #[test]
    fn test_initializer_error_is_fatal() {
        let init = initializer(|_slot| Err(anyhow::anyhow!("no driver")));
        let mut rt = WorkerRuntime::new();
        let err = rt.start(&queue(1), Some(&init)).unwrap_err();
        assert_eq!(err.slot.worker_id, 0);
        assert_eq!(err.message, "no driver");
        assert_eq!(
            err.to_string(),
            "initializer failed on worker-0(cuda:0): no driver"
        );
    }

    #[test]
    fn test_initializer_panic_is_fatal() {
        let init = initializer(|_slot| panic!("bad device"));
        let mut rt = WorkerRuntime::new();
        let err = rt.start(&queue(1), Some(&init)).unwrap_err();
        assert_eq!(err.message, "panic: bad device");
    }

    #[test]
    fn test_execute_wraps_errors_and_panics() {
        let mut rt = WorkerRuntime::new();
        rt.start(&queue(1), None).unwrap();

        let ok = rt.execute(0, Task::new(|slot| Ok(slot.worker_id + 41)));
        assert_eq!(ok, Outcome::Success(41));

        let failed: Outcome<usize> = rt.execute(1, Task::from_fn(|| Err(anyhow::anyhow!("boom"))));
        assert_eq!(
            failed,
            Outcome::WorkerFailure(WorkerFailure {
                message: "boom".into(),
                worker_id: 0,
                device_id: DeviceId::cuda(0),
            })
        );

        let panicked: Outcome<usize> = rt.execute(2, Task::from_fn(|| panic!("kaboom")));
        assert!(matches!(panicked, Outcome::WorkerFailure(f) if f.message == "panic: kaboom"));

        // The worker survives both failures.
        assert_eq!(rt.state(), WorkerState::Ready);
        assert_eq!(rt.execute(3, Task::from_fn(|| Ok(7))), Outcome::Success(7));
    }

    #[test]
    fn test_unstarted_worker_does_not_run_tasks() {
        let mut rt = WorkerRuntime::new();
        assert_eq!(rt.execute(0, Task::from_fn(|| Ok(()))), Outcome::WorkerUninitialized);
    }
}
