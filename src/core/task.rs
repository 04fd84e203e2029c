//! Units of work and worker initializers.
//!
//! A task is a closure that already captured its real arguments and receives
//! the executing worker's [`WorkerSlot`] as its only parameter. Tasks that do
//! not care about the slot can be built with [`Task::from_fn`].

use std::fmt;
use std::sync::Arc;

use crate::core::device::WorkerSlot;
use crate::core::error::TaskResult;

type TaskFn<T> = Box<dyn FnOnce(&WorkerSlot) -> TaskResult<T> + Send + 'static>;

/// A single unit of work producing a `T`.
pub struct Task<T> {
    run: TaskFn<T>,
}

impl<T> Task<T> {
    /// Wrap a closure that receives the executing worker's slot.
    pub fn new<F>(f: F) -> Self
    where
        F: FnOnce(&WorkerSlot) -> TaskResult<T> + Send + 'static,
    {
        Self { run: Box::new(f) }
    }

    /// Wrap a closure that ignores which worker runs it.
    pub fn from_fn<F>(f: F) -> Self
    where
        F: FnOnce() -> TaskResult<T> + Send + 'static,
    {
        Self::new(move |_slot| f())
    }

    /// Execute the task on behalf of `slot`.
    ///
    /// # Errors
    ///
    /// Returns whatever error the wrapped closure returns.
    pub fn run(self, slot: &WorkerSlot) -> TaskResult<T> {
        (self.run)(slot)
    }
}

impl<T> fmt::Debug for Task<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Task").finish_non_exhaustive()
    }
}

/// Bind `args` to `f`, deferring the call until a worker picks the task up.
///
/// ```rust,ignore
/// let tasks = (0..10).map(|i| delayed(|value: i32, slot: &WorkerSlot| {
///     Ok(format!("{value} on {}", slot.device_id))
/// }, i));
/// ```
pub fn delayed<A, T, F>(f: F, args: A) -> Task<T>
where
    A: Send + 'static,
    F: FnOnce(A, &WorkerSlot) -> TaskResult<T> + Send + 'static,
{
    Task::new(move |slot| f(args, slot))
}

/// Per-worker initializer, run once with the worker's slot before any task.
pub type Initializer = Arc<dyn Fn(&WorkerSlot) -> TaskResult<()> + Send + Sync + 'static>;

/// Box a closure as an [`Initializer`].
pub fn initializer<F>(f: F) -> Initializer
where
    F: Fn(&WorkerSlot) -> TaskResult<()> + Send + Sync + 'static,
{
    Arc::new(f)
}
