//! Worker lifecycle, dispatch, ordering and batching.

pub mod batch;
pub mod device;
pub mod dispatch;
pub mod error;
pub mod outcome;
pub mod parallel;
pub mod task;
pub mod worker;
pub mod worker_pool;

pub use batch::{ArgKind, BatchArgs, BatchCall, BatchFn, BatchPlan, BatchRunner};
pub use device::{DeviceId, DeviceQueue, WorkerId, WorkerSlot};
pub use dispatch::{ResultBuffer, Results};
pub use error::{ConfigError, PoolError, TaskResult};
pub use outcome::{Outcome, WorkerFailure};
pub use parallel::GpuParallel;
pub use task::{delayed, initializer, Initializer, Task};
pub use worker::{InitializerError, WorkerRuntime, WorkerState};
pub use worker_pool::{DevicePool, Envelope, PoolStats, TeardownReport};
