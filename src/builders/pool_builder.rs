//! Builder tying a configuration to the closures that cannot live in it.

use serde_json::Value;

use crate::config::ParallelConfig;
use crate::core::{
    BatchCall, BatchRunner, GpuParallel, Initializer, PoolError, TaskResult, WorkerSlot,
};

/// Collects configuration and an optional initializer, then builds a
/// [`GpuParallel`] or a [`BatchRunner`].
///
/// ```rust,ignore
/// let mut gp = ParallelBuilder::new()
///     .config(ParallelConfig::from_env()?)
///     .initializer(|slot| load_model(&slot.device_id))
///     .build::<Embedding>()?;
/// ```
#[derive(Default)]
pub struct ParallelBuilder {
    config: ParallelConfig,
    initializer: Option<Initializer>,
}

impl ParallelBuilder {
    /// Builder with the default configuration and no initializer.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the whole configuration.
    #[must_use]
    pub fn config(mut self, config: ParallelConfig) -> Self {
        self.config = config;
        self
    }

    /// Adjust the configuration in place.
    #[must_use]
    pub fn configure<F>(mut self, f: F) -> Self
    where
        F: FnOnce(ParallelConfig) -> ParallelConfig,
    {
        self.config = f(self.config);
        self
    }

    /// Run `f` once in every worker before it accepts tasks.
    #[must_use]
    pub fn initializer<F>(mut self, f: F) -> Self
    where
        F: Fn(&WorkerSlot) -> TaskResult<()> + Send + Sync + 'static,
    {
        self.initializer = Some(crate::core::initializer(f));
        self
    }

    /// Start a pool producing `T`.
    ///
    /// # Errors
    ///
    /// See [`GpuParallel::new`].
    pub fn build<T: Send + 'static>(self) -> Result<GpuParallel<T>, PoolError> {
        GpuParallel::new(self.config, self.initializer)
    }

    /// Start a batching pool for `task_fn`.
    ///
    /// # Errors
    ///
    /// See [`BatchRunner::new`].
    pub fn build_batch<F>(
        self,
        task_fn: F,
        batch_size: usize,
        flat_result: bool,
    ) -> Result<BatchRunner, PoolError>
    where
        F: Fn(BatchCall, &WorkerSlot) -> TaskResult<Value> + Send + Sync + 'static,
    {
        BatchRunner::new(task_fn, batch_size, flat_result, self.config, self.initializer)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::Task;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[test]
    fn test_builder_runs_initializer_in_debug_mode() {
        let calls = Arc::new(AtomicUsize::new(0));
        let seen = Arc::clone(&calls);

        let mut gp = ParallelBuilder::new()
            .configure(|c| c.with_debug(true).with_device_ids(["cuda:5"]))
            .initializer(move |slot| {
                assert_eq!(slot.device_id.as_str(), "cuda:5");
                seen.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
            .build::<u8>()
            .unwrap();

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        let out = gp.run_collect([Task::from_fn(|| Ok(1u8))]).unwrap();
        assert_eq!(out, vec![Some(1)]);
    }

    #[test]
    fn test_builder_rejects_invalid_config() {
        let err = ParallelBuilder::new()
            .configure(|c| c.with_workers_per_device(0))
            .build::<()>()
            .err()
            .unwrap();
        assert!(matches!(err, PoolError::Config(_)));
    }
}
