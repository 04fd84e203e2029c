//! Front object: validated configuration plus a pool serving task rounds.

use tracing::{info, warn};

use crate::config::ParallelConfig;
use crate::core::device::{DeviceId, WorkerSlot};
use crate::core::dispatch::Results;
use crate::core::error::{ConfigError, PoolError};
use crate::core::task::{Initializer, Task};
use crate::core::worker_pool::{DevicePool, PoolStats, TeardownReport};

enum Backend<T: Send + 'static> {
    Pool(DevicePool<T>),
    Inline(WorkerSlot),
}

/// Runs rounds of tasks on device-bound workers and collects their results.
///
/// Workers are started once, at construction, and reused by every call to
/// [`GpuParallel::run`]. Dropping the value tears the pool down.
///
/// ```rust,ignore
/// use gpu_parallel::config::ParallelConfig;
/// use gpu_parallel::core::{GpuParallel, Task};
///
/// let mut gp = GpuParallel::<String>::new(
///     ParallelConfig::new().with_n_devices(2).with_preserve_order(true),
///     None,
/// )?;
/// let results = gp.run_collect((0..10).map(|i| {
///     Task::new(move |slot| Ok(format!("{i} on {}", slot.device_id)))
/// }))?;
/// ```
pub struct GpuParallel<T: Send + 'static> {
    config: ParallelConfig,
    devices: Vec<DeviceId>,
    backend: Backend<T>,
    round: u64,
}

impl<T: Send + 'static> GpuParallel<T> {
    /// Validate `config`, then start the workers (or run the initializer
    /// inline in debug mode).
    ///
    /// # Errors
    ///
    /// - `PoolError::Config` for an invalid configuration
    /// - `PoolError::Spawn` if a worker thread cannot be started
    /// - `PoolError::Initializer` if the initializer fails in debug mode
    pub fn new(config: ParallelConfig, initializer: Option<Initializer>) -> Result<Self, PoolError> {
        let devices = config.devices()?;

        let backend = if config.debug {
            warn!("Debug mode. All tasks will be run on the calling thread for debug purposes.");
            let first = devices.first().cloned().ok_or(ConfigError::EmptyDeviceIds)?;
            let slot = WorkerSlot::new(0, first);
            if let Some(init) = initializer.as_ref() {
                init(&slot).map_err(|e| PoolError::Initializer {
                    worker_id: slot.worker_id,
                    device_id: slot.device_id.to_string(),
                    message: format!("{e:#}"),
                })?;
            }
            Backend::Inline(slot)
        } else {
            Backend::Pool(DevicePool::new(&config, &devices, initializer)?)
        };

        Ok(Self {
            config,
            devices,
            backend,
            round: 0,
        })
    }

    /// Configuration this instance was built from.
    #[must_use]
    pub const fn config(&self) -> &ParallelConfig {
        &self.config
    }

    /// Devices workers are bound to.
    #[must_use]
    pub fn devices(&self) -> &[DeviceId] {
        &self.devices
    }

    /// Whether tasks run inline on the calling thread.
    #[must_use]
    pub const fn is_debug(&self) -> bool {
        matches!(self.backend, Backend::Inline(_))
    }

    /// Pool statistics; `None` in debug mode.
    #[must_use]
    pub fn stats(&self) -> Option<PoolStats> {
        match &self.backend {
            Backend::Pool(pool) => Some(pool.stats()),
            Backend::Inline(_) => None,
        }
    }

    /// Submit `tasks` and return a lazy sequence of their results.
    ///
    /// Nothing is submitted until the sequence is pulled. Ordering and error
    /// handling follow the configuration's `preserve_order` and
    /// `ignore_errors` flags. In debug mode each pull runs the next task on
    /// the calling thread and its error is returned as `PoolError::Task`.
    pub fn run<'a, I>(&'a mut self, tasks: I) -> Results<'a, T>
    where
        I: IntoIterator<Item = Task<T>>,
        I::IntoIter: 'a,
    {
        self.round += 1;
        match &self.backend {
            Backend::Pool(pool) => Results::pooled(
                pool,
                self.round,
                tasks,
                self.config.preserve_order,
                self.config.ignore_errors,
            ),
            Backend::Inline(slot) => {
                warn!("Debug mode is turned on. All tasks will be run on the calling thread.");
                Results::inline(slot.clone(), tasks)
            }
        }
    }

    /// Run `tasks` and collect every result, stopping at the first error.
    ///
    /// # Errors
    ///
    /// Returns the first error the result sequence yields.
    pub fn run_collect<I>(&mut self, tasks: I) -> Result<Vec<Option<T>>, PoolError>
    where
        I: IntoIterator<Item = Task<T>>,
    {
        self.run(tasks).collect()
    }

    /// Tear the workers down. Safe to call more than once.
    pub fn shutdown(&self) -> TeardownReport {
        match &self.backend {
            Backend::Pool(pool) => pool.shutdown(),
            Backend::Inline(_) => TeardownReport::default(),
        }
    }
}

impl<T: Send + 'static> Drop for GpuParallel<T> {
    fn drop(&mut self) {
        if let Backend::Pool(pool) = &self.backend {
            if !pool.is_shut_down() {
                info!(pool_id = %pool.pool_id(), "Releasing worker pool");
                pool.shutdown();
            }
        }
    }
}
