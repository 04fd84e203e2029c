//! Native implementation of `DevicePool` using OS threads.
//!
//! Each worker thread hosts one `WorkerRuntime` incarnation at a time. The
//! thread plays the role of a pool process: when an incarnation dies in its
//! initializer the thread starts a fresh one, which has to claim a device
//! slot like any newly spawned worker would.
//!
//! # Design Principles
//!
//! - **No polling**: workers block on the intake queue, the consumer blocks on the result channel
//! - **No shared state with the caller**: only the two channels and the slot queue cross threads
//! - **Clean shutdown**: dropping the intake sender unblocks idle workers naturally

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam_channel::{Receiver, Sender, TryRecvError};
use parking_lot::Mutex;
use tracing::{debug, error, field, info, info_span, warn};
use uuid::Uuid;

use crate::config::ParallelConfig;
use crate::core::device::{DeviceId, DeviceQueue};
use crate::core::error::PoolError;
use crate::core::task::{Initializer, Task};
use crate::core::worker::{WorkerRuntime, WorkerState};

use super::engine::{self, IntakeReceiver, IntakeSender};
use super::{Envelope, Job, PoolCounters, PoolStats, TeardownReport};

/// Pool of device-bound worker threads.
///
/// The pool owns the intake queue, the result channel and the device slot
/// queue. It serves any number of submission rounds and is torn down once,
/// either by [`DevicePool::shutdown`] or when dropped.
pub struct DevicePool<T: Send + 'static> {
    /// Identifier used to correlate log lines of this pool.
    pool_id: Uuid,

    /// Number of worker threads.
    worker_count: usize,

    /// How long teardown waits for each worker.
    join_timeout: Duration,

    /// Job sender (to workers). Option allows clean shutdown by dropping.
    intake: Mutex<Option<IntakeSender<Job<T>>>>,

    /// Outcomes posted by workers.
    results: Receiver<Envelope<T>>,

    /// Slot queue shared with the workers.
    device_queue: DeviceQueue,

    /// Pool statistics counters (lock-free atomics).
    counters: Arc<PoolCounters>,

    /// Shutdown flag (lock-free atomic).
    shutdown: Arc<AtomicBool>,

    /// Worker thread handles.
    workers: Mutex<Vec<JoinHandle<()>>>,
}

/// Everything a worker thread owns.
struct WorkerContext<T> {
    thread_idx: usize,
    pool_id: Uuid,
    intake: IntakeReceiver<Job<T>>,
    results: Sender<Envelope<T>>,
    device_queue: DeviceQueue,
    initializer: Option<Initializer>,
    counters: Arc<PoolCounters>,
    shutdown: Arc<AtomicBool>,
}

impl<T: Send + 'static> DevicePool<T> {
    /// Create the slot queue and spawn one worker thread per slot.
    ///
    /// Workers claim their slots and run the initializer in the background;
    /// this call does not wait for them.
    ///
    /// # Errors
    ///
    /// - `PoolError::Config` if the configuration is invalid
    /// - `PoolError::Spawn` if a worker thread cannot be spawned
    pub fn new(
        config: &ParallelConfig,
        devices: &[DeviceId],
        initializer: Option<Initializer>,
    ) -> Result<Self, PoolError> {
        config.validate()?;

        let device_queue = DeviceQueue::new(devices, config.workers_per_device);
        let worker_count = device_queue.capacity();
        let (intake_tx, intake_rx) = engine::intake::<Job<T>>(config.engine);
        let (result_tx, result_rx) = crossbeam_channel::unbounded();
        let counters = Arc::new(PoolCounters::default());
        let shutdown = Arc::new(AtomicBool::new(false));
        let pool_id = Uuid::new_v4();

        let mut workers = Vec::with_capacity(worker_count);
        for thread_idx in 0..worker_count {
            let ctx = WorkerContext {
                thread_idx,
                pool_id,
                intake: intake_rx.clone(),
                results: result_tx.clone(),
                device_queue: device_queue.clone(),
                initializer: initializer.clone(),
                counters: Arc::clone(&counters),
                shutdown: Arc::clone(&shutdown),
            };
            match spawn_worker(ctx, config.thread_stack_size) {
                Ok(handle) => workers.push(handle),
                Err(e) => {
                    error!(thread_idx, error = %e, "Failed to spawn worker thread");
                    // Workers spawned so far exit once the intake closes.
                    shutdown.store(true, Ordering::Release);
                    drop(intake_tx);
                    return Err(PoolError::Spawn(e));
                }
            }
        }
        // Only workers hold result senders, so a dead pool surfaces as Disconnected.
        drop(result_tx);

        info!(
            pool_id = %pool_id,
            devices = devices.len(),
            workers_per_device = config.workers_per_device,
            worker_count,
            engine = %config.engine,
            "DevicePool initialized with dedicated worker threads"
        );

        Ok(Self {
            pool_id,
            worker_count,
            join_timeout: config.join_timeout(),
            intake: Mutex::new(Some(intake_tx)),
            results: result_rx,
            device_queue,
            counters,
            shutdown,
            workers: Mutex::new(workers),
        })
    }

    /// Identifier of this pool in log output.
    #[must_use]
    pub const fn pool_id(&self) -> Uuid {
        self.pool_id
    }

    /// Number of worker threads.
    #[must_use]
    pub const fn worker_count(&self) -> usize {
        self.worker_count
    }

    /// Device slots nobody has claimed yet.
    #[must_use]
    pub fn unclaimed_slots(&self) -> usize {
        self.device_queue.remaining()
    }

    /// Whether teardown has started.
    #[must_use]
    pub fn is_shut_down(&self) -> bool {
        self.shutdown.load(Ordering::Acquire)
    }

    /// Hand a task to the workers without waiting.
    ///
    /// Delivery order to workers is not guaranteed; the task is tagged with
    /// `round` and `index` so its outcome can be matched later.
    ///
    /// # Errors
    ///
    /// - `PoolError::Shutdown` if teardown has started
    /// - `PoolError::Disconnected` if every worker has exited
    pub fn submit(&self, round: u64, index: usize, task: Task<T>) -> Result<(), PoolError> {
        if self.shutdown.load(Ordering::Acquire) {
            return Err(PoolError::Shutdown);
        }

        let intake = self.intake.lock();
        let Some(intake) = intake.as_ref() else {
            return Err(PoolError::Shutdown);
        };

        intake
            .send(Job { round, index, task })
            .map_err(|_| PoolError::Disconnected)?;
        self.counters.submitted_tasks.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// Block until a worker posts an outcome.
    ///
    /// # Errors
    ///
    /// Returns `PoolError::Shutdown` after teardown, or
    /// `PoolError::Disconnected` once every worker has exited on its own.
    pub fn recv(&self) -> Result<Envelope<T>, PoolError> {
        self.results.recv().map_err(|_| self.closed())
    }

    /// Take an outcome if one is already waiting.
    ///
    /// # Errors
    ///
    /// Same as [`DevicePool::recv`], once the channel is drained.
    pub fn try_recv(&self) -> Result<Option<Envelope<T>>, PoolError> {
        match self.results.try_recv() {
            Ok(envelope) => Ok(Some(envelope)),
            Err(TryRecvError::Empty) => Ok(None),
            Err(TryRecvError::Disconnected) => Err(self.closed()),
        }
    }

    fn closed(&self) -> PoolError {
        if self.is_shut_down() {
            PoolError::Shutdown
        } else {
            PoolError::Disconnected
        }
    }

    /// Get current pool statistics.
    #[must_use]
    pub fn stats(&self) -> PoolStats {
        self.counters.snapshot(self.worker_count)
    }

    /// Tear the pool down: close intake, join workers, report survivors.
    ///
    /// Each worker gets `join_timeout` to exit; workers still busy after
    /// that are detached and reported as a warning, never as an error.
    /// Calling this more than once is a no-op returning an empty report.
    pub fn shutdown(&self) -> TeardownReport {
        if self.shutdown.swap(true, Ordering::AcqRel) {
            return TeardownReport::default();
        }

        info!(pool_id = %self.pool_id, "Shutting down device pool");

        // Drop the sender to unblock all workers waiting on recv()
        {
            let mut intake = self.intake.lock();
            *intake = None;
        }

        let mut report = TeardownReport::default();
        let mut workers = self.workers.lock();
        for (idx, worker) in workers.drain(..).enumerate() {
            let (tx, rx) = crossbeam_channel::bounded(1);
            let joiner = thread::Builder::new()
                .name(format!("gpup-joiner-{idx}"))
                .spawn(move || {
                    let _ = tx.send(worker.join().is_ok());
                });
            if let Err(e) = joiner {
                warn!(worker = idx, error = %e, "Could not spawn joiner thread - detaching worker");
                report.still_alive += 1;
                continue;
            }

            match rx.recv_timeout(self.join_timeout) {
                Ok(true) => {
                    debug!(worker = idx, "Worker joined successfully");
                    report.joined += 1;
                }
                Ok(false) => {
                    warn!(worker = idx, "Worker panicked");
                    report.joined += 1;
                }
                Err(_) => {
                    warn!(worker = idx, "Worker did not exit within timeout - detaching");
                    report.still_alive += 1;
                }
            }
        }

        if report.still_alive > 0 {
            warn!(
                pool_id = %self.pool_id,
                still_alive = report.still_alive,
                "Worker threads are still alive after closing the pool"
            );
        }
        info!(
            pool_id = %self.pool_id,
            joined = report.joined,
            "Device pool shut down complete"
        );
        report
    }
}

impl<T: Send + 'static> Drop for DevicePool<T> {
    fn drop(&mut self) {
        if !self.is_shut_down() {
            debug!(pool_id = %self.pool_id, "DevicePool dropped without explicit shutdown");
            self.shutdown();
        }
    }
}

/// Spawn a worker thread.
fn spawn_worker<T: Send + 'static>(
    ctx: WorkerContext<T>,
    stack_size: Option<usize>,
) -> std::io::Result<JoinHandle<()>> {
    let mut builder = thread::Builder::new().name(format!("gpup-worker-{}", ctx.thread_idx));
    if let Some(size) = stack_size {
        builder = builder.stack_size(size);
    }
    builder.spawn(move || worker_main(ctx))
}

fn worker_main<T: Send + 'static>(ctx: WorkerContext<T>) {
    let span = info_span!(
        "worker",
        pool_id = %ctx.pool_id,
        thread = ctx.thread_idx,
        worker_id = field::Empty,
        device_id = field::Empty,
    );
    let _entered = span.enter();
    debug!("Worker thread started");

    // Each failed initializer ends one incarnation; the next one claims again.
    let mut runtime = loop {
        let mut runtime = WorkerRuntime::new();
        match runtime.start(&ctx.device_queue, ctx.initializer.as_ref()) {
            Ok(()) => break runtime,
            Err(err) => {
                error!(error = %err, "Worker initializer failed");
                if ctx.shutdown.load(Ordering::Acquire) {
                    return;
                }
                ctx.counters.respawned_workers.fetch_add(1, Ordering::Relaxed);
                info!("Respawning worker");
            }
        }
    };

    if let Some(slot) = runtime.slot() {
        span.record("worker_id", slot.worker_id);
        span.record("device_id", field::display(&slot.device_id));
    }
    if runtime.state() == WorkerState::Broken {
        ctx.counters.broken_workers.fetch_add(1, Ordering::Relaxed);
        warn!("Pool is running with degraded capacity: a worker holds no device slot");
    }

    while let Some(job) = ctx.intake.recv() {
        if ctx.shutdown.load(Ordering::Acquire) {
            debug!("Worker shutdown requested, exiting");
            break;
        }

        ctx.counters.active_tasks.fetch_add(1, Ordering::Relaxed);
        let outcome = runtime.execute(job.index, job.task);
        ctx.counters.active_tasks.fetch_sub(1, Ordering::Relaxed);
        ctx.counters.record(&outcome);

        let envelope = Envelope {
            round: job.round,
            index: job.index,
            outcome,
        };
        if ctx.results.send(envelope).is_err() {
            debug!("Result channel closed, exiting");
            break;
        }
    }

    debug!("Worker thread exiting");
}
