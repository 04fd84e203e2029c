//! Drive task rounds from a tokio runtime without blocking its reactor.
//!
//! Result retrieval blocks by design, so both helpers move the
//! [`GpuParallel`] onto tokio's blocking pool for the duration of a round
//! and hand it back afterwards. They must be called from within a tokio
//! runtime.

use tokio::sync::mpsc;
use tokio::task::{self, JoinHandle};
use tracing::debug;

use crate::core::{GpuParallel, PoolError, Task};

/// Result items of one round.
pub type RoundItem<T> = Result<Option<T>, PoolError>;

/// Run a whole round on the blocking pool and collect it.
///
/// Returns the pool together with the round's outcome so it can serve the
/// next round.
///
/// # Errors
///
/// Returns `PoolError::Internal` if the blocking thread panicked; the pool
/// is lost in that case.
pub async fn collect_async<T, I>(
    parallel: GpuParallel<T>,
    tasks: I,
) -> Result<(GpuParallel<T>, Result<Vec<Option<T>>, PoolError>), PoolError>
where
    T: Send + 'static,
    I: IntoIterator<Item = Task<T>> + Send + 'static,
{
    task::spawn_blocking(move || {
        let mut parallel = parallel;
        let results = parallel.run_collect(tasks);
        (parallel, results)
    })
    .await
    .map_err(|e| PoolError::Internal(format!("blocking collector failed: {e}")))
}

/// Results of a round streamed into async code as they are released.
pub struct RoundStream<T: Send + 'static> {
    results: mpsc::Receiver<RoundItem<T>>,
    driver: JoinHandle<GpuParallel<T>>,
}

impl<T: Send + 'static> RoundStream<T> {
    /// Wait for the next result; `None` once the round has ended.
    pub async fn next(&mut self) -> Option<RoundItem<T>> {
        self.results.recv().await
    }

    /// Stop consuming and take the pool back.
    ///
    /// Outcomes not yet pulled are left behind and discarded by the next round.
    ///
    /// # Errors
    ///
    /// Returns `PoolError::Internal` if the driving thread panicked.
    pub async fn finish(self) -> Result<GpuParallel<T>, PoolError> {
        drop(self.results);
        self.driver
            .await
            .map_err(|e| PoolError::Internal(format!("round driver failed: {e}")))
    }
}

/// Start a round on the blocking pool and stream its results.
///
/// At most `capacity` released results wait in the stream; the driver
/// blocks when it is full.
pub fn stream_round<T, I>(parallel: GpuParallel<T>, tasks: I, capacity: usize) -> RoundStream<T>
where
    T: Send + 'static,
    I: IntoIterator<Item = Task<T>> + Send + 'static,
{
    let (tx, rx) = mpsc::channel(capacity.max(1));
    let driver = task::spawn_blocking(move || {
        let mut parallel = parallel;
        for item in parallel.run(tasks) {
            if tx.blocking_send(item).is_err() {
                debug!("Round stream dropped by consumer, stopping early");
                break;
            }
        }
        parallel
    });
    RoundStream {
        results: rx,
        driver,
    }
}
