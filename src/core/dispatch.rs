//! Submission and result collection for one round of tasks.
//!
//! [`Results`] is a lazy, single-pass iterator. Pulling from it submits input
//! tasks as they are enumerated and drains the result channel; in ordered
//! mode outcomes completed ahead of time wait in a [`ResultBuffer`] until
//! every earlier index has been released.

use std::collections::HashMap;
use std::fmt;

use tracing::{debug, trace};

use crate::core::device::WorkerSlot;
use crate::core::error::PoolError;
use crate::core::outcome::Outcome;
use crate::core::task::Task;
use crate::core::worker_pool::{DevicePool, Envelope};

/// Out-of-order outcomes waiting for their turn.
///
/// Holds only entries completed ahead of the next index to release; an
/// entry leaves the buffer the moment it is released.
#[derive(Debug)]
pub struct ResultBuffer<T> {
    pending: HashMap<usize, Outcome<T>>,
    next: usize,
    peak: usize,
}

impl<T> Default for ResultBuffer<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> ResultBuffer<T> {
    /// Empty buffer expecting index 0 first.
    #[must_use]
    pub fn new() -> Self {
        Self {
            pending: HashMap::new(),
            next: 0,
            peak: 0,
        }
    }

    /// Store the outcome of task `index`.
    pub fn insert(&mut self, index: usize, outcome: Outcome<T>) {
        self.pending.insert(index, outcome);
        self.peak = self.peak.max(self.pending.len());
    }

    /// Release the outcome for the next expected index, if it has arrived.
    pub fn pop_next(&mut self) -> Option<Outcome<T>> {
        let outcome = self.pending.remove(&self.next)?;
        self.next += 1;
        Some(outcome)
    }

    /// Index the buffer is waiting for.
    #[must_use]
    pub const fn next_index(&self) -> usize {
        self.next
    }

    /// Outcomes currently held.
    #[must_use]
    pub fn len(&self) -> usize {
        self.pending.len()
    }

    /// Whether nothing is held.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    /// Largest number of outcomes held at once.
    #[must_use]
    pub const fn peak(&self) -> usize {
        self.peak
    }
}

type TaskIter<'a, T> = Box<dyn Iterator<Item = Task<T>> + 'a>;

/// Lazy sequence of resolved results for one round.
///
/// Items are `Ok(Some(value))` for successes, `Ok(None)` for ignored
/// failures and `Err(_)` for surfaced errors. After an error the sequence
/// ends; outcomes of that round still in flight are discarded by the next
/// round.
pub struct Results<'a, T: Send + 'static> {
    inner: Inner<'a, T>,
    halted: bool,
}

enum Inner<'a, T: Send + 'static> {
    Pooled(Dispatch<'a, T>),
    Inline(Inline<'a, T>),
}

struct Dispatch<'a, T: Send + 'static> {
    pool: &'a DevicePool<T>,
    round: u64,
    tasks: Option<TaskIter<'a, T>>,
    submitted: usize,
    released: usize,
    ignore_errors: bool,
    buffer: Option<ResultBuffer<T>>,
}

struct Inline<'a, T> {
    tasks: TaskIter<'a, T>,
    slot: WorkerSlot,
    released: usize,
}

impl<'a, T: Send + 'static> Results<'a, T> {
    pub(crate) fn pooled<I>(
        pool: &'a DevicePool<T>,
        round: u64,
        tasks: I,
        preserve_order: bool,
        ignore_errors: bool,
    ) -> Self
    where
        I: IntoIterator<Item = Task<T>>,
        I::IntoIter: 'a,
    {
        Self {
            inner: Inner::Pooled(Dispatch {
                pool,
                round,
                tasks: Some(Box::new(tasks.into_iter())),
                submitted: 0,
                released: 0,
                ignore_errors,
                buffer: preserve_order.then(ResultBuffer::new),
            }),
            halted: false,
        }
    }

    pub(crate) fn inline<I>(slot: WorkerSlot, tasks: I) -> Self
    where
        I: IntoIterator<Item = Task<T>>,
        I::IntoIter: 'a,
    {
        Self {
            inner: Inner::Inline(Inline {
                tasks: Box::new(tasks.into_iter()),
                slot,
                released: 0,
            }),
            halted: false,
        }
    }

    /// Tasks handed to the pool so far.
    #[must_use]
    pub const fn submitted(&self) -> usize {
        match &self.inner {
            Inner::Pooled(d) => d.submitted,
            Inner::Inline(i) => i.released,
        }
    }

    /// Results yielded so far.
    #[must_use]
    pub const fn released(&self) -> usize {
        match &self.inner {
            Inner::Pooled(d) => d.released,
            Inner::Inline(i) => i.released,
        }
    }

    /// Outcomes waiting in the order window right now.
    #[must_use]
    pub fn buffered(&self) -> usize {
        match &self.inner {
            Inner::Pooled(Dispatch { buffer: Some(b), .. }) => b.len(),
            _ => 0,
        }
    }

    /// Largest order window seen during this round.
    #[must_use]
    pub fn peak_buffered(&self) -> usize {
        match &self.inner {
            Inner::Pooled(Dispatch { buffer: Some(b), .. }) => b.peak(),
            _ => 0,
        }
    }
}

impl<T: Send + 'static> Dispatch<'_, T> {
    /// Submit the next input task. Returns `false` once input is exhausted.
    fn submit_next(&mut self) -> Result<bool, PoolError> {
        let Some(tasks) = self.tasks.as_mut() else {
            return Ok(false);
        };
        match tasks.next() {
            Some(task) => {
                self.pool.submit(self.round, self.submitted, task)?;
                self.submitted += 1;
                Ok(true)
            }
            None => {
                self.tasks = None;
                debug!(round = self.round, submitted = self.submitted, "Submitted all tasks");
                Ok(false)
            }
        }
    }

    /// Submitted tasks whose outcome has not been received yet.
    fn outstanding(&self) -> usize {
        let buffered = self.buffer.as_ref().map_or(0, ResultBuffer::len);
        self.submitted - self.released - buffered
    }

    /// Next envelope of this round, submitting input while nothing is ready.
    ///
    /// Returns `None` once input is exhausted and every outcome has arrived.
    fn next_envelope(&mut self) -> Result<Option<Envelope<T>>, PoolError> {
        loop {
            let envelope = match self.pool.try_recv()? {
                Some(envelope) => envelope,
                None => {
                    if self.submit_next()? {
                        continue;
                    }
                    if self.outstanding() == 0 {
                        return Ok(None);
                    }
                    self.pool.recv()?
                }
            };
            if envelope.round == self.round {
                return Ok(Some(envelope));
            }
            debug!(
                round = envelope.round,
                index = envelope.index,
                "Discarding outcome left over from an earlier round"
            );
        }
    }

    fn next_result(&mut self) -> Option<Result<Option<T>, PoolError>> {
        loop {
            if let Some(outcome) = self.buffer.as_mut().and_then(ResultBuffer::pop_next) {
                trace!(index = self.released, "Released buffered outcome");
                self.released += 1;
                return Some(outcome.resolve(self.ignore_errors));
            }

            if self.tasks.is_none() && self.released == self.submitted {
                debug!(round = self.round, released = self.released, "All results are received");
                return None;
            }

            let envelope = match self.next_envelope() {
                Ok(Some(envelope)) => envelope,
                Ok(None) => {
                    debug!(round = self.round, released = self.released, "All results are received");
                    return None;
                }
                Err(err) => return Some(Err(err)),
            };

            match self.buffer.as_mut() {
                Some(buffer) => {
                    trace!(
                        index = envelope.index,
                        waiting_for = buffer.next_index(),
                        "Buffering outcome"
                    );
                    buffer.insert(envelope.index, envelope.outcome);
                }
                None => {
                    self.released += 1;
                    return Some(envelope.outcome.resolve(self.ignore_errors));
                }
            }
        }
    }
}

impl<T> Inline<'_, T> {
    fn next_result(&mut self) -> Option<Result<Option<T>, PoolError>> {
        let task = self.tasks.next()?;
        self.released += 1;
        Some(task.run(&self.slot).map(Some).map_err(PoolError::Task))
    }
}

impl<T: Send + 'static> Iterator for Results<'_, T> {
    type Item = Result<Option<T>, PoolError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.halted {
            return None;
        }
        let item = match &mut self.inner {
            Inner::Pooled(dispatch) => dispatch.next_result(),
            Inner::Inline(inline) => inline.next_result(),
        };
        match &item {
            Some(Err(_)) | None => self.halted = true,
            Some(Ok(_)) => {}
        }
        item
    }
}

impl<T: Send + 'static> std::iter::FusedIterator for Results<'_, T> {}

impl<T: Send + 'static> fmt::Debug for Results<'_, T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Results")
            .field("submitted", &self.submitted())
            .field("released", &self.released())
            .field("buffered", &self.buffered())
            .field("halted", &self.halted)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_buffer_releases_in_index_order() {
        let mut buffer = ResultBuffer::new();
        buffer.insert(2, Outcome::Success("c"));
        buffer.insert(1, Outcome::Success("b"));
        assert!(buffer.pop_next().is_none());
        assert_eq!(buffer.len(), 2);

        buffer.insert(0, Outcome::Success("a"));
        assert_eq!(buffer.pop_next(), Some(Outcome::Success("a")));
        assert_eq!(buffer.pop_next(), Some(Outcome::Success("b")));
        assert_eq!(buffer.pop_next(), Some(Outcome::Success("c")));
        assert!(buffer.pop_next().is_none());
        assert!(buffer.is_empty());
        assert_eq!(buffer.next_index(), 3);
        assert_eq!(buffer.peak(), 3);
    }

    #[test]
    fn test_buffer_stays_empty_for_in_order_arrivals() {
        let mut buffer = ResultBuffer::new();
        for i in 0..5 {
            buffer.insert(i, Outcome::Success(i));
            assert_eq!(buffer.pop_next(), Some(Outcome::Success(i)));
        }
        assert_eq!(buffer.peak(), 1);
    }

    fn pool(workers: usize) -> DevicePool<usize> {
        let cfg = crate::config::ParallelConfig::new().with_workers_per_device(workers);
        let devices = cfg.devices().unwrap();
        DevicePool::new(&cfg, &devices, None).unwrap()
    }

    #[test]
    fn test_pooled_empty_round_ends() {
        let pool = pool(2);
        for preserve_order in [false, true] {
            let mut results = Results::pooled(&pool, 1, Vec::new(), preserve_order, false);
            assert!(results.next().is_none());
            assert_eq!(results.submitted(), 0);
        }
    }

    #[test]
    fn test_pooled_round_ends_after_fast_outcomes() {
        let pool = pool(4);
        for round in 1..=2_000 {
            let tasks = (0..2).map(|i| Task::from_fn(move || Ok(i)));
            let results = Results::pooled(&pool, round, tasks, round % 2 == 0, false);
            let collected: Result<Vec<_>, _> = results.collect();
            assert_eq!(collected.unwrap().len(), 2);
        }
    }

    #[test]
    fn test_inline_results_stop_after_error() {
        let tasks = vec![
            Task::from_fn(|| Ok(1)),
            Task::from_fn(|| Err(anyhow::anyhow!("broken"))),
            Task::from_fn(|| Ok(3)),
        ];
        let mut results = Results::inline(WorkerSlot::new(0, "cuda:0"), tasks);
        assert_eq!(results.next().unwrap().unwrap(), Some(1));
        let err = results.next().unwrap().unwrap_err();
        assert_eq!(err.to_string(), "broken");
        assert!(results.next().is_none());
        assert_eq!(results.released(), 2);
    }
}
