//! Intake queues that carry jobs from the submitter to the worker threads.
//!
//! Both engines are unbounded multi-consumer queues: submission never blocks,
//! and dropping the last sender lets idle workers drain and exit.

use crate::config::EngineKind;

/// Sending half of the intake queue.
pub(crate) enum IntakeSender<J> {
    Crossbeam(crossbeam_channel::Sender<J>),
    Flume(flume::Sender<J>),
}

/// Receiving half of the intake queue, cloned into every worker.
pub(crate) enum IntakeReceiver<J> {
    Crossbeam(crossbeam_channel::Receiver<J>),
    Flume(flume::Receiver<J>),
}

impl<J> Clone for IntakeReceiver<J> {
    fn clone(&self) -> Self {
        match self {
            Self::Crossbeam(rx) => Self::Crossbeam(rx.clone()),
            Self::Flume(rx) => Self::Flume(rx.clone()),
        }
    }
}

/// Open an unbounded intake queue on the selected engine.
pub(crate) fn intake<J>(kind: EngineKind) -> (IntakeSender<J>, IntakeReceiver<J>) {
    match kind {
        EngineKind::Crossbeam => {
            let (tx, rx) = crossbeam_channel::unbounded();
            (IntakeSender::Crossbeam(tx), IntakeReceiver::Crossbeam(rx))
        }
        EngineKind::Flume => {
            let (tx, rx) = flume::unbounded();
            (IntakeSender::Flume(tx), IntakeReceiver::Flume(rx))
        }
    }
}

impl<J> IntakeSender<J> {
    /// Hand a job to whichever worker picks it up first.
    ///
    /// Gives the job back if every worker has hung up.
    pub fn send(&self, job: J) -> Result<(), J> {
        match self {
            Self::Crossbeam(tx) => tx.send(job).map_err(|e| e.into_inner()),
            Self::Flume(tx) => tx.send(job).map_err(|e| e.into_inner()),
        }
    }
}

impl<J> IntakeReceiver<J> {
    /// Block until a job arrives, or return `None` once the queue is closed and drained.
    pub fn recv(&self) -> Option<J> {
        match self {
            Self::Crossbeam(rx) => rx.recv().ok(),
            Self::Flume(rx) => rx.recv().ok(),
        }
    }
}
