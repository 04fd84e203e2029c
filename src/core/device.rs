//! Device identities and the slot queue that binds workers to devices.

use std::fmt;

use crossbeam_channel::{bounded, Receiver, TryRecvError};
use serde::{Deserialize, Serialize};

/// Index of a worker inside its pool.
pub type WorkerId = usize;

/// Opaque identifier of a compute device, e.g. `cuda:3`.
///
/// The pool never checks that a device exists; it only hands the same
/// identifier to the initializer and every task of the bound worker.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DeviceId(String);

impl DeviceId {
    /// Wrap an arbitrary device name.
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    /// CUDA-style identifier for a device index (`cuda:{index}`).
    #[must_use]
    pub fn cuda(index: usize) -> Self {
        Self(format!("cuda:{index}"))
    }

    /// Borrow the identifier as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for DeviceId {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

impl From<String> for DeviceId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

/// Permanent `(worker_id, device_id)` binding of one worker.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct WorkerSlot {
    /// Worker index, unique within the pool.
    pub worker_id: WorkerId,
    /// Device the worker is bound to.
    pub device_id: DeviceId,
}

impl WorkerSlot {
    /// Build a slot.
    pub fn new(worker_id: WorkerId, device_id: impl Into<DeviceId>) -> Self {
        Self {
            worker_id,
            device_id: device_id.into(),
        }
    }
}

impl fmt::Display for WorkerSlot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "worker-{}({})", self.worker_id, self.device_id)
    }
}

/// Finite multiset of worker slots, filled once and drained by worker startup.
///
/// Clones share the same underlying queue. The sending half is dropped right
/// after filling, so a claim on an empty queue fails immediately instead of
/// waiting for a slot that can never arrive.
#[derive(Debug, Clone)]
pub struct DeviceQueue {
    slots: Receiver<WorkerSlot>,
    capacity: usize,
}

impl DeviceQueue {
    /// Fill the queue with `workers_per_device` slots per device.
    ///
    /// Device 0 receives worker ids `0..w`, device 1 receives `w..2w`, and so on.
    #[must_use]
    pub fn new(devices: &[DeviceId], workers_per_device: usize) -> Self {
        let capacity = devices.len() * workers_per_device;
        let (tx, rx) = bounded(capacity.max(1));
        for (device_idx, device_id) in devices.iter().enumerate() {
            for k in 0..workers_per_device {
                let worker_id = device_idx * workers_per_device + k;
                // Capacity matches the number of sends and the receiver is alive.
                let _ = tx.try_send(WorkerSlot::new(worker_id, device_id.clone()));
            }
        }
        drop(tx);
        Self { slots: rx, capacity }
    }

    /// Take one slot, or `None` if every slot has already been claimed.
    #[must_use]
    pub fn claim(&self) -> Option<WorkerSlot> {
        match self.slots.try_recv() {
            Ok(slot) => Some(slot),
            Err(TryRecvError::Empty | TryRecvError::Disconnected) => None,
        }
    }

    /// Slots not yet claimed.
    #[must_use]
    pub fn remaining(&self) -> usize {
        self.slots.len()
    }

    /// Number of slots the queue was filled with.
    #[must_use]
    pub const fn capacity(&self) -> usize {
        self.capacity
    }
}
