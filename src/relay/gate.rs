use std::sync::Arc;

use tokio::{
    sync::{OwnedSemaphorePermit, Semaphore},
    time::Instant,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("at capacity")]
pub struct AtCapacity;

/// Bounds the number of in-flight jobs. Admission never waits: a full gate
/// rejects immediately.
#[derive(Clone)]
pub struct AdmissionGate {
    semaphore: Arc<Semaphore>,
    capacity: usize,
}

impl AdmissionGate {
    pub fn new(capacity: usize) -> Self {
        Self {
            semaphore: Arc::new(Semaphore::new(capacity)),
            capacity,
        }
    }

    pub fn try_admit(&self) -> Result<Slot, AtCapacity> {
        let permit = self
            .semaphore
            .clone()
            .try_acquire_owned()
            .map_err(|_| AtCapacity)?;
        Ok(Slot {
            _permit: permit,
            acquired_at: Instant::now(),
        })
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Slots admitted and not yet released.
    pub fn in_flight(&self) -> usize {
        self.capacity - self.semaphore.available_permits()
    }
}

/// One unit of admission capacity. Releasing consumes the slot, and dropping
/// an unreleased slot releases it, so a slot is returned exactly once.
pub struct Slot {
    _permit: OwnedSemaphorePermit,
    acquired_at: Instant,
}

impl Slot {
    pub fn acquired_at(&self) -> Instant {
        self.acquired_at
    }

    pub fn release(self) {}
}

#[cfg(test)]
#[path = "gate_test.rs"]
mod gate_test;
