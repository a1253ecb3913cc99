use std::sync::Arc;

use tokio::sync::{OwnedSemaphorePermit, Semaphore};

/// Bounded pool of external process units. Every running transcoder holds one
/// [`PoolPermit`]; the permit returns to the pool when dropped.
#[derive(Clone)]
pub struct ProcessPool {
    semaphore: Arc<Semaphore>,
    capacity: usize,
}

impl ProcessPool {
    pub fn new(capacity: usize) -> Self {
        Self {
            semaphore: Arc::new(Semaphore::new(capacity)),
            capacity,
        }
    }

    /// Non-blocking acquire, `None` when every unit is in use.
    pub fn try_acquire(&self) -> Option<PoolPermit> {
        self.semaphore
            .clone()
            .try_acquire_owned()
            .ok()
            .map(|permit| PoolPermit { _permit: permit })
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Units currently held by live processes.
    pub fn active(&self) -> usize {
        self.capacity - self.semaphore.available_permits()
    }
}

impl std::fmt::Debug for ProcessPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProcessPool")
            .field("capacity", &self.capacity)
            .field("active", &self.active())
            .finish()
    }
}

pub struct PoolPermit {
    _permit: OwnedSemaphorePermit,
}
