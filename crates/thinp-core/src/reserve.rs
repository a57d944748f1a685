//! Bounded reserve pools (§5, "Shared resources"): rather than emulating a
//! kernel mempool, each reserve is a counting semaphore sized at
//! construction time. Acquiring a permit is "allocation"; the permit is
//! freed back automatically when dropped.

use std::sync::Arc;

use tokio::sync::{OwnedSemaphorePermit, Semaphore, TryAcquireError};

/// A fixed-capacity reserve used to bound the number of cells or mapping
/// records in flight at once.
#[derive(Clone)]
pub struct ReservePool {
    semaphore: Arc<Semaphore>,
}

impl ReservePool {
    pub fn new(capacity: usize) -> Self {
        Self {
            semaphore: Arc::new(Semaphore::new(capacity)),
        }
    }

    /// Non-blocking acquisition for the hot path. Returns `None` if the
    /// reserve is exhausted; callers push back and retry rather than
    /// stalling a context that must not block.
    pub fn try_acquire(&self) -> Option<OwnedSemaphorePermit> {
        match Arc::clone(&self.semaphore).try_acquire_owned() {
            Ok(permit) => Some(permit),
            Err(TryAcquireError::NoPermits) => None,
            Err(TryAcquireError::Closed) => unreachable!("reserve pool semaphore is never closed"),
        }
    }

    /// Suspends the calling task until a permit is available. Only called
    /// from worker context, which is allowed to block (§5).
    pub async fn acquire(&self) -> OwnedSemaphorePermit {
        Arc::clone(&self.semaphore)
            .acquire_owned()
            .await
            .expect("reserve pool semaphore is never closed")
    }

    pub fn available(&self) -> usize {
        self.semaphore.available_permits()
    }
}
