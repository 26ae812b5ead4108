// Admission gate: a fixed number of in-flight submissions plus a bounded
// number of callers allowed to wait for a slot.
use crate::error::{ExecutorError, Result};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

#[derive(Debug, Clone)]
pub struct Admission {
    permits: Arc<Semaphore>,
    max_workers: usize,
    max_queued: usize,
    waiting: Arc<AtomicUsize>,
}

/// Held for the lifetime of one submission
#[derive(Debug)]
pub struct AdmissionPermit {
    _permit: OwnedSemaphorePermit,
}

/// Decrements the waiter count however the wait ends
struct WaitSlot<'a>(&'a AtomicUsize);

impl Drop for WaitSlot<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

impl Admission {
    pub fn new(max_workers: usize, max_queued: usize) -> Self {
        let max_workers = max_workers.max(1);
        Self {
            permits: Arc::new(Semaphore::new(max_workers)),
            max_workers,
            max_queued,
            waiting: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Take a slot, waiting if the queue has room; Overloaded otherwise
    pub async fn admit(&self) -> Result<AdmissionPermit> {
        if let Ok(permit) = self.permits.clone().try_acquire_owned() {
            return Ok(AdmissionPermit { _permit: permit });
        }

        let queued = self.waiting.fetch_add(1, Ordering::SeqCst);
        let _slot = WaitSlot(&self.waiting);
        if queued >= self.max_queued {
            return Err(ExecutorError::Overloaded(format!(
                "{} submissions running and {} waiting",
                self.max_workers, queued
            )));
        }
        self.acquire_inner().await
    }

    /// Wait for a slot with no queue bound; used by the queue consumer,
    /// whose backlog lives in Redis.
    pub async fn acquire(&self) -> Result<AdmissionPermit> {
        self.acquire_inner().await
    }

    async fn acquire_inner(&self) -> Result<AdmissionPermit> {
        let permit = self
            .permits
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| ExecutorError::Internal("admission gate closed".into()))?;
        Ok(AdmissionPermit { _permit: permit })
    }

    pub fn available(&self) -> usize {
        self.permits.available_permits()
    }

    pub fn in_flight(&self) -> usize {
        self.max_workers - self.permits.available_permits()
    }

    pub fn waiting(&self) -> usize {
        self.waiting.load(Ordering::SeqCst)
    }
}
