//! Bounded concurrency for sandboxed subprocesses.

use std::sync::Arc;

use tokio::sync::{OwnedSemaphorePermit, Semaphore};

use crate::error::{Error, Result};

/// Caps the number of toolchain processes running at once.
///
/// Waiters are admitted in arrival order: `tokio::sync::Semaphore` is fair, so
/// a later request never overtakes an earlier one.
#[derive(Debug, Clone)]
pub struct ExecutionLimiter {
    semaphore: Arc<Semaphore>,
    slots: usize,
}

/// A held execution slot. Dropping it frees the slot.
#[derive(Debug)]
pub struct ExecutionSlot {
    _permit: OwnedSemaphorePermit,
}

impl ExecutionLimiter {
    /// Creates a limiter with `slots` concurrent executions (at least one).
    pub fn new(slots: usize) -> Self {
        let slots = slots.max(1);
        Self {
            semaphore: Arc::new(Semaphore::new(slots)),
            slots,
        }
    }

    /// Waits for a free slot.
    pub async fn acquire(&self) -> Result<ExecutionSlot> {
        let permit = Arc::clone(&self.semaphore)
            .acquire_owned()
            .await
            .map_err(|_| Error::Internal("execution limiter closed".to_string()))?;

        Ok(ExecutionSlot { _permit: permit })
    }

    /// Returns the configured number of slots.
    pub fn slots(&self) -> usize {
        self.slots
    }

    /// Returns the number of free slots.
    pub fn available(&self) -> usize {
        self.semaphore.available_permits()
    }
}
