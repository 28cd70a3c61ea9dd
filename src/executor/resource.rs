//! Capacity-limited shared resources.

use std::sync::Arc;

use tokio::sync::{OwnedSemaphorePermit, Semaphore};

use crate::limits::LimitTracker;
use crate::{EvalError, Result};

/// A pool of interchangeable slots shared by all samples, e.g. sandbox
/// containers. Time spent queueing for a slot is accounted as a wait on the
/// pool's name.
#[derive(Debug, Clone)]
pub struct ResourcePool {
    name: Arc<str>,
    slots: Arc<Semaphore>,
}

impl ResourcePool {
    pub fn new(name: impl Into<String>, capacity: usize) -> Self {
        Self {
            name: Arc::from(name.into()),
            slots: Arc::new(Semaphore::new(capacity)),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Slots free right now.
    pub fn available(&self) -> usize {
        self.slots.available_permits()
    }

    /// Wait for a slot. The slot returns to the pool when the permit drops.
    pub async fn acquire(&self, tracker: &LimitTracker) -> Result<OwnedSemaphorePermit> {
        tracker
            .wait_for(self.name.as_ref(), self.slots.clone().acquire_owned())
            .await
            .map_err(|_| EvalError::Sandbox {
                message: format!("resource pool '{}' is closed", self.name),
                transient: false,
            })
    }

    /// Permanently close the pool; pending and future acquisitions fail.
    pub fn close(&self) {
        self.slots.close();
    }
}
