//! Counting guard over the execution resources of a worker, e.g. simulators or devices.

use std::sync::Arc;

use thiserror::Error;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ResourceError {
    #[error("requested {requested} units of a resource guard with only {total}")]
    MoreThanTotal { requested: usize, total: usize },
    #[error("resource guard is closed")]
    Closed,
}

#[derive(Clone)]
pub struct ResourceGuard {
    semaphore: Arc<Semaphore>,
    total: usize,
}

/// Units held from a [ResourceGuard]; returned to it on drop.
#[must_use]
pub struct ResourceUnits {
    permit: OwnedSemaphorePermit,
}

impl ResourceUnits {
    pub fn units(&self) -> usize {
        self.permit.num_permits()
    }
}

impl ResourceGuard {
    pub fn new(total: usize) -> Self {
        Self {
            semaphore: Arc::new(Semaphore::new(total)),
            total,
        }
    }

    pub fn total(&self) -> usize {
        self.total
    }

    pub fn available(&self) -> usize {
        self.semaphore.available_permits()
    }

    /// Waits until `units` units are free and takes them all at once.
    pub async fn acquire(&self, units: usize) -> Result<ResourceUnits, ResourceError> {
        if units > self.total {
            return Err(ResourceError::MoreThanTotal {
                requested: units,
                total: self.total,
            });
        }
        let units = u32::try_from(units).map_err(|_| ResourceError::MoreThanTotal {
            requested: units,
            total: self.total,
        })?;

        let permit = self
            .semaphore
            .clone()
            .acquire_many_owned(units)
            .await
            .map_err(|_| ResourceError::Closed)?;
        Ok(ResourceUnits { permit })
    }

    /// Refuses all pending and future acquisitions.
    pub fn close(&self) {
        self.semaphore.close();
    }
}
