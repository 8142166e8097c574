use std::sync::atomic::Ordering;
use std::sync::Arc;

use tracing::{info, warn};

use tickgate_core::WorkerId;

use crate::kernel::ComputeKernel;
use crate::pool::PoolError;

use super::Scheduler;

impl<K: ComputeKernel> Scheduler<K> {
    /// Start the pressure sampler and, when a control source is configured,
    /// the config refresher. Must be called from within a Tokio runtime.
    /// Calling it again is a no-op.
    pub fn spawn_background(&self) {
        let mut background = self.background.lock().unwrap_or_else(|p| p.into_inner());
        if !background.is_empty() || *self.shutdown_tx.borrow() {
            return;
        }
        background.push(Arc::clone(&self.monitor).spawn(self.shutdown_tx.subscribe()));
        if let Some(refresher) = &self.refresher {
            background.push(Arc::clone(refresher).spawn(self.shutdown_tx.subscribe()));
        }
        info!(tasks = background.len(), "Background tasks started");
    }

    pub fn add_worker(&self) -> Result<WorkerId, PoolError> {
        self.pool.add_worker()
    }

    /// Gracefully remove a worker; its queued items move to the new shard owners.
    pub fn remove_worker(&self, id: WorkerId) -> Result<(), PoolError> {
        self.pool.remove_worker(id)
    }

    pub fn is_accepting(&self) -> bool {
        self.accepting.load(Ordering::Acquire)
    }

    /// Stop admission, fail every queued item with `shutting_down`, let
    /// running items finish, then stop background tasks and join workers.
    pub async fn shutdown(&self) {
        if !self.accepting.swap(false, Ordering::AcqRel) {
            return;
        }
        info!("Scheduler shutdown requested");
        self.shutdown_tx.send_replace(true);
        self.pool.shutdown();

        let tasks: Vec<_> = std::mem::take(&mut *self.background.lock().unwrap_or_else(|p| p.into_inner()));
        for task in tasks {
            if let Err(e) = task.await {
                warn!(error = %e, "Background task ended abnormally");
            }
        }

        let pool = self.pool.clone();
        if let Err(e) = tokio::task::spawn_blocking(move || pool.join()).await {
            warn!(error = %e, "Worker join failed");
        }
        info!("Scheduler stopped");
    }
}
