use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::oneshot;
use tracing::{debug, trace};

use tickgate_core::{Priority, WorkId, WorkItem, WorkerId};

use crate::budget::BudgetPermit;
use crate::error::{CapacityReason, ScheduleError, TimeoutPhase};
use crate::kernel::ComputeKernel;
use crate::pool::{Completion, Enqueue, Job, JobResult};
use crate::scheduler::metrics::AdmissionCounters;
use crate::shedder::Admission;

use super::Scheduler;

/// Retry pause while a shard is being moved.
const BUSY_RETRY: Duration = Duration::from_micros(200);
/// Upper bound on one wait for queue space before re-resolving the route.
const FULL_RECHECK: Duration = Duration::from_millis(50);

/// Handle to an accepted work item. Resolves to exactly one outcome.
#[derive(Debug)]
pub struct WorkHandle<T> {
    id: WorkId,
    worker: WorkerId,
    rx: oneshot::Receiver<JobResult<T>>,
    counters: Arc<AdmissionCounters>,
}

impl<T> WorkHandle<T> {
    pub fn id(&self) -> WorkId {
        self.id
    }

    /// Worker the item was queued on. It may still be stolen or moved.
    pub fn worker(&self) -> WorkerId {
        self.worker
    }

    pub async fn wait(self) -> Result<Completion<T>, ScheduleError> {
        let WorkHandle {
            worker,
            rx,
            counters,
            ..
        } = self;
        let result = rx.await.unwrap_or_else(|_| Err(closed(worker)));
        record(&counters, &result);
        result
    }

    /// Wait from a synchronous context. Must not be called on a runtime thread.
    pub fn blocking_wait(self) -> Result<Completion<T>, ScheduleError> {
        let WorkHandle {
            worker,
            rx,
            counters,
            ..
        } = self;
        let result = rx.blocking_recv().unwrap_or_else(|_| Err(closed(worker)));
        record(&counters, &result);
        result
    }
}

fn closed(worker: WorkerId) -> ScheduleError {
    ScheduleError::WorkerFailure {
        worker,
        message: "result channel closed".into(),
    }
}

fn record<T>(counters: &AdmissionCounters, result: &JobResult<T>) {
    match result {
        Ok(_) => counters.record_completed(),
        Err(e) => counters.record_failure(e),
    }
}

impl<K: ComputeKernel> Scheduler<K> {
    /// Admit `item` and place it on its shard owner's queue.
    ///
    /// Admission failures (`no_capacity`, `budget_exceeded`, `shed_*`,
    /// admission `timeout`, `shutting_down`) are returned here and the item
    /// is never queued. Once a handle is returned the item will produce
    /// exactly one outcome through it.
    pub async fn submit(&self, item: WorkItem<K::Payload>) -> Result<WorkHandle<K::Output>, ScheduleError> {
        self.counters.record_submitted();
        let result = self.admit_and_enqueue(item).await;
        if let Err(e) = &result {
            self.counters.record_failure(e);
        }
        result
    }

    /// Submit and wait for the outcome.
    pub async fn execute(&self, item: WorkItem<K::Payload>) -> Result<Completion<K::Output>, ScheduleError> {
        self.submit(item).await?.wait().await
    }

    async fn admit_and_enqueue(&self, mut item: WorkItem<K::Payload>) -> Result<WorkHandle<K::Output>, ScheduleError> {
        if !self.accepting.load(Ordering::Acquire) {
            return Err(ScheduleError::ShuttingDown);
        }
        item.cap_deadline(self.budget.current_config().max_processing_time());

        // No workers: fail fast before counting against the budget.
        self.pool.partitioner().shard_for(&item.affinity_key)?;

        let permit = self.admit(item.priority, item.deadline).await?;
        self.enqueue(item, permit).await
    }

    /// Run the shedder, honouring `Delayed` up to `max_delay_rounds` times.
    async fn admit(&self, priority: Priority, deadline: Option<Instant>) -> Result<BudgetPermit, ScheduleError> {
        let max_rounds = self.shedder.config().max_delay_rounds;
        let mut round = 0;
        loop {
            let now = Instant::now();
            if deadline.is_some_and(|d| now >= d) {
                return Err(ScheduleError::Timeout {
                    phase: TimeoutPhase::Admission,
                });
            }
            match self.shedder.admit_round(priority, round) {
                Admission::Admitted(permit) => return Ok(permit),
                Admission::Rejected(reason) => return Err(reason.into()),
                Admission::Delayed(delay) => {
                    if round >= max_rounds {
                        return Err(self.shedder.record_heavy_shed(priority).into());
                    }
                    round += 1;
                    let pause = deadline
                        .map(|d| d.saturating_duration_since(now))
                        .map_or(delay, |left| left.min(delay));
                    tokio::time::sleep(pause).await;
                }
            }
        }
    }

    /// Place the job, waiting for space when the owner's queue is full.
    async fn enqueue(
        &self,
        item: WorkItem<K::Payload>,
        permit: BudgetPermit,
    ) -> Result<WorkHandle<K::Output>, ScheduleError> {
        let id = item.id;
        let deadline = item.deadline;
        let (mut job, rx) = Job::new(item, Some(permit));

        loop {
            job = match self.pool.try_enqueue(job) {
                Enqueue::Queued { worker } => {
                    self.counters.record_accepted();
                    trace!(%id, worker, "Work item queued");
                    return Ok(WorkHandle {
                        id,
                        worker,
                        rx,
                        counters: Arc::clone(&self.counters),
                    });
                }
                Enqueue::NoCapacity(_) => {
                    return Err(ScheduleError::CapacityRejected(CapacityReason::NoWorkers));
                }
                Enqueue::Full { worker, job } => {
                    self.monitor.record_queue_full();
                    debug!(%id, worker, "Worker queue full, waiting for space");
                    let wait = deadline
                        .map(|d| d.saturating_duration_since(Instant::now()))
                        .map_or(FULL_RECHECK, |left| left.min(FULL_RECHECK));
                    let _ = tokio::time::timeout(wait, self.pool.space_on(worker)).await;
                    job
                }
                Enqueue::Busy(job) => {
                    if self.pool.is_shut_down() {
                        return Err(ScheduleError::ShuttingDown);
                    }
                    tokio::time::sleep(BUSY_RETRY).await;
                    job
                }
            };
            if job.is_expired(Instant::now()) {
                return Err(ScheduleError::Timeout {
                    phase: TimeoutPhase::Admission,
                });
            }
        }
    }
}
