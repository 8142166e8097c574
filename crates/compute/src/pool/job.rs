use std::time::{Duration, Instant};

use tokio::sync::oneshot;

use tickgate_core::{Priority, ShardId, WorkId, WorkItem, WorkerId};

use crate::budget::BudgetPermit;
use crate::error::ScheduleError;

/// Successful execution, with where and how it ran.
#[derive(Debug)]
pub struct Completion<T> {
    pub output: T,
    pub worker: WorkerId,
    /// Executed by a worker other than the shard owner at enqueue time.
    pub stolen: bool,
    pub queue_wait: Duration,
    pub execution: Duration,
}

pub(crate) type JobResult<T> = Result<Completion<T>, ScheduleError>;

/// An admitted item travelling through the pool.
///
/// Exactly one outcome is delivered: either through [`Job::succeed`] /
/// [`Job::fail`] or, if the job is dropped unresolved, as a
/// `worker_failure` from `Drop`.
pub(crate) struct Job<P, T> {
    pub id: WorkId,
    pub affinity_key: String,
    pub priority: Priority,
    pub shard: ShardId,
    pub worker: WorkerId,
    pub stolen: bool,
    pub enqueued_at: Instant,
    pub deadline: Option<Instant>,
    payload: Option<P>,
    reply: Option<oneshot::Sender<JobResult<T>>>,
    /// Released just before the outcome is delivered.
    permit: Option<BudgetPermit>,
}

impl<P, T> Job<P, T> {
    pub fn new(item: WorkItem<P>, permit: Option<BudgetPermit>) -> (Self, oneshot::Receiver<JobResult<T>>) {
        let (tx, rx) = oneshot::channel();
        let WorkItem {
            id,
            affinity_key,
            priority,
            payload,
            enqueued_at,
            deadline,
            ..
        } = item;
        let job = Self {
            id,
            affinity_key,
            priority,
            shard: 0,
            worker: 0,
            stolen: false,
            enqueued_at,
            deadline,
            payload: Some(payload),
            reply: Some(tx),
            permit,
        };
        (job, rx)
    }

    pub fn is_expired(&self, now: Instant) -> bool {
        self.deadline.map(|d| now >= d).unwrap_or(false)
    }

    pub fn take_payload(&mut self) -> Option<P> {
        self.payload.take()
    }

    pub fn succeed(mut self, completion: Completion<T>) {
        self.deliver(Ok(completion));
    }

    pub fn fail(mut self, err: ScheduleError) {
        self.deliver(Err(err));
    }

    fn deliver(&mut self, result: JobResult<T>) {
        drop(self.permit.take());
        if let Some(reply) = self.reply.take() {
            // The submitter may have dropped its handle; nothing to do then.
            let _ = reply.send(result);
        }
    }
}

impl<P, T> Drop for Job<P, T> {
    fn drop(&mut self) {
        if self.reply.is_some() {
            let worker = self.worker;
            self.deliver(Err(ScheduleError::WorkerFailure {
                worker,
                message: "work item dropped without a result".into(),
            }));
        }
    }
}
