use std::any::Any;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Instant;

use rand::seq::SliceRandom;
use tracing::{debug, error, trace};

use crate::error::{ScheduleError, TimeoutPhase};
use crate::kernel::{ComputeKernel, KernelContext};

use super::job::Completion;
use super::membership;
use super::{PoolJob, PoolShared, WorkerSlot};

enum Outcome {
    Continue,
    Panicked(String),
}

/// Worker thread body: drain own queue, then steal, then park.
pub(super) fn run<K: ComputeKernel>(shared: Arc<PoolShared<K>>, slot: Arc<WorkerSlot<K>>) {
    debug!(worker = slot.id, "Worker started");
    let park = shared.config.idle_park();
    loop {
        slot.heartbeat(shared.epoch);

        if let Some(job) = slot.queue.pop() {
            if let Outcome::Panicked(message) = execute(&shared, &slot, job) {
                membership::retire(&shared, slot.id, &message);
                return;
            }
            continue;
        }

        if slot.queue.is_closed() {
            break;
        }

        if steal_into(&shared, &slot) {
            continue;
        }

        slot.queue.park(park);
    }
    debug!(worker = slot.id, "Worker stopped");
}

fn execute<K: ComputeKernel>(shared: &PoolShared<K>, slot: &WorkerSlot<K>, mut job: PoolJob<K>) -> Outcome {
    let dequeued = Instant::now();
    if job.is_expired(dequeued) {
        shared.counters.timeouts_at_dequeue.fetch_add(1, Ordering::Relaxed);
        debug!(worker = slot.id, id = %job.id, "Deadline expired before execution");
        job.fail(ScheduleError::Timeout {
            phase: TimeoutPhase::Queued,
        });
        return Outcome::Continue;
    }
    let Some(payload) = job.take_payload() else {
        job.fail(ScheduleError::WorkerFailure {
            worker: slot.id,
            message: "work item has no payload".into(),
        });
        return Outcome::Continue;
    };

    shared.partitioner.begin_execution(job.shard);
    slot.in_flight.fetch_add(1, Ordering::AcqRel);

    let ctx = KernelContext {
        worker: slot.id,
        affinity_key: &job.affinity_key,
        deadline: job.deadline,
        shutdown: &shared.shutdown,
        breakers: &shared.breakers,
    };
    let result = catch_unwind(AssertUnwindSafe(|| shared.kernel.execute(payload, &ctx)));
    let finished = Instant::now();
    let execution = finished.duration_since(dequeued);

    slot.in_flight.fetch_sub(1, Ordering::AcqRel);
    shared.partitioner.end_execution(job.shard);
    slot.executed.fetch_add(1, Ordering::Relaxed);

    match result {
        Ok(Ok(output)) => {
            if job.is_expired(finished) {
                job.fail(ScheduleError::Timeout {
                    phase: TimeoutPhase::Execution,
                });
                return Outcome::Continue;
            }
            shared
                .execution
                .lock()
                .unwrap_or_else(|p| p.into_inner())
                .record_execution(job.priority, execution);
            trace!(worker = slot.id, shard = job.shard, ?execution, "Item completed");
            let completion = Completion {
                output,
                worker: slot.id,
                stolen: job.stolen,
                queue_wait: dequeued.saturating_duration_since(job.enqueued_at),
                execution,
            };
            job.succeed(completion);
            Outcome::Continue
        }
        Ok(Err(err)) => {
            slot.failed.fetch_add(1, Ordering::Relaxed);
            job.fail(ScheduleError::from_kernel(err));
            Outcome::Continue
        }
        Err(panic) => {
            slot.failed.fetch_add(1, Ordering::Relaxed);
            let message = panic_message(panic.as_ref());
            error!(worker = slot.id, shard = job.shard, %message, "Kernel panicked");
            job.fail(ScheduleError::WorkerFailure {
                worker: slot.id,
                message: message.clone(),
            });
            Outcome::Panicked(message)
        }
    }
}

/// Scan peers in random order and move one batch from the first that has
/// spare work onto this worker's queue.
fn steal_into<K: ComputeKernel>(shared: &PoolShared<K>, slot: &WorkerSlot<K>) -> bool {
    let mut peers: Vec<_> = shared
        .slots()
        .into_iter()
        .filter(|peer| peer.id != slot.id)
        .collect();
    peers.shuffle(&mut rand::thread_rng());

    for peer in peers {
        let mut batch = peer.queue.steal(shared.config.steal_batch.max(1));
        if batch.is_empty() {
            continue;
        }
        for job in &mut batch {
            job.stolen = true;
            job.worker = slot.id;
        }
        let shards = batch.iter().map(|job| job.shard);
        for proposal in shared.steals.record_batch(shards, slot.id, Instant::now()) {
            membership::propose_rebalance(shared, proposal);
        }
        let taken = batch.len();
        slot.stolen.fetch_add(taken as u64, Ordering::Relaxed);
        trace!(thief = slot.id, victim = peer.id, taken, "Stole work");
        if let Err(batch) = slot.queue.push_all(batch) {
            // This worker is retiring; send the batch back through routing.
            for job in batch {
                membership::reroute(shared, job);
            }
        }
        return true;
    }
    false
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "worker panicked".to_string()
    }
}
