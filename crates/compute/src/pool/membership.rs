use std::sync::atomic::Ordering;
use std::sync::mpsc;
use std::sync::{Arc, MutexGuard, TryLockError, Weak};
use std::time::{Duration, Instant};

use tracing::{debug, error, info, warn};

use tickgate_core::WorkerId;

use crate::error::{CapacityReason, ScheduleError};
use crate::kernel::ComputeKernel;
use crate::partition::{RebalanceProposal, ShardMove};

use super::{worker, PoolError, PoolJob, PoolShared, WorkerSlot};

/// Poll interval while waiting for a shard's running items to finish.
const DRAIN_POLL: Duration = Duration::from_micros(200);

fn lock_membership<K: ComputeKernel>(shared: &PoolShared<K>) -> MutexGuard<'_, ()> {
    shared.membership.lock().unwrap_or_else(|p| p.into_inner())
}

// ── Join ──────────────────────────────────────────────────────

pub(super) fn add_worker<K: ComputeKernel>(shared: &Arc<PoolShared<K>>) -> Result<WorkerId, PoolError> {
    let _membership = lock_membership(shared);
    spawn_worker(shared)
}

/// Start a worker thread, register it and hand it its shards. Callers hold
/// the membership lock.
fn spawn_worker<K: ComputeKernel>(shared: &Arc<PoolShared<K>>) -> Result<WorkerId, PoolError> {
    let id = shared.next_id.fetch_add(1, Ordering::Relaxed);
    let slot = Arc::new(WorkerSlot::new(id, shared.config.queue_capacity));

    let handle = {
        let shared = Arc::clone(shared);
        let slot = Arc::clone(&slot);
        std::thread::Builder::new()
            .name(format!("tickgate-worker-{id}"))
            .spawn(move || worker::run(shared, slot))?
    };
    shared
        .threads
        .lock()
        .unwrap_or_else(|p| p.into_inner())
        .push(handle);

    shared
        .workers
        .write()
        .unwrap_or_else(|p| p.into_inner())
        .insert(id, Arc::clone(&slot));

    let moves = shared.partitioner.join(id);
    let taken = moves.len();
    for mv in moves {
        let from = mv.from.and_then(|w| shared.slot(w));
        migrate(shared, mv, from.as_deref());
    }
    info!(worker = id, shards = taken, "Worker joined");
    Ok(id)
}

// ── Leave ─────────────────────────────────────────────────────

pub(super) fn remove_worker<K: ComputeKernel>(shared: &Arc<PoolShared<K>>, id: WorkerId) -> Result<(), PoolError> {
    let _membership = lock_membership(shared);
    let slot = shared.slot(id).ok_or(PoolError::UnknownWorker(id))?;
    detach(shared, &slot);
    info!(worker = id, "Worker removed");
    Ok(())
}

/// Called from a worker thread whose kernel panicked. The failing item has
/// already been reported; the worker's shards and queue are redistributed
/// and, if configured, a replacement is started.
pub(super) fn retire<K: ComputeKernel>(shared: &Arc<PoolShared<K>>, id: WorkerId, reason: &str) {
    shared.counters.worker_failures.fetch_add(1, Ordering::Relaxed);
    let _membership = lock_membership(shared);
    let Some(slot) = shared.slot(id) else {
        return;
    };
    error!(worker = id, reason, "Worker failed, redistributing its shards");
    detach(shared, &slot);

    if shared.config.respawn_on_failure && !shared.shutdown.load(Ordering::Acquire) {
        match spawn_worker(shared) {
            Ok(replacement) => {
                shared.counters.respawns.fetch_add(1, Ordering::Relaxed);
                info!(failed = id, replacement, "Replacement worker started");
            }
            Err(e) => error!(failed = id, error = %e, "Could not start replacement worker"),
        }
    }
}

/// Take `slot` out of routing: reassign its shards (moving their queued
/// items), close its queue and re-route whatever it still held.
fn detach<K: ComputeKernel>(shared: &PoolShared<K>, slot: &WorkerSlot<K>) {
    let moves = shared.partitioner.leave(slot.id);
    shared
        .workers
        .write()
        .unwrap_or_else(|p| p.into_inner())
        .remove(&slot.id);

    for mv in moves {
        migrate(shared, mv, Some(slot));
    }

    let leftovers = slot.queue.close();
    if !leftovers.is_empty() {
        debug!(worker = slot.id, items = leftovers.len(), "Re-routing stolen work from departing worker");
    }
    for job in leftovers {
        reroute(shared, job);
    }
    shared.steals.forget_worker(slot.id);
}

/// Move one shard, with its queued items from `from`, under the shard lock.
fn migrate<K: ComputeKernel>(shared: &PoolShared<K>, mv: ShardMove, from: Option<&WorkerSlot<K>>) {
    let mut orphans = Vec::new();
    {
        let mut lock = shared.partitioner.lock_shard(mv.shard);
        let mut moved = from
            .map(|f| f.queue.extract(|job| job.shard == mv.shard))
            .unwrap_or_default();
        let target = mv.to.and_then(|w| shared.slot(w));
        match target {
            Some(to) => {
                for job in &mut moved {
                    job.worker = to.id;
                }
                if let Err(back) = to.queue.push_all(moved) {
                    orphans.extend(back);
                }
            }
            None => orphans.extend(moved),
        }
        lock.assign(mv.to);
    }
    for job in orphans {
        reroute(shared, job);
    }
}

/// Deliver a displaced job to its shard's current owner, or fail it.
/// Must not be called while holding any shard lock.
pub(super) fn reroute<K: ComputeKernel>(shared: &PoolShared<K>, mut job: PoolJob<K>) {
    if shared.shutdown.load(Ordering::Acquire) {
        job.fail(ScheduleError::ShuttingDown);
        return;
    }
    let route = match shared.partitioner.route(&job.affinity_key) {
        Ok(route) => route,
        Err(_) => {
            job.fail(ScheduleError::CapacityRejected(CapacityReason::NoWorkers));
            return;
        }
    };
    let Some(slot) = shared.slot(route.worker) else {
        let worker = route.worker;
        drop(route);
        job.fail(ScheduleError::WorkerFailure {
            worker,
            message: "shard owner is no longer registered".into(),
        });
        return;
    };
    job.shard = route.shard;
    job.worker = slot.id;
    if let Err(back) = slot.queue.push_all(vec![job]) {
        for job in back {
            job.fail(ScheduleError::WorkerFailure {
                worker: slot.id,
                message: "shard owner is retiring".into(),
            });
        }
    }
    drop(route);
}

// ── Rebalance ─────────────────────────────────────────────────

pub(super) fn spawn_rebalancer<K: ComputeKernel>(
    shared: &Arc<PoolShared<K>>,
    rx: mpsc::Receiver<RebalanceProposal>,
) -> Result<(), PoolError> {
    let weak: Weak<PoolShared<K>> = Arc::downgrade(shared);
    let handle = std::thread::Builder::new()
        .name("tickgate-rebalancer".into())
        .spawn(move || {
            while let Ok(proposal) = rx.recv() {
                let Some(shared) = weak.upgrade() else {
                    break;
                };
                rebalance(&shared, proposal);
            }
            debug!("Rebalancer stopped");
        })?;
    shared
        .threads
        .lock()
        .unwrap_or_else(|p| p.into_inner())
        .push(handle);
    Ok(())
}

pub(super) fn propose_rebalance<K: ComputeKernel>(shared: &PoolShared<K>, proposal: RebalanceProposal) {
    if let Some(tx) = shared
        .rebalance_tx
        .lock()
        .unwrap_or_else(|p| p.into_inner())
        .as_ref()
    {
        let _ = tx.send(proposal);
    }
}

/// Move a repeatedly stolen shard to its thief. Skipped when a membership
/// change is in progress; aborted if the shard's running items do not
/// finish within the drain timeout.
pub(super) fn rebalance<K: ComputeKernel>(shared: &PoolShared<K>, proposal: RebalanceProposal) {
    let _membership = match shared.membership.try_lock() {
        Ok(guard) => guard,
        Err(TryLockError::Poisoned(p)) => p.into_inner(),
        Err(TryLockError::WouldBlock) => {
            debug!(shard = proposal.shard, "Rebalance skipped: membership change in progress");
            return;
        }
    };
    let Some(thief) = shared.slot(proposal.to) else {
        return;
    };

    let mut lock = shared.partitioner.lock_shard(proposal.shard);
    let Some(owner) = lock.owner() else {
        return;
    };
    if owner == proposal.to {
        return;
    }

    let deadline = Instant::now() + shared.config.rebalance_drain_timeout();
    while lock.running() > 0 {
        if Instant::now() >= deadline {
            shared.counters.rebalances_aborted.fetch_add(1, Ordering::Relaxed);
            warn!(
                shard = proposal.shard,
                from = owner,
                to = proposal.to,
                running = lock.running(),
                "Rebalance aborted: shard did not drain"
            );
            return;
        }
        std::thread::sleep(DRAIN_POLL);
    }

    let mut moved = shared
        .slot(owner)
        .map(|from| from.queue.extract(|job| job.shard == proposal.shard))
        .unwrap_or_default();
    for job in &mut moved {
        job.worker = thief.id;
    }
    let count = moved.len();
    let mut orphans = Vec::new();
    if let Err(back) = thief.queue.push_all(moved) {
        orphans.extend(back);
    }
    lock.assign(Some(proposal.to));
    drop(lock);

    shared.steals.forget(proposal.shard);
    shared.counters.rebalances.fetch_add(1, Ordering::Relaxed);
    info!(
        shard = proposal.shard,
        from = owner,
        to = proposal.to,
        moved = count,
        "Shard rebalanced to thief"
    );
    for job in orphans {
        reroute(shared, job);
    }
}

// ── Shutdown ──────────────────────────────────────────────────

pub(super) fn shutdown<K: ComputeKernel>(shared: &PoolShared<K>) {
    if shared.shutdown.swap(true, Ordering::AcqRel) {
        return;
    }
    shared
        .rebalance_tx
        .lock()
        .unwrap_or_else(|p| p.into_inner())
        .take();

    let mut failed = 0usize;
    for slot in shared.slots() {
        for job in slot.queue.close() {
            job.fail(ScheduleError::ShuttingDown);
            failed += 1;
        }
    }
    info!(failed_queued = failed, "Worker pool shutting down");
}
