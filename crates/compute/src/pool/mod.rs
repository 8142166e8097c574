//! Work-stealing worker pool.
//!
//! Each worker is an OS thread owning one bounded local queue. Work is
//! enqueued to the worker owning the item's shard; idle workers steal small
//! batches from the back of busy peers. Membership changes and steal-driven
//! rebalances move queued work together with shard ownership.

mod job;
mod membership;
mod queue;
mod stats;
mod worker;

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicUsize, Ordering};
use std::sync::mpsc;
use std::sync::{Arc, Mutex, RwLock};
use std::thread::JoinHandle;
use std::time::Instant;

use thiserror::Error;
use tracing::info;

use tickgate_core::{PoolConfig, WorkerId};

use crate::breaker::BreakerRegistry;
use crate::kernel::ComputeKernel;
use crate::partition::{PartitionError, Partitioner, RebalanceProposal, StealTracker};
use crate::pressure::QueueGauge;

pub use job::Completion;
pub(crate) use job::{Job, JobResult};
pub use stats::{ExecutionStats, PoolStats, WorkerStats};

use queue::{PushError, WorkerQueue};

#[derive(Debug, Error)]
pub enum PoolError {
    #[error("failed to spawn worker thread: {0}")]
    Spawn(#[from] std::io::Error),
    #[error("unknown worker {0}")]
    UnknownWorker(WorkerId),
    #[error("pool is shut down")]
    ShutDown,
}

pub(crate) type PoolJob<K> = Job<<K as ComputeKernel>::Payload, <K as ComputeKernel>::Output>;

/// Result of one non-blocking enqueue attempt. The job comes back whenever
/// it was not queued.
pub(crate) enum Enqueue<J> {
    Queued { worker: WorkerId },
    /// Owner's queue is at capacity.
    Full { worker: WorkerId, job: J },
    /// The shard is being moved or its owner is retiring; retry shortly.
    Busy(J),
    NoCapacity(J),
}

/// One worker's shared state. The queue's back end is the only part other
/// workers touch.
pub(crate) struct WorkerSlot<K: ComputeKernel> {
    pub id: WorkerId,
    pub queue: WorkerQueue<PoolJob<K>>,
    pub in_flight: AtomicUsize,
    pub executed: AtomicU64,
    pub failed: AtomicU64,
    pub stolen: AtomicU64,
    heartbeat_ms: AtomicU64,
}

impl<K: ComputeKernel> WorkerSlot<K> {
    fn new(id: WorkerId, capacity: usize) -> Self {
        Self {
            id,
            queue: WorkerQueue::new(capacity),
            in_flight: AtomicUsize::new(0),
            executed: AtomicU64::new(0),
            failed: AtomicU64::new(0),
            stolen: AtomicU64::new(0),
            heartbeat_ms: AtomicU64::new(0),
        }
    }

    pub fn heartbeat(&self, epoch: Instant) {
        self.heartbeat_ms
            .store(epoch.elapsed().as_millis() as u64, Ordering::Relaxed);
    }
}

#[derive(Debug, Default)]
pub(crate) struct PoolCounters {
    pub rebalances: AtomicU64,
    pub rebalances_aborted: AtomicU64,
    pub worker_failures: AtomicU64,
    pub respawns: AtomicU64,
    pub timeouts_at_dequeue: AtomicU64,
}

pub(crate) struct PoolShared<K: ComputeKernel> {
    pub kernel: Arc<K>,
    pub config: PoolConfig,
    pub partitioner: Arc<Partitioner>,
    pub breakers: Arc<BreakerRegistry>,
    pub workers: RwLock<BTreeMap<WorkerId, Arc<WorkerSlot<K>>>>,
    /// Serialises joins, leaves and rebalances.
    pub membership: Mutex<()>,
    pub next_id: AtomicU32,
    pub steals: StealTracker,
    pub rebalance_tx: Mutex<Option<mpsc::Sender<RebalanceProposal>>>,
    pub shutdown: AtomicBool,
    pub epoch: Instant,
    pub counters: PoolCounters,
    pub execution: Mutex<ExecutionStats>,
    pub threads: Mutex<Vec<JoinHandle<()>>>,
}

impl<K: ComputeKernel> PoolShared<K> {
    pub fn slot(&self, id: WorkerId) -> Option<Arc<WorkerSlot<K>>> {
        self.workers
            .read()
            .unwrap_or_else(|p| p.into_inner())
            .get(&id)
            .cloned()
    }

    pub fn slots(&self) -> Vec<Arc<WorkerSlot<K>>> {
        self.workers
            .read()
            .unwrap_or_else(|p| p.into_inner())
            .values()
            .cloned()
            .collect()
    }
}

/// Handle to the worker pool. Cheap to clone.
pub struct WorkerPool<K: ComputeKernel> {
    shared: Arc<PoolShared<K>>,
}

impl<K: ComputeKernel> Clone for WorkerPool<K> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<K: ComputeKernel> WorkerPool<K> {
    /// Spawn `config.resolved_worker_count()` workers and the rebalancer.
    pub fn start(
        kernel: Arc<K>,
        config: PoolConfig,
        partitioner: Arc<Partitioner>,
        breakers: Arc<BreakerRegistry>,
    ) -> Result<Self, PoolError> {
        let workers = config.resolved_worker_count();
        let (tx, rx) = mpsc::channel();
        let shared = Arc::new(PoolShared {
            kernel,
            steals: StealTracker::new(config.rebalance_steal_threshold, config.rebalance_window()),
            config,
            partitioner,
            breakers,
            workers: RwLock::new(BTreeMap::new()),
            membership: Mutex::new(()),
            next_id: AtomicU32::new(0),
            rebalance_tx: Mutex::new(Some(tx)),
            shutdown: AtomicBool::new(false),
            epoch: Instant::now(),
            counters: PoolCounters::default(),
            execution: Mutex::new(ExecutionStats::default()),
            threads: Mutex::new(Vec::new()),
        });

        membership::spawn_rebalancer(&shared, rx)?;
        for _ in 0..workers {
            membership::add_worker(&shared)?;
        }
        info!(
            workers,
            shards = shared.partitioner.total_shards(),
            queue_capacity = shared.config.queue_capacity,
            kernel = shared.kernel.name(),
            "Worker pool started"
        );
        Ok(Self { shared })
    }

    pub fn add_worker(&self) -> Result<WorkerId, PoolError> {
        if self.shared.shutdown.load(Ordering::Acquire) {
            return Err(PoolError::ShutDown);
        }
        membership::add_worker(&self.shared)
    }

    /// Gracefully remove a worker: its shards and queued items move to the
    /// new owners, its current item finishes normally.
    pub fn remove_worker(&self, id: WorkerId) -> Result<(), PoolError> {
        membership::remove_worker(&self.shared, id)
    }

    pub fn worker_ids(&self) -> Vec<WorkerId> {
        self.shared
            .workers
            .read()
            .unwrap_or_else(|p| p.into_inner())
            .keys()
            .copied()
            .collect()
    }

    pub fn partitioner(&self) -> &Arc<Partitioner> {
        &self.shared.partitioner
    }

    /// One non-blocking attempt to place `job` on its shard owner's queue.
    pub(crate) fn try_enqueue(&self, mut job: PoolJob<K>) -> Enqueue<PoolJob<K>> {
        if self.shared.shutdown.load(Ordering::Acquire) {
            return Enqueue::Busy(job);
        }
        let route = match self.shared.partitioner.try_route(&job.affinity_key) {
            Ok(Some(route)) => route,
            Ok(None) => return Enqueue::Busy(job),
            Err(PartitionError::NoCapacity) => return Enqueue::NoCapacity(job),
        };
        let Some(slot) = self.shared.slot(route.worker) else {
            return Enqueue::Busy(job);
        };
        job.shard = route.shard;
        job.worker = route.worker;
        // The route stays alive across the push so the shard cannot move under it.
        let outcome = match slot.queue.try_push(job) {
            Ok(()) => Enqueue::Queued {
                worker: route.worker,
            },
            Err(PushError::Full(job)) => Enqueue::Full {
                worker: route.worker,
                job,
            },
            Err(PushError::Closed(job)) => Enqueue::Busy(job),
        };
        drop(route);
        outcome
    }

    /// Wait until the given worker's queue frees a slot.
    pub(crate) async fn space_on(&self, worker: WorkerId) {
        if let Some(slot) = self.shared.slot(worker) {
            slot.queue.space_available().await;
        }
    }

    pub fn is_shut_down(&self) -> bool {
        self.shared.shutdown.load(Ordering::Acquire)
    }

    /// Stop accepting work, fail everything still queued with
    /// `shutting_down`, and let workers finish their current item.
    pub fn shutdown(&self) {
        membership::shutdown(&self.shared);
    }

    /// Wait for every worker thread to exit. Blocking.
    pub fn join(&self) {
        let handles: Vec<JoinHandle<()>> = std::mem::take(
            &mut *self.shared.threads.lock().unwrap_or_else(|p| p.into_inner()),
        );
        for handle in handles {
            let _ = handle.join();
        }
    }

    pub fn worker_stats(&self) -> Vec<WorkerStats> {
        let now_ms = self.shared.epoch.elapsed().as_millis() as u64;
        self.shared
            .slots()
            .iter()
            .map(|slot| WorkerStats {
                worker: slot.id,
                queue_depth: slot.queue.len(),
                in_flight: slot.in_flight.load(Ordering::Relaxed),
                executed: slot.executed.load(Ordering::Relaxed),
                failed: slot.failed.load(Ordering::Relaxed),
                stolen: slot.stolen.load(Ordering::Relaxed),
                owned_shards: self.shared.partitioner.owned_shards(slot.id).len(),
                heartbeat_age_ms: now_ms.saturating_sub(slot.heartbeat_ms.load(Ordering::Relaxed)),
            })
            .collect()
    }

    pub fn stats(&self) -> PoolStats {
        let c = &self.shared.counters;
        PoolStats {
            workers: self.shared.slots().len(),
            rebalances: c.rebalances.load(Ordering::Relaxed),
            rebalances_aborted: c.rebalances_aborted.load(Ordering::Relaxed),
            worker_failures: c.worker_failures.load(Ordering::Relaxed),
            respawns: c.respawns.load(Ordering::Relaxed),
            timeouts_at_dequeue: c.timeouts_at_dequeue.load(Ordering::Relaxed),
        }
    }

    pub fn execution_stats(&self) -> ExecutionStats {
        self.shared
            .execution
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .clone()
    }
}

impl<K: ComputeKernel> QueueGauge for WorkerPool<K> {
    fn depth(&self) -> usize {
        self.shared.slots().iter().map(|s| s.queue.len()).sum()
    }

    fn capacity(&self) -> usize {
        self.shared.slots().iter().map(|s| s.queue.capacity()).sum()
    }
}
