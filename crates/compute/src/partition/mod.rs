//! Consistent-hash partitioning of affinity keys onto workers.
//!
//! Two rings are involved:
//! - a fixed key ring mapping `affinity_key → shard` (never changes after startup)
//! - a worker ring of `virtual_nodes` points per worker, used to place shards
//!   when workers join or leave
//!
//! The resolved `shard → worker` table is separate and mutable so that a
//! single shard can be moved (steal-driven rebalance) without re-hashing.

mod ring;
mod steal_tracker;
mod table;

use std::sync::{Mutex, RwLockReadGuard, RwLockWriteGuard};

use thiserror::Error;
use tracing::debug;

use tickgate_core::{ShardId, WorkerId};

pub use ring::Ring;
pub use steal_tracker::{RebalanceProposal, StealTracker};
use table::ShardTable;

use ring::hash_u64;

/// Points per shard on the key ring. Smooths shard sizes.
const KEY_POINTS_PER_SHARD: u32 = 16;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PartitionError {
    #[error("no workers registered")]
    NoCapacity,
}

/// A shard ownership change produced by a membership event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ShardMove {
    pub shard: ShardId,
    pub from: Option<WorkerId>,
    pub to: Option<WorkerId>,
}

/// A resolved route. While it is alive the shard cannot be moved.
pub struct Route<'a> {
    pub shard: ShardId,
    pub worker: WorkerId,
    _pause: RwLockReadGuard<'a, Option<WorkerId>>,
}

/// Exclusive hold on one shard's routing slot. New enqueues to the shard
/// wait (or retry) until it is dropped.
pub struct ShardLock<'a> {
    shard: ShardId,
    table: &'a ShardTable,
    guard: RwLockWriteGuard<'a, Option<WorkerId>>,
}

impl ShardLock<'_> {
    pub fn shard(&self) -> ShardId {
        self.shard
    }

    pub fn owner(&self) -> Option<WorkerId> {
        *self.guard
    }

    /// Items of this shard currently executing.
    pub fn running(&self) -> usize {
        self.table.running(self.shard)
    }

    pub fn assign(&mut self, owner: Option<WorkerId>) {
        self.table.publish(self.shard, &mut self.guard, owner);
    }
}

pub struct Partitioner {
    keys: Ring<ShardId>,
    workers: Mutex<Ring<WorkerId>>,
    table: ShardTable,
    virtual_nodes: u32,
}

impl Partitioner {
    pub fn new(total_shards: u32, virtual_nodes: u32) -> Self {
        let total_shards = total_shards.max(1);
        let mut keys = Ring::new("shard-keys");
        for shard in 0..total_shards {
            keys.insert(shard, KEY_POINTS_PER_SHARD);
        }
        Self {
            keys,
            workers: Mutex::new(Ring::new("workers")),
            table: ShardTable::new(total_shards),
            virtual_nodes: virtual_nodes.max(1),
        }
    }

    pub fn total_shards(&self) -> u32 {
        self.table.len()
    }

    /// Deterministic `affinity_key → shard`. Fails only when no worker exists.
    pub fn shard_for(&self, affinity_key: &str) -> Result<ShardId, PartitionError> {
        if self.ring().is_empty() {
            return Err(PartitionError::NoCapacity);
        }
        Ok(self.key_shard(affinity_key))
    }

    fn key_shard(&self, affinity_key: &str) -> ShardId {
        // The key ring always holds every shard.
        self.keys.locate_key(affinity_key).unwrap_or(0)
    }

    /// Current owner of a shard, read without taking the shard lock.
    pub fn owner_of(&self, shard: ShardId) -> Result<WorkerId, PartitionError> {
        self.table.owner_hint(shard).ok_or(PartitionError::NoCapacity)
    }

    /// Resolve `affinity_key` to its owning worker, waiting out a move in progress.
    pub fn route(&self, affinity_key: &str) -> Result<Route<'_>, PartitionError> {
        let shard = self.key_shard(affinity_key);
        let guard = self.table.read(shard);
        let worker = (*guard).ok_or(PartitionError::NoCapacity)?;
        Ok(Route {
            shard,
            worker,
            _pause: guard,
        })
    }

    /// Like [`route`](Self::route) but returns `Ok(None)` instead of blocking
    /// while the shard is being moved.
    pub fn try_route(&self, affinity_key: &str) -> Result<Option<Route<'_>>, PartitionError> {
        let shard = self.key_shard(affinity_key);
        let Some(guard) = self.table.try_read(shard) else {
            return Ok(None);
        };
        let worker = (*guard).ok_or(PartitionError::NoCapacity)?;
        Ok(Some(Route {
            shard,
            worker,
            _pause: guard,
        }))
    }

    pub fn lock_shard(&self, shard: ShardId) -> ShardLock<'_> {
        ShardLock {
            shard,
            table: &self.table,
            guard: self.table.write(shard),
        }
    }

    /// Insert a worker's virtual nodes and return the shards it should take
    /// over. Nothing is applied yet.
    pub fn join(&self, worker: WorkerId) -> Vec<ShardMove> {
        let mut ring = self.ring();
        if ring.contains(worker) {
            return Vec::new();
        }
        ring.insert(worker, self.virtual_nodes);
        let moves: Vec<ShardMove> = (0..self.total_shards())
            .filter_map(|shard| {
                let placed = ring.locate(shard_point(shard));
                let current = self.table.owner_hint(shard);
                let takes_over = placed == Some(worker) && current != Some(worker);
                (current.is_none() || takes_over).then_some(ShardMove {
                    shard,
                    from: current,
                    to: placed,
                })
            })
            .collect();
        debug!(worker, moves = moves.len(), "Worker joined ring");
        moves
    }

    /// Remove a worker's virtual nodes and return where its shards go.
    /// `to` is `None` when the ring became empty.
    pub fn leave(&self, worker: WorkerId) -> Vec<ShardMove> {
        let mut ring = self.ring();
        ring.remove(worker);
        let moves: Vec<ShardMove> = (0..self.total_shards())
            .filter(|&shard| self.table.owner_hint(shard) == Some(worker))
            .map(|shard| ShardMove {
                shard,
                from: Some(worker),
                to: ring.locate(shard_point(shard)),
            })
            .collect();
        debug!(worker, moves = moves.len(), "Worker left ring");
        moves
    }

    /// Apply moves directly, without migrating queued work.
    pub fn apply(&self, moves: &[ShardMove]) {
        for mv in moves {
            self.lock_shard(mv.shard).assign(mv.to);
        }
    }

    pub fn owned_shards(&self, worker: WorkerId) -> Vec<ShardId> {
        (0..self.total_shards())
            .filter(|&s| self.table.owner_hint(s) == Some(worker))
            .collect()
    }

    /// `shard → owner` for every shard.
    pub fn assignment(&self) -> Vec<Option<WorkerId>> {
        self.table.snapshot()
    }

    pub fn workers(&self) -> Vec<WorkerId> {
        self.ring().nodes()
    }

    pub(crate) fn begin_execution(&self, shard: ShardId) {
        self.table.begin(shard);
    }

    pub(crate) fn end_execution(&self, shard: ShardId) {
        self.table.end(shard);
    }

    fn ring(&self) -> std::sync::MutexGuard<'_, Ring<WorkerId>> {
        self.workers.lock().unwrap_or_else(|p| p.into_inner())
    }
}

fn shard_point(shard: ShardId) -> u64 {
    hash_u64(&("shard", shard))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn with_workers(n: u32, shards_per_worker: u32) -> Partitioner {
        let p = Partitioner::new(n * shards_per_worker, 100);
        for w in 0..n {
            let moves = p.join(w);
            p.apply(&moves);
        }
        p
    }

    #[test]
    fn empty_ring_has_no_capacity() {
        let p = Partitioner::new(10, 100);
        assert_eq!(p.shard_for("AAPL"), Err(PartitionError::NoCapacity));
        assert!(matches!(p.route("AAPL"), Err(PartitionError::NoCapacity)));
    }

    #[test]
    fn every_shard_has_exactly_one_owner() {
        let p = with_workers(4, 10);
        let assignment = p.assignment();
        assert_eq!(assignment.len(), 40);
        assert!(assignment.iter().all(|o| o.is_some()));
        let owned: usize = (0..4).map(|w| p.owned_shards(w).len()).sum();
        assert_eq!(owned, 40);
    }

    #[test]
    fn shard_for_is_deterministic() {
        let a = with_workers(3, 10);
        let b = with_workers(3, 10);
        for key in ["AAPL", "MSFT", "TSLA", "SPX", "EURUSD"] {
            assert_eq!(a.shard_for(key).unwrap(), b.shard_for(key).unwrap());
            assert_eq!(a.route(key).unwrap().worker, b.route(key).unwrap().worker);
        }
    }

    #[test]
    fn same_key_routes_to_same_worker() {
        let p = with_workers(8, 10);
        let first = p.route("NVDA").unwrap().worker;
        for _ in 0..100 {
            assert_eq!(p.route("NVDA").unwrap().worker, first);
        }
    }

    #[test]
    fn join_only_moves_shards_to_the_new_worker() {
        let p = with_workers(5, 10);
        let before = p.assignment();
        let moves = p.join(5);
        assert!(moves.iter().all(|m| m.to == Some(5)));
        p.apply(&moves);
        let after = p.assignment();
        let changed = before.iter().zip(&after).filter(|(a, b)| a != b).count();
        assert_eq!(changed, moves.len());
    }

    #[test]
    fn leave_only_moves_the_leavers_shards() {
        let p = with_workers(5, 10);
        let owned = p.owned_shards(2);
        let moves = p.leave(2);
        assert_eq!(moves.len(), owned.len());
        p.apply(&moves);
        assert!(p.owned_shards(2).is_empty());
        assert!(p.assignment().iter().all(|o| o.is_some()));
    }

    #[test]
    fn last_worker_leaving_empties_the_table() {
        let p = with_workers(1, 10);
        let moves = p.leave(0);
        assert!(moves.iter().all(|m| m.to.is_none()));
        p.apply(&moves);
        assert_eq!(p.shard_for("AAPL"), Err(PartitionError::NoCapacity));
        assert!(matches!(p.route("AAPL"), Err(PartitionError::NoCapacity)));
    }

    #[test]
    fn rebalance_bound_holds_across_ring_sizes() {
        let mut join_moves = 0usize;
        let mut leave_moves = 0usize;
        let mut bound = 0f64;
        for n in 2..=16u32 {
            let p = with_workers(n, 10);
            let total = p.total_shards() as f64;
            bound += 2.0 / n as f64 * total;

            let joined = p.join(n);
            join_moves += joined.len();
            p.apply(&joined);

            let left = p.leave(n);
            leave_moves += left.len();
            p.apply(&left);
        }
        assert!((join_moves as f64) <= bound, "join moved {join_moves}, bound {bound}");
        assert!((leave_moves as f64) <= bound, "leave moved {leave_moves}, bound {bound}");
    }

    #[test]
    fn try_route_yields_during_move() {
        let p = with_workers(2, 10);
        let shard = p.shard_for("AAPL").unwrap();
        let lock = p.lock_shard(shard);
        assert!(p.try_route("AAPL").unwrap().is_none());
        drop(lock);
        assert!(p.try_route("AAPL").unwrap().is_some());
    }

    #[test]
    fn shard_lock_moves_a_single_shard() {
        let p = with_workers(3, 10);
        let shard = p.shard_for("GOOG").unwrap();
        let from = p.owner_of(shard).unwrap();
        let to = (from + 1) % 3;
        {
            let mut lock = p.lock_shard(shard);
            assert_eq!(lock.owner(), Some(from));
            assert_eq!(lock.running(), 0);
            lock.assign(Some(to));
        }
        assert_eq!(p.route("GOOG").unwrap().worker, to);
    }
}
