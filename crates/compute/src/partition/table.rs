use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard, TryLockError};

use tickgate_core::{ShardId, WorkerId};

const NO_OWNER: u32 = u32::MAX;

/// One shard's routing slot.
///
/// `owner` is the source of truth and its lock is the shard-scoped pause:
/// routing takes it shared, membership changes and rebalances take it
/// exclusively. `owner_hint` mirrors it for lock-free observers.
#[derive(Debug)]
pub(crate) struct ShardSlot {
    owner: RwLock<Option<WorkerId>>,
    owner_hint: AtomicU32,
    running: AtomicUsize,
}

impl ShardSlot {
    fn new() -> Self {
        Self {
            owner: RwLock::new(None),
            owner_hint: AtomicU32::new(NO_OWNER),
            running: AtomicUsize::new(0),
        }
    }
}

/// The mutable `shard_id → worker_id` table. Shard count is fixed.
#[derive(Debug)]
pub(crate) struct ShardTable {
    slots: Vec<ShardSlot>,
}

impl ShardTable {
    pub fn new(total_shards: u32) -> Self {
        Self {
            slots: (0..total_shards).map(|_| ShardSlot::new()).collect(),
        }
    }

    pub fn len(&self) -> u32 {
        self.slots.len() as u32
    }

    fn slot(&self, shard: ShardId) -> &ShardSlot {
        &self.slots[shard as usize % self.slots.len()]
    }

    pub fn owner_hint(&self, shard: ShardId) -> Option<WorkerId> {
        match self.slot(shard).owner_hint.load(Ordering::Acquire) {
            NO_OWNER => None,
            w => Some(w),
        }
    }

    /// Shared access; blocks while the shard is being moved.
    pub fn read(&self, shard: ShardId) -> RwLockReadGuard<'_, Option<WorkerId>> {
        self.slot(shard)
            .owner
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Shared access without blocking; `None` while the shard is being moved.
    pub fn try_read(&self, shard: ShardId) -> Option<RwLockReadGuard<'_, Option<WorkerId>>> {
        match self.slot(shard).owner.try_read() {
            Ok(guard) => Some(guard),
            Err(TryLockError::Poisoned(poisoned)) => Some(poisoned.into_inner()),
            Err(TryLockError::WouldBlock) => None,
        }
    }

    pub fn write(&self, shard: ShardId) -> RwLockWriteGuard<'_, Option<WorkerId>> {
        self.slot(shard)
            .owner
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Publish a new owner. Callers hold the write guard for `shard`.
    pub fn publish(&self, shard: ShardId, guard: &mut RwLockWriteGuard<'_, Option<WorkerId>>, owner: Option<WorkerId>) {
        **guard = owner;
        self.slot(shard)
            .owner_hint
            .store(owner.unwrap_or(NO_OWNER), Ordering::Release);
    }

    pub fn begin(&self, shard: ShardId) {
        self.slot(shard).running.fetch_add(1, Ordering::AcqRel);
    }

    pub fn end(&self, shard: ShardId) {
        self.slot(shard).running.fetch_sub(1, Ordering::AcqRel);
    }

    /// Items of `shard` currently executing on any worker.
    pub fn running(&self, shard: ShardId) -> usize {
        self.slot(shard).running.load(Ordering::Acquire)
    }

    pub fn snapshot(&self) -> Vec<Option<WorkerId>> {
        (0..self.len()).map(|s| self.owner_hint(s)).collect()
    }
}
