use std::collections::{HashMap, HashSet};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use tickgate_core::{ShardId, WorkerId};

/// A request to move a shard to the worker that keeps stealing it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RebalanceProposal {
    pub shard: ShardId,
    pub to: WorkerId,
}

#[derive(Debug)]
struct Streak {
    thief: WorkerId,
    count: u32,
    started: Instant,
}

/// Counts consecutive steals of a shard by the same thief.
///
/// A streak resets when a different worker steals the shard or when the
/// window elapses. Reaching `threshold` inside the window yields a proposal
/// and clears the streak.
#[derive(Debug)]
pub struct StealTracker {
    threshold: u32,
    window: Duration,
    streaks: Mutex<HashMap<ShardId, Streak>>,
}

impl StealTracker {
    pub fn new(threshold: u32, window: Duration) -> Self {
        Self {
            threshold: threshold.max(1),
            window,
            streaks: Mutex::new(HashMap::new()),
        }
    }

    pub fn record(&self, shard: ShardId, thief: WorkerId, now: Instant) -> Option<RebalanceProposal> {
        let mut streaks = self.streaks.lock().unwrap_or_else(|p| p.into_inner());
        let streak = streaks.entry(shard).or_insert(Streak {
            thief,
            count: 0,
            started: now,
        });
        if streak.thief != thief || now.duration_since(streak.started) > self.window {
            *streak = Streak {
                thief,
                count: 0,
                started: now,
            };
        }
        streak.count += 1;
        if streak.count >= self.threshold {
            streaks.remove(&shard);
            return Some(RebalanceProposal { shard, to: thief });
        }
        None
    }

    /// Record one steal event. A batch counts once per shard it touched,
    /// however many of that shard's items it carried.
    pub fn record_batch(
        &self,
        shards: impl IntoIterator<Item = ShardId>,
        thief: WorkerId,
        now: Instant,
    ) -> Vec<RebalanceProposal> {
        let mut seen = HashSet::new();
        shards
            .into_iter()
            .filter(|shard| seen.insert(*shard))
            .filter_map(|shard| self.record(shard, thief, now))
            .collect()
    }

    /// Drop any streak for `shard` (after it moved).
    pub fn forget(&self, shard: ShardId) {
        self.streaks
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .remove(&shard);
    }

    /// Drop every streak involving `worker` as the thief.
    pub fn forget_worker(&self, worker: WorkerId) {
        self.streaks
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .retain(|_, s| s.thief != worker);
    }
}
