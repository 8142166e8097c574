use std::collections::HashMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;

use tickgate_core::{Priority, WorkerId};

/// Point-in-time view of one worker.
#[derive(Debug, Clone, Serialize)]
pub struct WorkerStats {
    pub worker: WorkerId,
    pub queue_depth: usize,
    pub in_flight: usize,
    pub executed: u64,
    pub failed: u64,
    /// Items this worker stole from peers.
    pub stolen: u64,
    pub owned_shards: usize,
    /// Milliseconds since the worker loop last checked in.
    pub heartbeat_age_ms: u64,
}

/// Pool-wide counters.
#[derive(Debug, Clone, Default, Serialize)]
pub struct PoolStats {
    pub workers: usize,
    pub rebalances: u64,
    pub rebalances_aborted: u64,
    pub worker_failures: u64,
    pub respawns: u64,
    pub timeouts_at_dequeue: u64,
}

/// Execution counts and mean durations per priority.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ExecutionStats {
    pub executed: HashMap<String, u64>,
    pub avg_duration: HashMap<String, Duration>,
    pub last_completed: Option<DateTime<Utc>>,
}

impl ExecutionStats {
    /// Record one completed execution.
    pub fn record_execution(&mut self, priority: Priority, duration: Duration) {
        let key = priority.as_str();
        *self.executed.entry(key.to_string()).or_default() += 1;
        self.last_completed = Some(Utc::now());

        let count = self.executed[key];
        let prev_avg = self.avg_duration.get(key).copied().unwrap_or_default();

        // Incremental mean: new_avg = prev_avg + (duration - prev_avg) / count
        let new_avg = if count == 1 {
            duration
        } else {
            let prev_nanos = prev_avg.as_nanos() as f64;
            let cur_nanos = duration.as_nanos() as f64;
            let avg_nanos = prev_nanos + (cur_nanos - prev_nanos) / count as f64;
            Duration::from_nanos(avg_nanos as u64)
        };

        self.avg_duration.insert(key.to_string(), new_avg);
    }

    pub fn total(&self) -> u64 {
        self.executed.values().sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn record_single_execution() {
        let mut s = ExecutionStats::default();
        s.record_execution(Priority::High, Duration::from_millis(100));

        assert_eq!(s.executed["high"], 1);
        assert!(s.last_completed.is_some());
        assert_eq!(s.avg_duration["high"], Duration::from_millis(100));
    }

    #[test]
    fn record_multiple_executions_averages() {
        let mut s = ExecutionStats::default();
        s.record_execution(Priority::Normal, Duration::from_millis(100));
        s.record_execution(Priority::Normal, Duration::from_millis(200));

        assert_eq!(s.executed["normal"], 2);
        // Average of 100ms and 200ms = 150ms
        let avg = s.avg_duration["normal"].as_millis();
        assert!((140..=160).contains(&avg), "expected ~150ms, got {}ms", avg);
        assert_eq!(s.total(), 2);
    }
}
