use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::breaker::BreakerSnapshot;
use crate::budget::{BudgetHealth, ResourceAdvisory};
use crate::error::ScheduleError;
use crate::pool::{ExecutionStats, PoolStats, WorkerStats};
use crate::pressure::{PressureLevel, PressureMetric, PressureSample};
use crate::shedder::ShedStats;

/// Point-in-time view of the scheduling plane for monitoring.
#[derive(Debug, Clone, Serialize)]
pub struct SchedulerMetrics {
    pub captured_at: DateTime<Utc>,
    pub pressure_level: PressureLevel,
    /// Metric that drove the current level.
    pub pressure_metric: PressureMetric,
    pub pressure_transitions: u64,
    pub latest_sample: Option<PressureSample>,
    pub queue_full_total: u64,
    pub workers: Vec<WorkerStats>,
    pub pool: PoolStats,
    pub shed: ShedStats,
    pub admission: AdmissionStats,
    pub breakers: Vec<BreakerSnapshot>,
    pub budget: BudgetHealth,
    pub in_flight: u32,
    pub requests_last_minute: u64,
    pub advisory: ResourceAdvisory,
    pub execution: ExecutionStats,
}

impl SchedulerMetrics {
    pub fn total_queue_depth(&self) -> usize {
        self.workers.iter().map(|w| w.queue_depth).sum()
    }

    pub fn total_stolen(&self) -> u64 {
        self.workers.iter().map(|w| w.stolen).sum()
    }
}

/// Submission outcomes as seen by the orchestrator.
#[derive(Debug, Clone, Default, Serialize)]
pub struct AdmissionStats {
    pub submitted: u64,
    /// Placed on a worker queue.
    pub accepted: u64,
    /// Results observed through a handle.
    pub completed: u64,
    /// Failures by reason code, at admission or observed through a handle.
    pub failed: BTreeMap<&'static str, u64>,
}

#[derive(Debug, Default)]
pub(crate) struct AdmissionCounters {
    submitted: AtomicU64,
    accepted: AtomicU64,
    completed: AtomicU64,
    failed: Mutex<BTreeMap<&'static str, u64>>,
}

impl AdmissionCounters {
    pub fn record_submitted(&self) {
        self.submitted.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_accepted(&self) {
        self.accepted.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_completed(&self) {
        self.completed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_failure(&self, err: &ScheduleError) {
        *self
            .failed
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .entry(err.code())
            .or_default() += 1;
    }

    pub fn snapshot(&self) -> AdmissionStats {
        AdmissionStats {
            submitted: self.submitted.load(Ordering::Relaxed),
            accepted: self.accepted.load(Ordering::Relaxed),
            completed: self.completed.load(Ordering::Relaxed),
            failed: self.failed.lock().unwrap_or_else(|p| p.into_inner()).clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_snapshot() {
        let c = AdmissionCounters::default();
        c.record_submitted();
        c.record_submitted();
        c.record_accepted();
        c.record_completed();
        c.record_failure(&ScheduleError::ShuttingDown);

        let s = c.snapshot();
        assert_eq!(s.submitted, 2);
        assert_eq!(s.accepted, 1);
        assert_eq!(s.completed, 1);
        assert_eq!(s.failed["shutting_down"], 1);
    }

    #[test]
    fn failures_group_by_code() {
        let c = AdmissionCounters::default();
        c.record_failure(&ScheduleError::ShuttingDown);
        c.record_failure(&ScheduleError::ShuttingDown);
        c.record_failure(&ScheduleError::Kernel(anyhow::anyhow!("boom")));
        let s = c.snapshot();
        assert_eq!(s.failed.len(), 2);
        assert_eq!(s.failed["shutting_down"], 2);
        assert_eq!(s.failed["kernel_error"], 1);
    }
}
