//! Adaptive load shedding: turns the budget verdict and the current pressure
//! level into an admission decision per work item.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use serde::Serialize;
use tracing::debug;

use tickgate_core::{Priority, ShedderConfig, WorkItem};

use crate::budget::{BudgetGuard, BudgetPermit, BudgetRejection};
use crate::pressure::{BackpressureMonitor, PressureLevel};

/// Pressure-driven rejection reason.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ShedReason {
    /// Critical pressure: only critical and high priority pass.
    Critical,
    /// Moderate pressure: low priority refused.
    Moderate,
    /// Heavy pressure: low priority exhausted its delay rounds.
    Heavy,
}

impl ShedReason {
    pub fn code(self) -> &'static str {
        match self {
            ShedReason::Critical => "shed_critical",
            ShedReason::Moderate => "shed_moderate",
            ShedReason::Heavy => "shed_heavy",
        }
    }
}

impl fmt::Display for ShedReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.code())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RejectReason {
    Budget(BudgetRejection),
    Shed(ShedReason),
}

impl RejectReason {
    pub fn code(self) -> &'static str {
        match self {
            RejectReason::Budget(_) => "budget_exceeded",
            RejectReason::Shed(reason) => reason.code(),
        }
    }
}

/// Outcome of one admission decision.
#[derive(Debug)]
pub enum Admission {
    /// Carries the concurrency permit; hold it until the item completes.
    Admitted(BudgetPermit),
    /// Retry after the given backoff.
    Delayed(Duration),
    Rejected(RejectReason),
}

impl Admission {
    pub fn is_admitted(&self) -> bool {
        matches!(self, Admission::Admitted(_))
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct ShedStats {
    pub admitted: u64,
    pub delayed: u64,
    /// Rejections keyed by reason code.
    pub rejected: BTreeMap<&'static str, u64>,
    /// Admitted counts keyed by priority.
    pub admitted_by_priority: BTreeMap<&'static str, u64>,
    pub rejected_by_priority: BTreeMap<&'static str, u64>,
}

#[derive(Debug, Default)]
struct Counters {
    admitted: AtomicU64,
    delayed: AtomicU64,
    budget: AtomicU64,
    critical: AtomicU64,
    moderate: AtomicU64,
    heavy: AtomicU64,
    admitted_by_priority: [AtomicU64; 4],
    rejected_by_priority: [AtomicU64; 4],
}

pub struct LoadShedder {
    config: ShedderConfig,
    budget: Arc<BudgetGuard>,
    monitor: Arc<BackpressureMonitor>,
    counters: Counters,
}

impl LoadShedder {
    pub fn new(config: ShedderConfig, budget: Arc<BudgetGuard>, monitor: Arc<BackpressureMonitor>) -> Self {
        Self {
            config,
            budget,
            monitor,
            counters: Counters::default(),
        }
    }

    pub fn config(&self) -> &ShedderConfig {
        &self.config
    }

    /// First admission attempt for `item`.
    pub fn admit<P>(&self, item: &WorkItem<P>) -> Admission {
        self.admit_round(item.priority, 0)
    }

    /// Decide admission for the `round`-th attempt (0 = first), in order:
    /// hard budget, critical, heavy, moderate.
    pub fn admit_round(&self, priority: Priority, round: u32) -> Admission {
        let permit = match self.budget.check() {
            Ok(permit) => permit,
            Err(rejection) => {
                return self.reject(priority, RejectReason::Budget(rejection));
            }
        };

        match self.monitor.level() {
            PressureLevel::Critical if priority > Priority::High => {
                self.reject(priority, RejectReason::Shed(ShedReason::Critical))
            }
            PressureLevel::Heavy if priority == Priority::Low => {
                let delay = self.backoff(round);
                self.counters.delayed.fetch_add(1, Ordering::Relaxed);
                debug!(priority = %priority, round, delay_ms = delay.as_millis() as u64, "Delaying low-priority work");
                Admission::Delayed(delay)
            }
            PressureLevel::Moderate if priority == Priority::Low => {
                self.reject(priority, RejectReason::Shed(ShedReason::Moderate))
            }
            _ => {
                self.counters.admitted.fetch_add(1, Ordering::Relaxed);
                self.counters.admitted_by_priority[priority.as_index()].fetch_add(1, Ordering::Relaxed);
                Admission::Admitted(permit)
            }
        }
    }

    /// Record the final `shed_heavy` rejection of an item that ran out of delay rounds.
    pub fn record_heavy_shed(&self, priority: Priority) -> RejectReason {
        match self.reject(priority, RejectReason::Shed(ShedReason::Heavy)) {
            Admission::Rejected(reason) => reason,
            _ => RejectReason::Shed(ShedReason::Heavy),
        }
    }

    fn reject(&self, priority: Priority, reason: RejectReason) -> Admission {
        let counter = match reason {
            RejectReason::Budget(_) => &self.counters.budget,
            RejectReason::Shed(ShedReason::Critical) => &self.counters.critical,
            RejectReason::Shed(ShedReason::Moderate) => &self.counters.moderate,
            RejectReason::Shed(ShedReason::Heavy) => &self.counters.heavy,
        };
        counter.fetch_add(1, Ordering::Relaxed);
        self.counters.rejected_by_priority[priority.as_index()].fetch_add(1, Ordering::Relaxed);
        debug!(priority = %priority, reason = reason.code(), "Rejected at admission");
        Admission::Rejected(reason)
    }

    /// Exponential backoff from `delay_base_ms`, capped at `delay_max_ms`,
    /// with ±`delay_jitter` uniform jitter.
    fn backoff(&self, round: u32) -> Duration {
        let base = self.config.delay_base_ms.max(1) as f64;
        let capped = (base * 2f64.powi(round.min(16) as i32)).min(self.config.delay_max_ms.max(1) as f64);
        let jitter = self.config.delay_jitter.clamp(0.0, 1.0);
        let factor = if jitter > 0.0 {
            rand::thread_rng().gen_range((1.0 - jitter)..=(1.0 + jitter))
        } else {
            1.0
        };
        Duration::from_micros((capped * factor * 1000.0) as u64)
    }

    pub fn stats(&self) -> ShedStats {
        let c = &self.counters;
        let load = |a: &AtomicU64| a.load(Ordering::Relaxed);
        let mut rejected = BTreeMap::new();
        rejected.insert("budget_exceeded", load(&c.budget));
        rejected.insert(ShedReason::Critical.code(), load(&c.critical));
        rejected.insert(ShedReason::Moderate.code(), load(&c.moderate));
        rejected.insert(ShedReason::Heavy.code(), load(&c.heavy));
        let by_priority = |counters: &[AtomicU64; 4]| {
            Priority::ALL
                .iter()
                .map(|p| (p.as_str(), load(&counters[p.as_index()])))
                .collect::<BTreeMap<_, _>>()
        };
        ShedStats {
            admitted: load(&c.admitted),
            delayed: load(&c.delayed),
            rejected,
            admitted_by_priority: by_priority(&c.admitted_by_priority),
            rejected_by_priority: by_priority(&c.rejected_by_priority),
        }
    }
}

#[cfg(test)]
mod tests {
    use tickgate_core::{BudgetConfig, PressureConfig};

    use super::*;
    use crate::pressure::ManualProbe;

    fn shedder(max_concurrent: u32) -> (Arc<ManualProbe>, Arc<BackpressureMonitor>, LoadShedder) {
        let probe = Arc::new(ManualProbe::new());
        let budget = Arc::new(BudgetGuard::new(BudgetConfig {
            max_concurrent_operations: max_concurrent,
            max_memory_mb: 1000,
            max_cpu_percent: 100.0,
            ..BudgetConfig::default()
        }));
        let monitor = Arc::new(BackpressureMonitor::new(
            PressureConfig::default(),
            budget.clone(),
            probe.clone(),
        ));
        let shedder = LoadShedder::new(ShedderConfig::default(), budget, monitor.clone());
        (probe, monitor, shedder)
    }

    fn at_memory(probe: &ManualProbe, monitor: &BackpressureMonitor, mb: u64) {
        probe.set_memory_mb(mb);
        monitor.sample_now();
    }

    #[test]
    fn normal_admits_everything() {
        let (_probe, _monitor, s) = shedder(1_000);
        for p in Priority::ALL {
            assert!(s.admit_round(p, 0).is_admitted());
        }
        assert_eq!(s.stats().admitted, 4);
    }

    #[test]
    fn budget_breach_rejects_even_critical() {
        let (_probe, _monitor, s) = shedder(1);
        let _held = s.admit_round(Priority::Normal, 0);
        match s.admit_round(Priority::Critical, 0) {
            Admission::Rejected(reason) => assert_eq!(reason.code(), "budget_exceeded"),
            other => panic!("expected rejection, got {other:?}"),
        }
    }

    #[test]
    fn moderate_rejects_low_only() {
        let (probe, monitor, s) = shedder(1_000);
        at_memory(&probe, &monitor, 900);
        assert_eq!(monitor.level(), PressureLevel::Moderate);
        match s.admit_round(Priority::Low, 0) {
            Admission::Rejected(reason) => assert_eq!(reason.code(), "shed_moderate"),
            other => panic!("expected shed, got {other:?}"),
        }
        assert!(s.admit_round(Priority::Normal, 0).is_admitted());
    }

    #[test]
    fn heavy_delays_low_with_bounded_backoff() {
        let (probe, monitor, s) = shedder(1_000);
        at_memory(&probe, &monitor, 960);
        assert_eq!(monitor.level(), PressureLevel::Heavy);
        for round in 0..10 {
            match s.admit_round(Priority::Low, round) {
                Admission::Delayed(d) => {
                    assert!(d <= Duration::from_millis(1_500), "round {round}: {d:?}");
                    assert!(d > Duration::ZERO);
                }
                other => panic!("expected delay, got {other:?}"),
            }
        }
        assert!(s.admit_round(Priority::Normal, 0).is_admitted());
        assert_eq!(s.stats().delayed, 10);
    }

    #[test]
    fn critical_pressure_keeps_only_critical_and_high() {
        let (probe, monitor, s) = shedder(100_000);
        at_memory(&probe, &monitor, 1_000);
        assert_eq!(monitor.level(), PressureLevel::Critical);
        assert!(s.admit_round(Priority::Critical, 0).is_admitted());
        assert!(s.admit_round(Priority::High, 0).is_admitted());
        for p in [Priority::Normal, Priority::Low] {
            match s.admit_round(p, 0) {
                Admission::Rejected(reason) => assert_eq!(reason.code(), "shed_critical"),
                other => panic!("expected shed, got {other:?}"),
            }
        }
        let stats = s.stats();
        assert_eq!(stats.rejected["shed_critical"], 2);
        assert_eq!(stats.rejected_by_priority["low"], 1);
    }

    #[test]
    fn heavy_shed_is_counted() {
        let (_probe, _monitor, s) = shedder(10);
        assert_eq!(s.record_heavy_shed(Priority::Low).code(), "shed_heavy");
        assert_eq!(s.stats().rejected["shed_heavy"], 1);
    }
}
