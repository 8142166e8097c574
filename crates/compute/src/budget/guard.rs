use std::fmt;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Instant;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, info, warn};

use tickgate_core::{BudgetConfig, CoreError};

/// Seconds covered by the request-rate window.
const RATE_WINDOW_SECS: u64 = 60;
const EMPTY_SLOT: u64 = u64::MAX;
const COUNT_MASK: u64 = 0xffff_ffff;

/// A hard ceiling that refused an admission.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BudgetRejection {
    Concurrency { limit: u32 },
    RequestRate { limit: u64 },
}

impl fmt::Display for BudgetRejection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BudgetRejection::Concurrency { limit } => {
                write!(f, "concurrent operation limit reached ({limit})")
            }
            BudgetRejection::RequestRate { limit } => {
                write!(f, "request rate limit reached ({limit}/min)")
            }
        }
    }
}

/// Where the active budget came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConfigOrigin {
    /// Built-in defaults: the control source has never answered.
    Defaults,
    /// A snapshot successfully fetched from the control source.
    Fetched,
}

/// Health signal for the budget configuration.
#[derive(Debug, Clone, Serialize)]
pub struct BudgetHealth {
    pub origin: ConfigOrigin,
    /// The most recent refresh failed.
    pub degraded: bool,
    pub last_error: Option<String>,
    pub last_refresh: Option<DateTime<Utc>>,
    pub consecutive_failures: u32,
}

/// A held slot of the concurrency ceiling. Released on drop.
#[derive(Debug)]
pub struct BudgetPermit {
    in_flight: Arc<AtomicU32>,
}

impl Drop for BudgetPermit {
    fn drop(&mut self) {
        self.in_flight.fetch_sub(1, Ordering::AcqRel);
    }
}

/// Memory/CPU ceilings currently exceeded. Advisory only.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct ResourceAdvisory {
    pub memory_over: bool,
    pub cpu_over: bool,
}

/// Per-second request counters covering the last minute.
///
/// Each slot packs `second << 32 | count` into one word so a slot is
/// rolled over to a new second and counted in a single CAS.
#[derive(Debug)]
struct RateWindow {
    epoch: Instant,
    slots: Vec<AtomicU64>,
}

impl RateWindow {
    fn new(epoch: Instant) -> Self {
        Self {
            epoch,
            slots: (0..RATE_WINDOW_SECS).map(|_| AtomicU64::new(EMPTY_SLOT)).collect(),
        }
    }

    fn second(&self, now: Instant) -> u64 {
        now.saturating_duration_since(self.epoch).as_secs()
    }

    fn slot(&self, sec: u64) -> &AtomicU64 {
        &self.slots[(sec % RATE_WINDOW_SECS) as usize]
    }

    fn total(&self, now: Instant) -> u64 {
        let sec = self.second(now);
        self.slots
            .iter()
            .map(|slot| slot.load(Ordering::Acquire))
            .filter(|v| *v != EMPTY_SLOT && (v >> 32) + RATE_WINDOW_SECS > sec)
            .map(|v| v & COUNT_MASK)
            .sum()
    }

    /// Count one request in the current second.
    fn record(&self, now: Instant) {
        let sec = self.second(now);
        let slot = self.slot(sec);
        let mut current = slot.load(Ordering::Acquire);
        loop {
            let next = if current != EMPTY_SLOT && current >> 32 >= sec {
                current + 1
            } else {
                (sec << 32) | 1
            };
            match slot.compare_exchange_weak(current, next, Ordering::AcqRel, Ordering::Acquire) {
                Ok(_) => return,
                Err(actual) => current = actual,
            }
        }
    }

    /// Take back a request recorded at `now`, unless its slot has since
    /// rolled over to a later second.
    fn unrecord(&self, now: Instant) {
        let sec = self.second(now);
        let slot = self.slot(sec);
        let mut current = slot.load(Ordering::Acquire);
        loop {
            if current == EMPTY_SLOT || current >> 32 != sec || current & COUNT_MASK == 0 {
                return;
            }
            match slot.compare_exchange_weak(current, current - 1, Ordering::AcqRel, Ordering::Acquire) {
                Ok(_) => return,
                Err(actual) => current = actual,
            }
        }
    }
}

#[derive(Debug)]
struct HealthState {
    origin: ConfigOrigin,
    degraded: bool,
    last_error: Option<String>,
    last_refresh: Option<DateTime<Utc>>,
    consecutive_failures: u32,
}

/// Enforces hard ceilings on the admission path.
///
/// Concurrency is a counting permit and request rate is a sliding one-minute
/// window, both lock-free. Memory and CPU are process gauges fed by the
/// backpressure monitor and only reported as advisories.
#[derive(Debug)]
pub struct BudgetGuard {
    config: RwLock<Arc<BudgetConfig>>,
    health: RwLock<HealthState>,
    in_flight: Arc<AtomicU32>,
    rate: RateWindow,
    memory_bytes: AtomicU64,
    cpu_percent_x100: AtomicU64,
    rejected_concurrency: AtomicU64,
    rejected_rate: AtomicU64,
}

impl BudgetGuard {
    /// Start from built-in defaults until a snapshot is fetched.
    pub fn new(defaults: BudgetConfig) -> Self {
        Self {
            config: RwLock::new(Arc::new(defaults)),
            health: RwLock::new(HealthState {
                origin: ConfigOrigin::Defaults,
                degraded: false,
                last_error: None,
                last_refresh: None,
                consecutive_failures: 0,
            }),
            in_flight: Arc::new(AtomicU32::new(0)),
            rate: RateWindow::new(Instant::now()),
            memory_bytes: AtomicU64::new(0),
            cpu_percent_x100: AtomicU64::new(0),
            rejected_concurrency: AtomicU64::new(0),
            rejected_rate: AtomicU64::new(0),
        }
    }

    /// The active immutable snapshot.
    pub fn current_config(&self) -> Arc<BudgetConfig> {
        Arc::clone(&self.config.read().unwrap_or_else(|p| p.into_inner()))
    }

    pub fn check(&self) -> Result<BudgetPermit, BudgetRejection> {
        self.check_at(Instant::now())
    }

    /// Admission check against the hard ceilings. Every attempt that passes
    /// the rate check is counted toward the rate window, including ones the
    /// concurrency ceiling then refuses.
    pub fn check_at(&self, now: Instant) -> Result<BudgetPermit, BudgetRejection> {
        let config = self.current_config();

        // Reserve, then verify: the window never holds more than `rate_limit` admissions.
        let rate_limit = config.max_request_rate_per_minute;
        self.rate.record(now);
        if self.rate.total(now) > rate_limit {
            self.rate.unrecord(now);
            self.rejected_rate.fetch_add(1, Ordering::Relaxed);
            return Err(BudgetRejection::RequestRate { limit: rate_limit });
        }

        let limit = config.max_concurrent_operations;
        let mut current = self.in_flight.load(Ordering::Acquire);
        loop {
            if current >= limit {
                self.rejected_concurrency.fetch_add(1, Ordering::Relaxed);
                return Err(BudgetRejection::Concurrency { limit });
            }
            match self.in_flight.compare_exchange_weak(
                current,
                current + 1,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => break,
                Err(actual) => current = actual,
            }
        }

        let advisory = self.advisory();
        if advisory.memory_over || advisory.cpu_over {
            debug!(
                memory_over = advisory.memory_over,
                cpu_over = advisory.cpu_over,
                "Admitting above soft resource ceiling"
            );
        }

        Ok(BudgetPermit {
            in_flight: Arc::clone(&self.in_flight),
        })
    }

    pub fn in_flight(&self) -> u32 {
        self.in_flight.load(Ordering::Acquire)
    }

    pub fn requests_last_minute(&self) -> u64 {
        self.rate.total(Instant::now())
    }

    /// Latest process gauges, written by the backpressure monitor.
    pub fn observe_resources(&self, memory_bytes: u64, cpu_percent: f64) {
        self.memory_bytes.store(memory_bytes, Ordering::Release);
        self.cpu_percent_x100
            .store((cpu_percent.max(0.0) * 100.0) as u64, Ordering::Release);
    }

    pub fn advisory(&self) -> ResourceAdvisory {
        let config = self.current_config();
        let memory_mb = self.memory_bytes.load(Ordering::Acquire) / (1024 * 1024);
        let cpu = self.cpu_percent_x100.load(Ordering::Acquire) as f64 / 100.0;
        ResourceAdvisory {
            memory_over: memory_mb >= config.max_memory_mb,
            cpu_over: cpu >= config.max_cpu_percent,
        }
    }

    /// Rejections so far as `(concurrency, rate)`.
    pub fn rejections(&self) -> (u64, u64) {
        (
            self.rejected_concurrency.load(Ordering::Relaxed),
            self.rejected_rate.load(Ordering::Relaxed),
        )
    }

    // ── Refresh ───────────────────────────────────────────────

    /// Validate and publish a freshly fetched snapshot.
    pub fn apply_snapshot(&self, config: BudgetConfig) -> Result<(), CoreError> {
        config.validate()?;
        let changed = *self.current_config() != config;
        *self.config.write().unwrap_or_else(|p| p.into_inner()) = Arc::new(config);

        let mut health = self.health.write().unwrap_or_else(|p| p.into_inner());
        if health.degraded {
            info!(
                failures = health.consecutive_failures,
                "Budget configuration source recovered"
            );
        }
        health.origin = ConfigOrigin::Fetched;
        health.degraded = false;
        health.last_error = None;
        health.last_refresh = Some(Utc::now());
        health.consecutive_failures = 0;
        if changed {
            debug!("Published new budget snapshot");
        }
        Ok(())
    }

    /// Record a failed refresh. The active snapshot is left untouched.
    pub fn record_refresh_failure(&self, error: &str) {
        let mut health = self.health.write().unwrap_or_else(|p| p.into_inner());
        health.degraded = true;
        health.last_error = Some(error.to_string());
        health.consecutive_failures += 1;
        match health.origin {
            ConfigOrigin::Defaults => warn!(
                error,
                failures = health.consecutive_failures,
                "Budget source unavailable, running degraded on built-in defaults"
            ),
            ConfigOrigin::Fetched => warn!(
                error,
                failures = health.consecutive_failures,
                "Budget source unavailable, running degraded on last-known-good snapshot"
            ),
        }
    }

    pub fn health(&self) -> BudgetHealth {
        let health = self.health.read().unwrap_or_else(|p| p.into_inner());
        BudgetHealth {
            origin: health.origin,
            degraded: health.degraded,
            last_error: health.last_error.clone(),
            last_refresh: health.last_refresh,
            consecutive_failures: health.consecutive_failures,
        }
    }
}

impl Default for BudgetGuard {
    fn default() -> Self {
        Self::new(BudgetConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    fn guard(concurrency: u32, rate: u64) -> BudgetGuard {
        BudgetGuard::new(BudgetConfig {
            max_concurrent_operations: concurrency,
            max_request_rate_per_minute: rate,
            ..BudgetConfig::default()
        })
    }

    #[test]
    fn concurrency_ceiling_is_a_permit() {
        let g = guard(2, 1_000);
        let a = g.check().unwrap();
        let _b = g.check().unwrap();
        assert_eq!(
            g.check().unwrap_err(),
            BudgetRejection::Concurrency { limit: 2 }
        );
        drop(a);
        assert!(g.check().is_ok());
        assert_eq!(g.rejections().0, 1);
    }

    #[test]
    fn rate_window_slides() {
        let g = guard(1_000, 3);
        let start = Instant::now();
        for _ in 0..3 {
            drop(g.check_at(start).unwrap());
        }
        assert_eq!(
            g.check_at(start + Duration::from_secs(30)).unwrap_err(),
            BudgetRejection::RequestRate { limit: 3 }
        );
        // A minute later the old seconds have aged out.
        assert!(g.check_at(start + Duration::from_secs(61)).is_ok());
        assert_eq!(g.rejections().1, 1);
    }

    #[test]
    fn rate_ceiling_holds_under_contention() {
        let g = Arc::new(guard(100_000, 1_000));
        let threads: Vec<_> = (0..16)
            .map(|_| {
                let g = Arc::clone(&g);
                std::thread::spawn(move || (0..200).filter(|_| g.check().is_ok()).count())
            })
            .collect();
        let admitted: usize = threads.into_iter().map(|t| t.join().unwrap()).sum();
        assert!(admitted <= 1_000, "admitted {admitted}");
        assert!(admitted > 900, "admitted {admitted}");
        assert_eq!(g.requests_last_minute(), admitted as u64);
        assert_eq!(g.rejections().1, (16 * 200 - admitted) as u64);
    }

    #[test]
    fn refused_requests_are_not_counted() {
        let g = guard(1_000, 2);
        let start = Instant::now();
        drop(g.check_at(start).unwrap());
        drop(g.check_at(start).unwrap());
        for _ in 0..10 {
            assert!(g.check_at(start).is_err());
        }
        assert_eq!(g.rate.total(start), 2);
        assert_eq!(g.rejections().1, 10);
    }

    #[test]
    fn snapshot_swap_keeps_old_arc_valid() {
        let g = guard(4, 100);
        let before = g.current_config();
        g.apply_snapshot(BudgetConfig {
            max_concurrent_operations: 8,
            ..BudgetConfig::default()
        })
        .unwrap();
        assert_eq!(before.max_concurrent_operations, 4);
        assert_eq!(g.current_config().max_concurrent_operations, 8);
        assert_eq!(g.health().origin, ConfigOrigin::Fetched);
    }

    #[test]
    fn invalid_snapshot_is_refused() {
        let g = guard(4, 100);
        let bad = BudgetConfig {
            light_pressure_threshold: 0.99,
            ..BudgetConfig::default()
        };
        assert!(g.apply_snapshot(bad).is_err());
        assert_eq!(g.current_config().max_concurrent_operations, 4);
    }

    #[test]
    fn degraded_mode_distinguishes_defaults_from_last_known_good() {
        let g = BudgetGuard::default();
        g.record_refresh_failure("connection refused");
        let h = g.health();
        assert!(h.degraded);
        assert_eq!(h.origin, ConfigOrigin::Defaults);
        assert_eq!(h.consecutive_failures, 1);

        g.apply_snapshot(BudgetConfig::default()).unwrap();
        assert!(!g.health().degraded);

        g.record_refresh_failure("timeout");
        let h = g.health();
        assert!(h.degraded);
        assert_eq!(h.origin, ConfigOrigin::Fetched);
        assert_eq!(h.last_error.as_deref(), Some("timeout"));
    }

    #[test]
    fn resource_advisory() {
        let g = BudgetGuard::new(BudgetConfig {
            max_memory_mb: 100,
            max_cpu_percent: 50.0,
            ..BudgetConfig::default()
        });
        g.observe_resources(150 * 1024 * 1024, 10.0);
        assert_eq!(
            g.advisory(),
            ResourceAdvisory { memory_over: true, cpu_over: false }
        );
        // Advisory never blocks admission.
        assert!(g.check().is_ok());
    }
}
