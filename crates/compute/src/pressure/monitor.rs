use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use tickgate_core::{BudgetConfig, PressureConfig};

use crate::budget::BudgetGuard;

use super::probe::ResourceProbe;

/// Saturation at or above which pressure is critical: a ceiling is reached.
const CRITICAL_SATURATION: f64 = 1.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
#[repr(u8)]
pub enum PressureLevel {
    Normal = 0,
    Light = 1,
    Moderate = 2,
    Heavy = 3,
    Critical = 4,
}

impl PressureLevel {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => PressureLevel::Normal,
            1 => PressureLevel::Light,
            2 => PressureLevel::Moderate,
            3 => PressureLevel::Heavy,
            _ => PressureLevel::Critical,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            PressureLevel::Normal => "normal",
            PressureLevel::Light => "light",
            PressureLevel::Moderate => "moderate",
            PressureLevel::Heavy => "heavy",
            PressureLevel::Critical => "critical",
        }
    }

    /// Saturation that enters this level.
    fn threshold(self, budget: &BudgetConfig) -> f64 {
        match self {
            PressureLevel::Normal => 0.0,
            PressureLevel::Light => budget.light_pressure_threshold,
            PressureLevel::Moderate => budget.moderate_pressure_threshold,
            PressureLevel::Heavy => budget.heavy_pressure_threshold,
            PressureLevel::Critical => CRITICAL_SATURATION,
        }
    }

    /// Highest level whose threshold `saturation` reaches.
    fn for_saturation(saturation: f64, budget: &BudgetConfig) -> Self {
        [
            PressureLevel::Critical,
            PressureLevel::Heavy,
            PressureLevel::Moderate,
            PressureLevel::Light,
        ]
        .into_iter()
        .find(|level| saturation >= level.threshold(budget))
        .unwrap_or(PressureLevel::Normal)
    }
}

impl std::fmt::Display for PressureLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The ceiling that was most saturated in a sample.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
#[repr(u8)]
pub enum PressureMetric {
    Concurrency = 0,
    QueueDepth = 1,
    Memory = 2,
    Cpu = 3,
    RequestRate = 4,
}

impl PressureMetric {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => PressureMetric::Concurrency,
            1 => PressureMetric::QueueDepth,
            2 => PressureMetric::Memory,
            3 => PressureMetric::Cpu,
            _ => PressureMetric::RequestRate,
        }
    }
}

/// Aggregate depth of the worker queues.
pub trait QueueGauge: Send + Sync {
    fn depth(&self) -> usize;
    fn capacity(&self) -> usize;
}

#[derive(Debug, Clone, Serialize)]
pub struct PressureSample {
    pub timestamp: DateTime<Utc>,
    pub queue_depth_total: usize,
    pub in_flight_total: u32,
    pub memory_pct: f64,
    pub cpu_pct: f64,
    /// Admissions counted in the last minute.
    pub request_rate: u64,
    /// Queue-full events since the previous sample.
    pub queue_full_events: u64,
    /// Fraction of the most saturated ceiling.
    pub saturation: f64,
    pub metric: PressureMetric,
    /// Level published after this sample.
    pub level: PressureLevel,
}

/// Bounded FIFO of recent samples.
#[derive(Debug)]
struct RingBuffer<T> {
    buf: VecDeque<T>,
    capacity: usize,
}

impl<T> RingBuffer<T> {
    fn new(capacity: usize) -> Self {
        Self {
            buf: VecDeque::with_capacity(capacity),
            capacity: capacity.max(1),
        }
    }

    fn push(&mut self, item: T) {
        if self.buf.len() == self.capacity {
            self.buf.pop_front();
        }
        self.buf.push_back(item);
    }

    fn iter(&self) -> impl Iterator<Item = &T> {
        self.buf.iter()
    }

    fn back(&self) -> Option<&T> {
        self.buf.back()
    }
}

#[derive(Debug)]
struct MonitorState {
    below_streak: u32,
    queue_full_seen: u64,
    window: RingBuffer<PressureSample>,
    transitions: u64,
}

/// Publishes a pressure level from periodic samples.
///
/// Single writer (the sampling task), many readers: the level and its
/// contributing metric are atomics, the sample window sits behind a mutex
/// only the sampler holds for more than a copy.
pub struct BackpressureMonitor {
    config: PressureConfig,
    budget: Arc<BudgetGuard>,
    probe: Arc<dyn ResourceProbe>,
    queues: Mutex<Option<Arc<dyn QueueGauge>>>,
    level: AtomicU8,
    metric: AtomicU8,
    queue_full: AtomicU64,
    state: Mutex<MonitorState>,
}

impl BackpressureMonitor {
    pub fn new(config: PressureConfig, budget: Arc<BudgetGuard>, probe: Arc<dyn ResourceProbe>) -> Self {
        let window = RingBuffer::new(config.window_size);
        Self {
            config,
            budget,
            probe,
            queues: Mutex::new(None),
            level: AtomicU8::new(PressureLevel::Normal as u8),
            metric: AtomicU8::new(PressureMetric::Concurrency as u8),
            queue_full: AtomicU64::new(0),
            state: Mutex::new(MonitorState {
                below_streak: 0,
                queue_full_seen: 0,
                window,
                transitions: 0,
            }),
        }
    }

    /// Attach the worker queues once the pool exists.
    pub fn attach_queues(&self, gauge: Arc<dyn QueueGauge>) {
        *self.queues.lock().unwrap_or_else(|p| p.into_inner()) = Some(gauge);
    }

    pub fn level(&self) -> PressureLevel {
        PressureLevel::from_u8(self.level.load(Ordering::Acquire))
    }

    /// Current level and the metric that drove it.
    pub fn current(&self) -> (PressureLevel, PressureMetric) {
        (
            self.level(),
            PressureMetric::from_u8(self.metric.load(Ordering::Acquire)),
        )
    }

    /// An enqueue found its target queue full.
    pub fn record_queue_full(&self) {
        self.queue_full.fetch_add(1, Ordering::Relaxed);
    }

    pub fn queue_full_total(&self) -> u64 {
        self.queue_full.load(Ordering::Relaxed)
    }

    pub fn latest(&self) -> Option<PressureSample> {
        self.lock_state().window.back().cloned()
    }

    pub fn window(&self) -> Vec<PressureSample> {
        self.lock_state().window.iter().cloned().collect()
    }

    /// Level changes published so far.
    pub fn transitions(&self) -> u64 {
        self.lock_state().transitions
    }

    fn lock_state(&self) -> std::sync::MutexGuard<'_, MonitorState> {
        self.state.lock().unwrap_or_else(|p| p.into_inner())
    }

    /// Take one sample and publish the resulting level.
    pub fn sample_now(&self) -> PressureSample {
        let budget = self.budget.current_config();
        let reading = self.probe.sample();
        self.budget
            .observe_resources(reading.memory_bytes, reading.cpu_percent);

        let (depth, capacity) = match &*self.queues.lock().unwrap_or_else(|p| p.into_inner()) {
            Some(g) => (g.depth(), g.capacity()),
            None => (0, 0),
        };
        let in_flight = self.budget.in_flight();
        let rate = self.budget.requests_last_minute();
        let memory_mb = reading.memory_bytes as f64 / (1024.0 * 1024.0);

        let mut state = self.lock_state();
        let full_total = self.queue_full.load(Ordering::Relaxed);
        let full_events = full_total.saturating_sub(state.queue_full_seen);
        state.queue_full_seen = full_total;

        let mut queue_ratio = ratio(depth as f64, capacity as f64);
        if full_events > 0 {
            queue_ratio = queue_ratio.max(budget.heavy_pressure_threshold);
        }
        let candidates = [
            (PressureMetric::Concurrency, ratio(in_flight as f64, budget.max_concurrent_operations as f64)),
            (PressureMetric::QueueDepth, queue_ratio),
            (PressureMetric::Memory, ratio(memory_mb, budget.max_memory_mb as f64)),
            (PressureMetric::Cpu, ratio(reading.cpu_percent, budget.max_cpu_percent)),
            (PressureMetric::RequestRate, ratio(rate as f64, budget.max_request_rate_per_minute as f64)),
        ];
        let (metric, saturation) = candidates
            .into_iter()
            .fold((PressureMetric::Concurrency, f64::MIN), |best, c| {
                if c.1 > best.1 { c } else { best }
            });

        let level = self.step(&mut state, saturation, metric, &budget);

        let sample = PressureSample {
            timestamp: Utc::now(),
            queue_depth_total: depth,
            in_flight_total: in_flight,
            memory_pct: ratio(memory_mb, budget.max_memory_mb as f64) * 100.0,
            cpu_pct: reading.cpu_percent,
            request_rate: rate,
            queue_full_events: full_events,
            saturation,
            metric,
            level,
        };
        state.window.push(sample.clone());
        sample
    }

    /// Apply hysteresis and publish. Stepping up is immediate and may skip
    /// levels; stepping down needs `step_down_samples` consecutive samples at
    /// least `hysteresis_margin` below the current level's threshold.
    fn step(
        &self,
        state: &mut MonitorState,
        saturation: f64,
        metric: PressureMetric,
        budget: &BudgetConfig,
    ) -> PressureLevel {
        let current = self.level();
        let target = PressureLevel::for_saturation(saturation, budget);

        if target > current {
            state.below_streak = 0;
            self.publish(state, current, target, metric, saturation);
            return target;
        }

        let floor = current.threshold(budget) - self.config.hysteresis_margin;
        if current > PressureLevel::Normal && saturation < floor {
            state.below_streak += 1;
            if state.below_streak >= self.config.step_down_samples.max(1) {
                state.below_streak = 0;
                let lowered = PressureLevel::for_saturation(saturation + self.config.hysteresis_margin, budget)
                    .min(current);
                if lowered < current {
                    self.publish(state, current, lowered, metric, saturation);
                    return lowered;
                }
            }
        } else {
            state.below_streak = 0;
        }

        if current == target {
            self.metric.store(metric as u8, Ordering::Release);
        }
        current
    }

    fn publish(
        &self,
        state: &mut MonitorState,
        from: PressureLevel,
        to: PressureLevel,
        metric: PressureMetric,
        saturation: f64,
    ) {
        self.level.store(to as u8, Ordering::Release);
        self.metric.store(metric as u8, Ordering::Release);
        state.transitions += 1;
        if to > from {
            info!(from = %from, to = %to, ?metric, saturation, "Pressure rising");
        } else {
            debug!(from = %from, to = %to, ?metric, saturation, "Pressure easing");
        }
    }

    /// Sample every `sample_interval` until `shutdown` flips to true.
    pub fn spawn(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.config.sample_interval());
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        self.sample_now();
                    }
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            break;
                        }
                    }
                }
            }
            debug!("Backpressure monitor stopped");
        })
    }
}

fn ratio(value: f64, ceiling: f64) -> f64 {
    if ceiling > 0.0 { value / ceiling } else { 0.0 }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;

    use super::*;
    use crate::pressure::ManualProbe;

    struct FixedQueues {
        depth: AtomicUsize,
        capacity: usize,
    }

    impl QueueGauge for FixedQueues {
        fn depth(&self) -> usize {
            self.depth.load(Ordering::Relaxed)
        }
        fn capacity(&self) -> usize {
            self.capacity
        }
    }

    fn monitor(margin: f64, samples: u32) -> (Arc<ManualProbe>, BackpressureMonitor) {
        let probe = Arc::new(ManualProbe::new());
        let budget = Arc::new(BudgetGuard::new(BudgetConfig {
            max_memory_mb: 1000,
            max_cpu_percent: 100.0,
            ..BudgetConfig::default()
        }));
        let config = PressureConfig {
            hysteresis_margin: margin,
            step_down_samples: samples,
            ..PressureConfig::default()
        };
        (probe.clone(), BackpressureMonitor::new(config, budget, probe))
    }

    #[test]
    fn levels_follow_thresholds() {
        let (probe, m) = monitor(0.10, 2);
        probe.set_memory_mb(500);
        assert_eq!(m.sample_now().level, PressureLevel::Normal);
        probe.set_memory_mb(720);
        assert_eq!(m.sample_now().level, PressureLevel::Light);
        probe.set_memory_mb(960);
        let s = m.sample_now();
        assert_eq!(s.level, PressureLevel::Heavy);
        assert_eq!(s.metric, PressureMetric::Memory);
        probe.set_memory_mb(1000);
        assert_eq!(m.sample_now().level, PressureLevel::Critical);
    }

    #[test]
    fn step_up_may_skip_levels() {
        let (probe, m) = monitor(0.10, 2);
        probe.set_memory_mb(990);
        assert_eq!(m.sample_now().level, PressureLevel::Heavy);
        assert_eq!(m.transitions(), 1);
    }

    #[test]
    fn step_down_requires_margin_and_consecutive_samples() {
        let (probe, m) = monitor(0.10, 2);
        probe.set_memory_mb(900);
        assert_eq!(m.sample_now().level, PressureLevel::Moderate);

        // Just below the threshold but inside the margin: stays.
        probe.set_memory_mb(800);
        assert_eq!(m.sample_now().level, PressureLevel::Moderate);
        assert_eq!(m.sample_now().level, PressureLevel::Moderate);

        // Below the margin, first sample: stays.
        probe.set_memory_mb(700);
        assert_eq!(m.sample_now().level, PressureLevel::Moderate);
        // Second consecutive sample: steps down, to light (0.70 + 0.10 >= 0.70).
        assert_eq!(m.sample_now().level, PressureLevel::Light);
    }

    #[test]
    fn interrupted_streak_resets() {
        let (probe, m) = monitor(0.10, 2);
        probe.set_memory_mb(900);
        m.sample_now();
        probe.set_memory_mb(100);
        m.sample_now();
        probe.set_memory_mb(860);
        m.sample_now();
        probe.set_memory_mb(100);
        assert_eq!(m.sample_now().level, PressureLevel::Moderate);
        assert_eq!(m.sample_now().level, PressureLevel::Normal);
    }

    #[test]
    fn noisy_constant_load_does_not_flap() {
        let (probe, m) = monitor(0.10, 2);
        // Oscillate around the light threshold.
        for i in 0..50 {
            probe.set_memory_mb(if i % 2 == 0 { 690 } else { 710 });
            m.sample_now();
        }
        assert_eq!(m.level(), PressureLevel::Light);
        assert_eq!(m.transitions(), 1);
    }

    #[test]
    fn queue_full_signal_raises_pressure() {
        let (_probe, m) = monitor(0.10, 2);
        let queues = Arc::new(FixedQueues {
            depth: AtomicUsize::new(10),
            capacity: 1000,
        });
        m.attach_queues(queues);
        assert_eq!(m.sample_now().level, PressureLevel::Normal);
        m.record_queue_full();
        let s = m.sample_now();
        assert_eq!(s.level, PressureLevel::Heavy);
        assert_eq!(s.metric, PressureMetric::QueueDepth);
        assert_eq!(s.queue_full_events, 1);
    }

    #[test]
    fn window_is_bounded() {
        let probe = Arc::new(ManualProbe::new());
        let config = PressureConfig {
            window_size: 3,
            ..PressureConfig::default()
        };
        let m = BackpressureMonitor::new(config, Arc::new(BudgetGuard::default()), probe);
        for _ in 0..10 {
            m.sample_now();
        }
        assert_eq!(m.window().len(), 3);
        assert!(m.latest().is_some());
    }
}
