use std::env;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::control::{BreakerConfig, BudgetConfig};

/// Load .env file (silently ignores if missing).
pub fn load_dotenv() {
    dotenvy::dotenv().ok();
}

fn env_or(key: &str, default: &str) -> String {
    env::var(key).unwrap_or_else(|_| default.to_string())
}

fn env_opt(key: &str) -> Option<String> {
    env::var(key).ok().filter(|s| !s.is_empty())
}

/// Read a profiled env var: tries {PROFILE}_{KEY} first, falls back to {KEY}.
fn profiled_env_opt(profile: &str, key: &str) -> Option<String> {
    if !profile.is_empty() {
        let prefixed = format!("{}_{}", profile, key);
        if let Some(v) = env_opt(&prefixed) {
            return Some(v);
        }
    }
    env_opt(key)
}

fn profiled_env_parse<T: FromStr>(profile: &str, key: &str, default: T) -> T {
    profiled_env_opt(profile, key)
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn profiled_env_bool(profile: &str, key: &str, default: bool) -> bool {
    match profiled_env_opt(profile, key).as_deref() {
        Some("1") | Some("true") | Some("yes") => true,
        Some("0") | Some("false") | Some("no") => false,
        _ => default,
    }
}

// ── Top-level config ──────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Active profile name (empty = default).
    pub profile: String,
    pub pool: PoolConfig,
    pub pressure: PressureConfig,
    pub shedder: ShedderConfig,
    /// Built-in budget used until the control source answers.
    pub budget: BudgetConfig,
    /// Breaker thresholds for dependencies without an explicit override.
    pub breaker: BreakerConfig,
    pub control: ControlSourceConfig,
}

impl Config {
    /// Build config from environment variables (call `load_dotenv()` first).
    /// Profile is read from `TICKGATE_PROFILE`. When set (e.g. `PROD`),
    /// every key is first looked up as `{PROFILE}_{KEY}`, falling back to `{KEY}`.
    pub fn from_env() -> Self {
        let profile = env_or("TICKGATE_PROFILE", "").to_uppercase();
        Self::for_profile(&profile)
    }

    /// Build config for a specific named profile (empty string = default).
    pub fn for_profile(profile: &str) -> Self {
        let p = profile.to_uppercase();
        let p = p.as_str();
        Self {
            profile: p.to_string(),
            pool: PoolConfig::from_env_profiled(p),
            pressure: PressureConfig::from_env_profiled(p),
            shedder: ShedderConfig::from_env_profiled(p),
            budget: BudgetConfig::from_env_profiled(p),
            breaker: BreakerConfig::from_env_profiled(p),
            control: ControlSourceConfig::from_env_profiled(p),
        }
    }

    pub fn profile_label(&self) -> &str {
        if self.profile.is_empty() { "default" } else { &self.profile }
    }

    /// Print a summary for startup logs.
    pub fn log_summary(&self) {
        tracing::info!("Config loaded (profile: {}):", self.profile_label());
        tracing::info!(
            "  pool:      workers={}, shards/worker={}, vnodes={}, queue_capacity={}, steal_batch={}",
            self.pool.resolved_worker_count(),
            self.pool.shards_per_worker,
            self.pool.virtual_nodes,
            self.pool.queue_capacity,
            self.pool.steal_batch
        );
        tracing::info!(
            "  pressure:  interval={}ms, margin={}, step_down_samples={}",
            self.pressure.sample_interval_ms,
            self.pressure.hysteresis_margin,
            self.pressure.step_down_samples
        );
        tracing::info!(
            "  budget:    concurrency={}, memory={}MB, cpu={}%, rate={}/min",
            self.budget.max_concurrent_operations,
            self.budget.max_memory_mb,
            self.budget.max_cpu_percent,
            self.budget.max_request_rate_per_minute
        );
        tracing::info!(
            "  control:   file={}, refresh={}s",
            self.control
                .file
                .as_ref()
                .map(|p| p.display().to_string())
                .unwrap_or_else(|| "(env)".into()),
            self.control.refresh_secs
        );
    }

    /// Return a JSON view for API responses and diagnostics.
    pub fn redacted_summary(&self) -> serde_json::Value {
        serde_json::json!({
            "profile": self.profile_label(),
            "pool": {
                "workers": self.pool.resolved_worker_count(),
                "total_shards": self.pool.total_shards(),
                "virtual_nodes": self.pool.virtual_nodes,
                "queue_capacity": self.pool.queue_capacity,
                "steal_batch": self.pool.steal_batch,
            },
            "pressure": {
                "sample_interval_ms": self.pressure.sample_interval_ms,
                "hysteresis_margin": self.pressure.hysteresis_margin,
            },
            "budget": self.budget,
            "breaker_defaults": self.breaker,
            "control": {
                "file": self.control.file,
                "refresh_secs": self.control.refresh_secs,
            },
        })
    }
}

// ── Worker pool ───────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolConfig {
    /// Number of workers. 0 = available parallelism.
    pub worker_count: usize,
    /// Total shards = shards_per_worker × initial worker count, fixed for the process.
    pub shards_per_worker: u32,
    /// Virtual nodes per worker on the assignment ring.
    pub virtual_nodes: u32,
    /// Bounded capacity of each worker's local queue.
    pub queue_capacity: usize,
    /// Maximum items taken in one steal.
    pub steal_batch: usize,
    /// Consecutive steals of one shard by the same thief that trigger a rebalance.
    pub rebalance_steal_threshold: u32,
    pub rebalance_window_ms: u64,
    /// How long a rebalance waits for a shard's pending items before giving up.
    pub rebalance_drain_timeout_ms: u64,
    /// Idle wait between steal attempts.
    pub idle_park_ms: u64,
    /// Replace a worker that panicked.
    pub respawn_on_failure: bool,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            worker_count: 0,
            shards_per_worker: 10,
            virtual_nodes: 100,
            queue_capacity: 1024,
            steal_batch: 4,
            rebalance_steal_threshold: 8,
            rebalance_window_ms: 5_000,
            rebalance_drain_timeout_ms: 50,
            idle_park_ms: 2,
            respawn_on_failure: true,
        }
    }
}

impl PoolConfig {
    fn from_env_profiled(p: &str) -> Self {
        let d = Self::default();
        Self {
            worker_count: profiled_env_parse(p, "WORKER_COUNT", d.worker_count),
            shards_per_worker: profiled_env_parse(p, "SHARDS_PER_WORKER", d.shards_per_worker),
            virtual_nodes: profiled_env_parse(p, "VIRTUAL_NODES", d.virtual_nodes),
            queue_capacity: profiled_env_parse(p, "QUEUE_CAPACITY", d.queue_capacity),
            steal_batch: profiled_env_parse(p, "STEAL_BATCH", d.steal_batch),
            rebalance_steal_threshold: profiled_env_parse(p, "REBALANCE_STEAL_THRESHOLD", d.rebalance_steal_threshold),
            rebalance_window_ms: profiled_env_parse(p, "REBALANCE_WINDOW_MS", d.rebalance_window_ms),
            rebalance_drain_timeout_ms: profiled_env_parse(p, "REBALANCE_DRAIN_TIMEOUT_MS", d.rebalance_drain_timeout_ms),
            idle_park_ms: profiled_env_parse(p, "IDLE_PARK_MS", d.idle_park_ms),
            respawn_on_failure: profiled_env_bool(p, "RESPAWN_ON_FAILURE", d.respawn_on_failure),
        }
    }

    /// Resolve worker count (0 means use available parallelism).
    pub fn resolved_worker_count(&self) -> usize {
        if self.worker_count == 0 {
            std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(4)
        } else {
            self.worker_count
        }
    }

    pub fn total_shards(&self) -> u32 {
        (self.resolved_worker_count() as u32).max(1) * self.shards_per_worker.max(1)
    }

    pub fn rebalance_window(&self) -> Duration {
        Duration::from_millis(self.rebalance_window_ms)
    }

    pub fn rebalance_drain_timeout(&self) -> Duration {
        Duration::from_millis(self.rebalance_drain_timeout_ms)
    }

    pub fn idle_park(&self) -> Duration {
        Duration::from_millis(self.idle_park_ms.max(1))
    }
}

// ── Backpressure ──────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PressureConfig {
    pub sample_interval_ms: u64,
    /// Absolute fraction a metric must fall below a threshold before stepping down.
    pub hysteresis_margin: f64,
    /// Consecutive qualifying samples required to step down.
    pub step_down_samples: u32,
    /// Samples retained in the rolling window.
    pub window_size: usize,
}

impl Default for PressureConfig {
    fn default() -> Self {
        Self {
            sample_interval_ms: 1_000,
            hysteresis_margin: 0.10,
            step_down_samples: 2,
            window_size: 60,
        }
    }
}

impl PressureConfig {
    fn from_env_profiled(p: &str) -> Self {
        let d = Self::default();
        Self {
            sample_interval_ms: profiled_env_parse(p, "PRESSURE_SAMPLE_INTERVAL_MS", d.sample_interval_ms),
            hysteresis_margin: profiled_env_parse(p, "PRESSURE_HYSTERESIS_MARGIN", d.hysteresis_margin),
            step_down_samples: profiled_env_parse(p, "PRESSURE_STEP_DOWN_SAMPLES", d.step_down_samples),
            window_size: profiled_env_parse(p, "PRESSURE_WINDOW", d.window_size),
        }
    }

    pub fn sample_interval(&self) -> Duration {
        Duration::from_millis(self.sample_interval_ms.max(1))
    }
}

// ── Load shedder ──────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShedderConfig {
    /// Base backoff for low-priority work under heavy pressure.
    pub delay_base_ms: u64,
    pub delay_max_ms: u64,
    /// Jitter as a fraction of the computed delay (0.5 = ±50%).
    pub delay_jitter: f64,
    /// Delays honoured before a low-priority item is rejected outright.
    pub max_delay_rounds: u32,
}

impl Default for ShedderConfig {
    fn default() -> Self {
        Self {
            delay_base_ms: 25,
            delay_max_ms: 1_000,
            delay_jitter: 0.5,
            max_delay_rounds: 3,
        }
    }
}

impl ShedderConfig {
    fn from_env_profiled(p: &str) -> Self {
        let d = Self::default();
        Self {
            delay_base_ms: profiled_env_parse(p, "SHED_DELAY_BASE_MS", d.delay_base_ms),
            delay_max_ms: profiled_env_parse(p, "SHED_DELAY_MAX_MS", d.delay_max_ms),
            delay_jitter: profiled_env_parse(p, "SHED_DELAY_JITTER", d.delay_jitter),
            max_delay_rounds: profiled_env_parse(p, "SHED_MAX_DELAY_ROUNDS", d.max_delay_rounds),
        }
    }
}

// ── Budget & breaker (env flavour) ────────────────────────────

impl BudgetConfig {
    /// Budget from `BUDGET_*` env keys, falling back to built-in defaults per field.
    pub fn from_env_profiled(p: &str) -> Self {
        let d = BudgetConfig::default();
        Self {
            max_concurrent_operations: profiled_env_parse(p, "BUDGET_MAX_CONCURRENT_OPERATIONS", d.max_concurrent_operations),
            max_memory_mb: profiled_env_parse(p, "BUDGET_MAX_MEMORY_MB", d.max_memory_mb),
            max_cpu_percent: profiled_env_parse(p, "BUDGET_MAX_CPU_PERCENT", d.max_cpu_percent),
            max_request_rate_per_minute: profiled_env_parse(p, "BUDGET_MAX_REQUEST_RATE_PER_MINUTE", d.max_request_rate_per_minute),
            max_processing_time_ms: profiled_env_parse(p, "BUDGET_MAX_PROCESSING_TIME_MS", d.max_processing_time_ms),
            light_pressure_threshold: profiled_env_parse(p, "BUDGET_LIGHT_PRESSURE_THRESHOLD", d.light_pressure_threshold),
            moderate_pressure_threshold: profiled_env_parse(p, "BUDGET_MODERATE_PRESSURE_THRESHOLD", d.moderate_pressure_threshold),
            heavy_pressure_threshold: profiled_env_parse(p, "BUDGET_HEAVY_PRESSURE_THRESHOLD", d.heavy_pressure_threshold),
        }
    }
}

impl BreakerConfig {
    pub fn from_env_profiled(p: &str) -> Self {
        let d = BreakerConfig::default();
        Self {
            failure_threshold: profiled_env_parse(p, "BREAKER_FAILURE_THRESHOLD", d.failure_threshold),
            failure_window_ms: profiled_env_parse(p, "BREAKER_FAILURE_WINDOW_MS", d.failure_window_ms),
            cooldown_ms: profiled_env_parse(p, "BREAKER_COOLDOWN_MS", d.cooldown_ms),
            half_open_trials: profiled_env_parse(p, "BREAKER_HALF_OPEN_TRIALS", d.half_open_trials),
            success_threshold: profiled_env_parse(p, "BREAKER_SUCCESS_THRESHOLD", d.success_threshold),
        }
    }
}

// ── Control source ────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ControlSourceConfig {
    /// TOML file holding `[budget]` and `[breakers.<name>]`; env is used when absent.
    pub file: Option<PathBuf>,
    /// Refresh TTL in seconds.
    pub refresh_secs: u64,
}

impl ControlSourceConfig {
    fn from_env_profiled(p: &str) -> Self {
        Self {
            file: profiled_env_opt(p, "TICKGATE_CONTROL_FILE").map(PathBuf::from),
            refresh_secs: profiled_env_parse(p, "CONTROL_REFRESH_SECS", 60),
        }
    }

    pub fn refresh_interval(&self) -> Duration {
        Duration::from_secs(self.refresh_secs.max(1))
    }
}
