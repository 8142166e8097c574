//! Runtime-refreshable control configuration: resource budget ceilings and
//! per-dependency circuit breaker thresholds.
//!
//! These values are pulled from an external source on a TTL and published as
//! immutable snapshots; nothing here is mutated in place after validation.

use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::CoreError;

// ── Budget ────────────────────────────────────────────────────

/// Process-wide resource ceilings and pressure thresholds.
///
/// Thresholds are fractions of the most saturated ceiling.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BudgetConfig {
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent_operations: u32,
    #[serde(default = "default_max_memory_mb")]
    pub max_memory_mb: u64,
    #[serde(default = "default_max_cpu_percent")]
    pub max_cpu_percent: f64,
    #[serde(default = "default_max_rate")]
    pub max_request_rate_per_minute: u64,
    #[serde(default = "default_max_processing_ms")]
    pub max_processing_time_ms: u64,
    #[serde(default = "default_light")]
    pub light_pressure_threshold: f64,
    #[serde(default = "default_moderate")]
    pub moderate_pressure_threshold: f64,
    #[serde(default = "default_heavy")]
    pub heavy_pressure_threshold: f64,
}

fn default_max_concurrent() -> u32 { 512 }
fn default_max_memory_mb() -> u64 { 2048 }
fn default_max_cpu_percent() -> f64 { 80.0 }
fn default_max_rate() -> u64 { 60_000 }
fn default_max_processing_ms() -> u64 { 30_000 }
fn default_light() -> f64 { 0.70 }
fn default_moderate() -> f64 { 0.85 }
fn default_heavy() -> f64 { 0.95 }

impl Default for BudgetConfig {
    fn default() -> Self {
        Self {
            max_concurrent_operations: default_max_concurrent(),
            max_memory_mb: default_max_memory_mb(),
            max_cpu_percent: default_max_cpu_percent(),
            max_request_rate_per_minute: default_max_rate(),
            max_processing_time_ms: default_max_processing_ms(),
            light_pressure_threshold: default_light(),
            moderate_pressure_threshold: default_moderate(),
            heavy_pressure_threshold: default_heavy(),
        }
    }
}

impl BudgetConfig {
    pub fn max_processing_time(&self) -> Duration {
        Duration::from_millis(self.max_processing_time_ms)
    }

    /// Reject ceilings of zero and thresholds that are not strictly increasing in (0, 1].
    pub fn validate(&self) -> Result<(), CoreError> {
        if self.max_concurrent_operations == 0 {
            return Err(CoreError::InvalidConfig("max_concurrent_operations must be > 0".into()));
        }
        if self.max_memory_mb == 0 {
            return Err(CoreError::InvalidConfig("max_memory_mb must be > 0".into()));
        }
        if !(self.max_cpu_percent > 0.0) {
            return Err(CoreError::InvalidConfig("max_cpu_percent must be > 0".into()));
        }
        if self.max_request_rate_per_minute == 0 {
            return Err(CoreError::InvalidConfig("max_request_rate_per_minute must be > 0".into()));
        }
        if self.max_processing_time_ms == 0 {
            return Err(CoreError::InvalidConfig("max_processing_time_ms must be > 0".into()));
        }
        let (l, m, h) = (
            self.light_pressure_threshold,
            self.moderate_pressure_threshold,
            self.heavy_pressure_threshold,
        );
        if !(0.0 < l && l < m && m < h && h <= 1.0) {
            return Err(CoreError::InvalidConfig(format!(
                "pressure thresholds must satisfy 0 < light < moderate < heavy <= 1 (got {l}, {m}, {h})"
            )));
        }
        Ok(())
    }
}

// ── Circuit breaker ───────────────────────────────────────────

/// Thresholds for one dependency's circuit breaker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BreakerConfig {
    /// Failures inside `failure_window_ms` that open the circuit.
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,
    #[serde(default = "default_failure_window_ms")]
    pub failure_window_ms: u64,
    /// How long an open circuit fails fast before allowing trials.
    #[serde(default = "default_cooldown_ms")]
    pub cooldown_ms: u64,
    /// Maximum concurrent trial calls while half-open.
    #[serde(default = "default_half_open_trials")]
    pub half_open_trials: u32,
    /// Consecutive trial successes that close the circuit.
    #[serde(default = "default_success_threshold")]
    pub success_threshold: u32,
}

fn default_failure_threshold() -> u32 { 5 }
fn default_failure_window_ms() -> u64 { 60_000 }
fn default_cooldown_ms() -> u64 { 30_000 }
fn default_half_open_trials() -> u32 { 3 }
fn default_success_threshold() -> u32 { 3 }

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: default_failure_threshold(),
            failure_window_ms: default_failure_window_ms(),
            cooldown_ms: default_cooldown_ms(),
            half_open_trials: default_half_open_trials(),
            success_threshold: default_success_threshold(),
        }
    }
}

impl BreakerConfig {
    pub fn failure_window(&self) -> Duration {
        Duration::from_millis(self.failure_window_ms)
    }

    pub fn cooldown(&self) -> Duration {
        Duration::from_millis(self.cooldown_ms)
    }

    pub fn validate(&self) -> Result<(), CoreError> {
        if self.failure_threshold == 0 {
            return Err(CoreError::InvalidConfig("breaker failure_threshold must be > 0".into()));
        }
        if self.half_open_trials == 0 || self.success_threshold == 0 {
            return Err(CoreError::InvalidConfig(
                "breaker half_open_trials and success_threshold must be > 0".into(),
            ));
        }
        Ok(())
    }
}

// ── Control snapshot ──────────────────────────────────────────

/// One fetch from the control source.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ControlConfig {
    #[serde(default)]
    pub budget: BudgetConfig,
    /// Per-dependency breaker thresholds, keyed by dependency name.
    #[serde(default)]
    pub breakers: HashMap<String, BreakerConfig>,
}

impl ControlConfig {
    /// Parse and validate a TOML document.
    pub fn from_toml(toml_str: &str) -> Result<Self, CoreError> {
        let config: Self = toml::from_str(toml_str)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, CoreError> {
        let content = std::fs::read_to_string(path.as_ref())?;
        Self::from_toml(&content)
    }

    pub fn validate(&self) -> Result<(), CoreError> {
        self.budget.validate()?;
        for (name, breaker) in &self.breakers {
            breaker
                .validate()
                .map_err(|e| CoreError::InvalidConfig(format!("breaker '{name}': {e}")))?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        BudgetConfig::default().validate().unwrap();
        BreakerConfig::default().validate().unwrap();
        ControlConfig::default().validate().unwrap();
    }

    #[test]
    fn parse_partial_toml() {
        let cfg = ControlConfig::from_toml(
            r#"
[budget]
max_concurrent_operations = 64
max_memory_mb = 1024

[breakers.data_provider]
failure_threshold = 3
cooldown_ms = 500
"#,
        )
        .unwrap();
        assert_eq!(cfg.budget.max_concurrent_operations, 64);
        assert_eq!(cfg.budget.max_memory_mb, 1024);
        assert_eq!(cfg.budget.heavy_pressure_threshold, 0.95);
        let dp = &cfg.breakers["data_provider"];
        assert_eq!(dp.failure_threshold, 3);
        assert_eq!(dp.cooldown(), Duration::from_millis(500));
        assert_eq!(dp.success_threshold, 3);
    }

    #[test]
    fn rejects_unordered_thresholds() {
        let err = ControlConfig::from_toml(
            r#"
[budget]
light_pressure_threshold = 0.9
moderate_pressure_threshold = 0.8
"#,
        )
        .unwrap_err();
        assert!(matches!(err, CoreError::InvalidConfig(_)));
    }

    #[test]
    fn rejects_zero_breaker_threshold() {
        let err = ControlConfig::from_toml(
            r#"
[breakers.entitlements]
failure_threshold = 0
"#,
        )
        .unwrap_err();
        assert!(err.to_string().contains("entitlements"));
    }

    #[test]
    fn from_file_reads_toml() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("control.toml");
        std::fs::write(&path, "[budget]\nmax_request_rate_per_minute = 120\n").unwrap();
        let cfg = ControlConfig::from_file(&path).unwrap();
        assert_eq!(cfg.budget.max_request_rate_per_minute, 120);
    }
}
