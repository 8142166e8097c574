//! Per-dependency circuit breakers.
//!
//! Each named dependency (data provider, entitlement service, notification
//! service, ...) gets its own closed → open → half-open state machine. State
//! changes only happen inside [`CircuitBreaker`]; callers interact through
//! [`CircuitBreaker::call`] / [`BreakerRegistry::call`] and read
//! [`BreakerSnapshot`]s.

use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant};

use serde::Serialize;
use thiserror::Error;
use tracing::{info, warn};

use tickgate_core::BreakerConfig;

/// Breaker state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

/// Returned when a call was short-circuited: the dependency was never invoked.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("circuit open for '{dependency}', retry in {retry_after:?}")]
pub struct CircuitOpenError {
    pub dependency: String,
    pub retry_after: Duration,
}

/// Outcome of a guarded call: either short-circuited, or the callee's own error.
#[derive(Debug)]
pub enum BreakerError<E> {
    Open(CircuitOpenError),
    Inner(E),
}

impl<E> BreakerError<E> {
    pub fn is_open(&self) -> bool {
        matches!(self, BreakerError::Open(_))
    }

    pub fn into_inner(self) -> Option<E> {
        match self {
            BreakerError::Inner(e) => Some(e),
            BreakerError::Open(_) => None,
        }
    }
}

impl<E: Into<anyhow::Error>> BreakerError<E> {
    /// Convert for kernels that report `anyhow::Error`. The open case stays
    /// downcastable to [`CircuitOpenError`].
    pub fn into_anyhow(self) -> anyhow::Error {
        match self {
            BreakerError::Open(e) => anyhow::Error::new(e),
            BreakerError::Inner(e) => e.into(),
        }
    }
}

impl<E: std::fmt::Display> std::fmt::Display for BreakerError<E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BreakerError::Open(e) => write!(f, "{e}"),
            BreakerError::Inner(e) => write!(f, "{e}"),
        }
    }
}

impl<E: std::error::Error + 'static> std::error::Error for BreakerError<E> {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            BreakerError::Open(e) => Some(e),
            BreakerError::Inner(e) => Some(e),
        }
    }
}

/// Serializable view of one breaker.
#[derive(Debug, Clone, Serialize)]
pub struct BreakerSnapshot {
    pub dependency: String,
    pub state: CircuitState,
    /// Failures currently inside the rolling window.
    pub failure_count: u32,
    pub success_count_in_half_open: u32,
    /// Milliseconds since the circuit last opened.
    pub opened_ms_ago: Option<u64>,
    pub short_circuited_total: u64,
    pub config: BreakerConfig,
}

#[derive(Debug)]
struct Inner {
    config: BreakerConfig,
    state: CircuitState,
    failures: VecDeque<Instant>,
    half_open_successes: u32,
    half_open_in_flight: u32,
    opened_at: Option<Instant>,
    /// Bumped on every transition so late outcomes from an earlier phase are ignored.
    generation: u64,
    short_circuited: u64,
}

impl Inner {
    fn prune(&mut self, now: Instant) {
        let window = self.config.failure_window();
        while let Some(&oldest) = self.failures.front() {
            if now.duration_since(oldest) > window {
                self.failures.pop_front();
            } else {
                break;
            }
        }
    }

    fn transition(&mut self, name: &str, to: CircuitState, now: Instant) {
        let from = self.state;
        if from == to {
            return;
        }
        self.state = to;
        self.generation += 1;
        self.half_open_successes = 0;
        self.half_open_in_flight = 0;
        match to {
            CircuitState::Open => {
                self.opened_at = Some(now);
                warn!(dependency = name, ?from, "circuit opened");
            }
            CircuitState::HalfOpen => {
                info!(dependency = name, "circuit half-open, admitting trial calls");
            }
            CircuitState::Closed => {
                self.failures.clear();
                self.opened_at = None;
                info!(dependency = name, "circuit closed");
            }
        }
    }
}

/// Permission to make one call.
#[derive(Debug, Clone, Copy)]
struct Ticket {
    generation: u64,
    probe: bool,
}

/// Three-state breaker for a single dependency.
#[derive(Debug)]
pub struct CircuitBreaker {
    name: String,
    inner: Mutex<Inner>,
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, config: BreakerConfig) -> Self {
        Self {
            name: name.into(),
            inner: Mutex::new(Inner {
                config,
                state: CircuitState::Closed,
                failures: VecDeque::new(),
                half_open_successes: 0,
                half_open_in_flight: 0,
                opened_at: None,
                generation: 0,
                short_circuited: 0,
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Current state, applying the open → half-open cooldown if it elapsed.
    pub fn state(&self) -> CircuitState {
        let mut inner = self.lock();
        self.maybe_half_open(&mut inner, Instant::now());
        inner.state
    }

    fn maybe_half_open(&self, inner: &mut Inner, now: Instant) {
        if inner.state == CircuitState::Open {
            let opened = inner.opened_at.unwrap_or(now);
            if now.duration_since(opened) >= inner.config.cooldown() {
                inner.transition(&self.name, CircuitState::HalfOpen, now);
            }
        }
    }

    fn try_acquire(&self) -> Result<Ticket, CircuitOpenError> {
        let now = Instant::now();
        let mut inner = self.lock();
        self.maybe_half_open(&mut inner, now);
        let state = inner.state;
        match state {
            CircuitState::Closed => Ok(Ticket {
                generation: inner.generation,
                probe: false,
            }),
            CircuitState::HalfOpen if inner.half_open_in_flight < inner.config.half_open_trials => {
                inner.half_open_in_flight += 1;
                Ok(Ticket {
                    generation: inner.generation,
                    probe: true,
                })
            }
            CircuitState::HalfOpen => {
                inner.short_circuited += 1;
                Err(CircuitOpenError {
                    dependency: self.name.clone(),
                    retry_after: Duration::ZERO,
                })
            }
            CircuitState::Open => {
                inner.short_circuited += 1;
                let opened = inner.opened_at.unwrap_or(now);
                let retry_after = inner.config.cooldown().saturating_sub(now.duration_since(opened));
                Err(CircuitOpenError {
                    dependency: self.name.clone(),
                    retry_after,
                })
            }
        }
    }

    fn record_success(&self, ticket: Ticket) {
        let now = Instant::now();
        let mut inner = self.lock();
        if ticket.generation != inner.generation {
            return;
        }
        if inner.state == CircuitState::HalfOpen && ticket.probe {
            inner.half_open_in_flight = inner.half_open_in_flight.saturating_sub(1);
            inner.half_open_successes += 1;
            if inner.half_open_successes >= inner.config.success_threshold {
                inner.transition(&self.name, CircuitState::Closed, now);
            }
        }
    }

    fn record_failure(&self, ticket: Ticket) {
        let now = Instant::now();
        let mut inner = self.lock();
        if ticket.generation != inner.generation {
            return;
        }
        let state = inner.state;
        match state {
            CircuitState::HalfOpen => inner.transition(&self.name, CircuitState::Open, now),
            CircuitState::Closed => {
                inner.failures.push_back(now);
                inner.prune(now);
                if inner.failures.len() as u32 >= inner.config.failure_threshold {
                    inner.transition(&self.name, CircuitState::Open, now);
                }
            }
            CircuitState::Open => {}
        }
    }

    fn abandon(&self, ticket: Ticket) {
        let mut inner = self.lock();
        if ticket.generation == inner.generation && ticket.probe {
            inner.half_open_in_flight = inner.half_open_in_flight.saturating_sub(1);
        }
    }

    /// Run `f` through the breaker.
    pub fn call<T, E>(&self, f: impl FnOnce() -> Result<T, E>) -> Result<T, BreakerError<E>> {
        let ticket = self.try_acquire().map_err(BreakerError::Open)?;
        let guard = TicketGuard::new(self, ticket);
        let result = f();
        guard.finish(result.is_ok());
        result.map_err(BreakerError::Inner)
    }

    /// Async flavour of [`call`](Self::call). Dropping the future mid-call
    /// releases the trial slot without counting an outcome.
    pub async fn call_async<T, E, F, Fut>(&self, f: F) -> Result<T, BreakerError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let ticket = self.try_acquire().map_err(BreakerError::Open)?;
        let guard = TicketGuard::new(self, ticket);
        let result = f().await;
        guard.finish(result.is_ok());
        result.map_err(BreakerError::Inner)
    }

    /// Replace thresholds. The current state and counters are kept.
    pub fn reconfigure(&self, config: BreakerConfig) {
        let mut inner = self.lock();
        if inner.config != config {
            info!(dependency = %self.name, ?config, "breaker thresholds updated");
            inner.config = config;
        }
    }

    /// Force the breaker closed.
    pub fn reset(&self) {
        let mut inner = self.lock();
        inner.transition(&self.name, CircuitState::Closed, Instant::now());
        inner.failures.clear();
    }

    pub fn snapshot(&self) -> BreakerSnapshot {
        let now = Instant::now();
        let mut inner = self.lock();
        self.maybe_half_open(&mut inner, now);
        inner.prune(now);
        BreakerSnapshot {
            dependency: self.name.clone(),
            state: inner.state,
            failure_count: inner.failures.len() as u32,
            success_count_in_half_open: inner.half_open_successes,
            opened_ms_ago: inner
                .opened_at
                .map(|t| now.duration_since(t).as_millis() as u64),
            short_circuited_total: inner.short_circuited,
            config: inner.config.clone(),
        }
    }
}

/// Records the outcome exactly once; abandons the ticket if the call unwinds or is dropped.
struct TicketGuard<'a> {
    breaker: &'a CircuitBreaker,
    ticket: Ticket,
    done: bool,
}

impl<'a> TicketGuard<'a> {
    fn new(breaker: &'a CircuitBreaker, ticket: Ticket) -> Self {
        Self {
            breaker,
            ticket,
            done: false,
        }
    }

    fn finish(mut self, ok: bool) {
        self.done = true;
        if ok {
            self.breaker.record_success(self.ticket);
        } else {
            self.breaker.record_failure(self.ticket);
        }
    }
}

impl Drop for TicketGuard<'_> {
    fn drop(&mut self) {
        if !self.done {
            self.breaker.abandon(self.ticket);
        }
    }
}

// ── Registry ─────────────────────────────────────────────────

/// One breaker per named dependency, created on first use.
#[derive(Debug)]
pub struct BreakerRegistry {
    defaults: RwLock<BreakerConfig>,
    overrides: RwLock<HashMap<String, BreakerConfig>>,
    breakers: RwLock<HashMap<String, Arc<CircuitBreaker>>>,
}

impl BreakerRegistry {
    pub fn new(defaults: BreakerConfig) -> Self {
        Self {
            defaults: RwLock::new(defaults),
            overrides: RwLock::new(HashMap::new()),
            breakers: RwLock::new(HashMap::new()),
        }
    }

    fn config_for(&self, dependency: &str) -> BreakerConfig {
        let overrides = self.overrides.read().unwrap_or_else(|e| e.into_inner());
        match overrides.get(dependency) {
            Some(cfg) => cfg.clone(),
            None => self.defaults.read().unwrap_or_else(|e| e.into_inner()).clone(),
        }
    }

    /// Breaker for `dependency`, created with its configured thresholds on first use.
    pub fn breaker(&self, dependency: &str) -> Arc<CircuitBreaker> {
        if let Some(b) = self
            .breakers
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(dependency)
        {
            return Arc::clone(b);
        }
        let config = self.config_for(dependency);
        let mut breakers = self.breakers.write().unwrap_or_else(|e| e.into_inner());
        Arc::clone(
            breakers
                .entry(dependency.to_string())
                .or_insert_with(|| Arc::new(CircuitBreaker::new(dependency, config))),
        )
    }

    pub fn call<T, E>(
        &self,
        dependency: &str,
        f: impl FnOnce() -> Result<T, E>,
    ) -> Result<T, BreakerError<E>> {
        self.breaker(dependency).call(f)
    }

    pub async fn call_async<T, E, F, Fut>(&self, dependency: &str, f: F) -> Result<T, BreakerError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        self.breaker(dependency).call_async(f).await
    }

    /// Apply a refreshed set of per-dependency thresholds.
    ///
    /// Dependencies that lost their override fall back to the defaults.
    pub fn apply(&self, overrides: &HashMap<String, BreakerConfig>) {
        *self.overrides.write().unwrap_or_else(|e| e.into_inner()) = overrides.clone();
        let defaults = self.defaults.read().unwrap_or_else(|e| e.into_inner()).clone();
        let breakers = self.breakers.read().unwrap_or_else(|e| e.into_inner());
        for (name, breaker) in breakers.iter() {
            breaker.reconfigure(overrides.get(name).cloned().unwrap_or_else(|| defaults.clone()));
        }
    }

    pub fn set_defaults(&self, defaults: BreakerConfig) {
        *self.defaults.write().unwrap_or_else(|e| e.into_inner()) = defaults;
        let overrides = self.overrides.read().unwrap_or_else(|e| e.into_inner()).clone();
        self.apply(&overrides);
    }

    /// Snapshots of every known breaker, sorted by dependency name.
    pub fn states(&self) -> Vec<BreakerSnapshot> {
        let breakers = self.breakers.read().unwrap_or_else(|e| e.into_inner());
        let mut out: Vec<_> = breakers.values().map(|b| b.snapshot()).collect();
        out.sort_by(|a, b| a.dependency.cmp(&b.dependency));
        out
    }
}

impl Default for BreakerRegistry {
    fn default() -> Self {
        Self::new(BreakerConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Error)]
    #[error("upstream down")]
    struct Down;

    fn config(threshold: u32, cooldown_ms: u64, successes: u32) -> BreakerConfig {
        BreakerConfig {
            failure_threshold: threshold,
            failure_window_ms: 60_000,
            cooldown_ms,
            half_open_trials: successes,
            success_threshold: successes,
        }
    }

    fn fail(b: &CircuitBreaker) -> Result<(), BreakerError<Down>> {
        b.call(|| Err::<(), _>(Down))
    }

    fn succeed(b: &CircuitBreaker) -> Result<u32, BreakerError<Down>> {
        b.call(|| Ok::<_, Down>(7))
    }

    #[test]
    fn opens_after_exactly_threshold_failures() {
        let b = CircuitBreaker::new("data_provider", config(3, 60_000, 2));
        for i in 0..2 {
            assert!(matches!(fail(&b), Err(BreakerError::Inner(Down))), "call {i}");
            assert_eq!(b.state(), CircuitState::Closed);
        }
        assert!(matches!(fail(&b), Err(BreakerError::Inner(Down))));
        assert_eq!(b.state(), CircuitState::Open);

        // Short-circuited: the closure must not run.
        let mut ran = false;
        let res = b.call(|| {
            ran = true;
            Ok::<_, Down>(())
        });
        assert!(!ran);
        match res {
            Err(BreakerError::Open(e)) => assert_eq!(e.dependency, "data_provider"),
            other => panic!("expected open, got {other:?}"),
        }
    }

    #[test]
    fn half_open_successes_close() {
        let b = CircuitBreaker::new("entitlements", config(1, 10, 2));
        let _ = fail(&b);
        assert_eq!(b.state(), CircuitState::Open);
        std::thread::sleep(Duration::from_millis(20));
        assert_eq!(b.state(), CircuitState::HalfOpen);

        assert_eq!(succeed(&b).unwrap(), 7);
        assert_eq!(b.state(), CircuitState::HalfOpen);
        assert_eq!(succeed(&b).unwrap(), 7);
        assert_eq!(b.state(), CircuitState::Closed);
    }

    #[test]
    fn half_open_failure_reopens() {
        let b = CircuitBreaker::new("notify", config(1, 10, 3));
        let _ = fail(&b);
        std::thread::sleep(Duration::from_millis(20));
        assert_eq!(b.state(), CircuitState::HalfOpen);
        assert!(succeed(&b).is_ok());
        assert!(matches!(fail(&b), Err(BreakerError::Inner(Down))));
        assert_eq!(b.state(), CircuitState::Open);
    }

    #[test]
    fn rolling_window_forgets_old_failures() {
        let mut cfg = config(2, 60_000, 1);
        cfg.failure_window_ms = 10;
        let b = CircuitBreaker::new("quotes", cfg);
        let _ = fail(&b);
        std::thread::sleep(Duration::from_millis(25));
        let _ = fail(&b);
        assert_eq!(b.state(), CircuitState::Closed);
        let _ = fail(&b);
        assert_eq!(b.state(), CircuitState::Open);
    }

    #[test]
    fn half_open_limits_trial_calls() {
        let b = CircuitBreaker::new("slow", config(1, 10, 1));
        let _ = fail(&b);
        std::thread::sleep(Duration::from_millis(20));

        // First trial holds the only slot while a second caller arrives.
        let nested = b.call(|| {
            let inner = b.call(|| Ok::<_, Down>(()));
            assert!(matches!(inner, Err(BreakerError::Open(_))));
            Ok::<_, Down>(())
        });
        assert!(nested.is_ok());
        assert_eq!(b.state(), CircuitState::Closed);
    }

    #[test]
    fn open_error_survives_anyhow_round_trip() {
        let b = CircuitBreaker::new("data_provider", config(1, 60_000, 1));
        let _ = fail(&b);
        let err = b.call(|| Ok::<_, Down>(())).unwrap_err().into_anyhow();
        assert!(err.downcast_ref::<CircuitOpenError>().is_some());
    }

    #[test]
    fn registry_applies_overrides() {
        let registry = BreakerRegistry::new(config(5, 60_000, 1));
        let mut overrides = HashMap::new();
        overrides.insert("entitlements".to_string(), config(1, 60_000, 1));
        registry.apply(&overrides);

        let _ = registry.call("entitlements", || Err::<(), _>(Down));
        let _ = registry.call("data_provider", || Err::<(), _>(Down));

        let states = registry.states();
        assert_eq!(states.len(), 2);
        assert_eq!(states[0].dependency, "data_provider");
        assert_eq!(states[0].state, CircuitState::Closed);
        assert_eq!(states[1].dependency, "entitlements");
        assert_eq!(states[1].state, CircuitState::Open);

        // Dropping the override reverts to defaults without touching state.
        registry.apply(&HashMap::new());
        assert_eq!(registry.breaker("entitlements").snapshot().config.failure_threshold, 5);
    }

    #[tokio::test]
    async fn async_call_passes_through_errors() {
        let registry = BreakerRegistry::new(config(2, 60_000, 1));
        let ok = registry
            .call_async("greeks", || async { Ok::<_, Down>(1.5) })
            .await
            .unwrap();
        assert_eq!(ok, 1.5);
        let err = registry
            .call_async("greeks", || async { Err::<f64, _>(Down) })
            .await
            .unwrap_err();
        assert!(!err.is_open());
        assert!(err.into_inner().is_some());
    }
}
