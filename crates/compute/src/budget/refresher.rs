use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::breaker::BreakerRegistry;

use super::guard::BudgetGuard;
use super::source::{ConfigSourceError, ControlSource};

/// Pulls control snapshots on a TTL and publishes them to the budget guard
/// and the breaker registry.
pub struct ConfigRefresher {
    source: Arc<dyn ControlSource>,
    guard: Arc<BudgetGuard>,
    breakers: Arc<BreakerRegistry>,
    interval: Duration,
}

impl ConfigRefresher {
    pub fn new(
        source: Arc<dyn ControlSource>,
        guard: Arc<BudgetGuard>,
        breakers: Arc<BreakerRegistry>,
        interval: Duration,
    ) -> Self {
        Self {
            source,
            guard,
            breakers,
            interval,
        }
    }

    /// One fetch-validate-publish cycle. On failure the active snapshot is
    /// kept and the guard is flagged degraded.
    pub async fn refresh_once(&self) -> Result<(), ConfigSourceError> {
        let outcome = match self.source.fetch().await {
            Ok(config) => match self.guard.apply_snapshot(config.budget) {
                Ok(()) => {
                    self.breakers.apply(&config.breakers);
                    Ok(config.breakers.len())
                }
                Err(e) => Err(ConfigSourceError::Invalid(e)),
            },
            Err(e) => Err(e),
        };

        match outcome {
            Ok(overrides) => {
                debug!(source = self.source.name(), overrides, "Control snapshot applied");
                Ok(())
            }
            Err(e) => {
                self.guard.record_refresh_failure(&e.to_string());
                Err(e)
            }
        }
    }

    /// Refresh immediately, then every `interval` until `shutdown` flips to true.
    pub fn spawn(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        tokio::spawn(async move {
            info!(
                source = self.source.name(),
                interval_secs = self.interval.as_secs(),
                "Control refresher started"
            );
            let mut ticker = tokio::time::interval(self.interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        // Failures are already logged and recorded on the guard.
                        let _ = self.refresh_once().await;
                    }
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            break;
                        }
                    }
                }
            }
            debug!("Control refresher stopped");
        })
    }
}
