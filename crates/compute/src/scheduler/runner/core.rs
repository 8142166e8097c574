use std::sync::atomic::AtomicBool;
use std::sync::{Arc, Mutex};

use chrono::Utc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::info;

use tickgate_core::Config;

use crate::breaker::BreakerRegistry;
use crate::budget::{BudgetGuard, ConfigRefresher, ControlSource};
use crate::kernel::ComputeKernel;
use crate::partition::Partitioner;
use crate::pool::{PoolError, WorkerPool};
use crate::pressure::{BackpressureMonitor, QueueGauge, ResourceProbe};
use crate::scheduler::metrics::{AdmissionCounters, SchedulerMetrics};
use crate::shedder::LoadShedder;

/// The compute scheduler. Admits work items, places them on the worker
/// owning their shard and hands back a [`WorkHandle`](super::WorkHandle).
pub struct Scheduler<K: ComputeKernel> {
    pub(super) config: Config,
    pub(super) pool: WorkerPool<K>,
    pub(super) budget: Arc<BudgetGuard>,
    pub(super) breakers: Arc<BreakerRegistry>,
    pub(super) monitor: Arc<BackpressureMonitor>,
    pub(super) shedder: Arc<LoadShedder>,
    pub(super) refresher: Option<Arc<ConfigRefresher>>,
    pub(super) counters: Arc<AdmissionCounters>,
    /// Cleared by shutdown; new submissions fail with `shutting_down`.
    pub(super) accepting: AtomicBool,
    pub(super) shutdown_tx: watch::Sender<bool>,
    pub(super) background: Mutex<Vec<JoinHandle<()>>>,
}

impl<K: ComputeKernel> Scheduler<K> {
    /// Build every component and start the worker pool.
    ///
    /// `source`, when given, is polled every `config.control.refresh_secs`
    /// once [`spawn_background`](Self::spawn_background) runs; until then
    /// the built-in `config.budget` applies.
    pub fn start(
        config: Config,
        kernel: K,
        probe: Arc<dyn ResourceProbe>,
        source: Option<Arc<dyn ControlSource>>,
    ) -> Result<Self, PoolError> {
        let breakers = Arc::new(BreakerRegistry::new(config.breaker.clone()));
        let budget = Arc::new(BudgetGuard::new(config.budget.clone()));
        let monitor = Arc::new(BackpressureMonitor::new(
            config.pressure.clone(),
            Arc::clone(&budget),
            probe,
        ));
        let partitioner = Arc::new(Partitioner::new(
            config.pool.total_shards(),
            config.pool.virtual_nodes,
        ));
        let pool = WorkerPool::start(
            Arc::new(kernel),
            config.pool.clone(),
            partitioner,
            Arc::clone(&breakers),
        )?;
        monitor.attach_queues(Arc::new(pool.clone()) as Arc<dyn QueueGauge>);

        let shedder = Arc::new(LoadShedder::new(
            config.shedder.clone(),
            Arc::clone(&budget),
            Arc::clone(&monitor),
        ));
        let refresher = source.map(|source| {
            Arc::new(ConfigRefresher::new(
                source,
                Arc::clone(&budget),
                Arc::clone(&breakers),
                config.control.refresh_interval(),
            ))
        });
        let (shutdown_tx, _) = watch::channel(false);

        info!(
            profile = config.profile_label(),
            workers = pool.worker_ids().len(),
            shards = config.pool.total_shards(),
            refresh = refresher.is_some(),
            "Scheduler started"
        );

        Ok(Self {
            config,
            pool,
            budget,
            breakers,
            monitor,
            shedder,
            refresher,
            counters: Arc::new(AdmissionCounters::default()),
            accepting: AtomicBool::new(true),
            shutdown_tx,
            background: Mutex::new(Vec::new()),
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn pool(&self) -> &WorkerPool<K> {
        &self.pool
    }

    pub fn budget(&self) -> &Arc<BudgetGuard> {
        &self.budget
    }

    /// Breaker registry shared with kernels through their context.
    pub fn breakers(&self) -> &Arc<BreakerRegistry> {
        &self.breakers
    }

    pub fn monitor(&self) -> &Arc<BackpressureMonitor> {
        &self.monitor
    }

    pub fn shedder(&self) -> &Arc<LoadShedder> {
        &self.shedder
    }

    pub fn refresher(&self) -> Option<&Arc<ConfigRefresher>> {
        self.refresher.as_ref()
    }

    /// Get a snapshot of the current scheduler metrics.
    pub fn metrics(&self) -> SchedulerMetrics {
        let (pressure_level, pressure_metric) = self.monitor.current();
        SchedulerMetrics {
            captured_at: Utc::now(),
            pressure_level,
            pressure_metric,
            pressure_transitions: self.monitor.transitions(),
            latest_sample: self.monitor.latest(),
            queue_full_total: self.monitor.queue_full_total(),
            workers: self.pool.worker_stats(),
            pool: self.pool.stats(),
            shed: self.shedder.stats(),
            admission: self.counters.snapshot(),
            breakers: self.breakers.states(),
            budget: self.budget.health(),
            in_flight: self.budget.in_flight(),
            requests_last_minute: self.budget.requests_last_minute(),
            advisory: self.budget.advisory(),
            execution: self.pool.execution_stats(),
        }
    }
}
