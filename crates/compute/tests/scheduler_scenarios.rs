//! End-to-end behaviour of the scheduler under load, pressure and failure.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use tickgate_compute::{
    BreakerError, CircuitState, ComputeKernel, KernelContext, ManualProbe, PressureLevel, Scheduler,
};
use tickgate_core::{Config, Priority, WorkItem};

/// Synthetic indicator kernel.
enum Calc {
    /// Sum of a small window, with a short sleep to look like real work.
    Sma(u64),
    Panic,
    /// Fetch a quote through the `quotes` breaker.
    Quote { fail: bool },
}

struct Indicators;

impl ComputeKernel for Indicators {
    type Payload = Calc;
    type Output = u64;

    fn name(&self) -> &str {
        "indicators"
    }

    fn execute(&self, payload: Calc, ctx: &KernelContext<'_>) -> anyhow::Result<u64> {
        match payload {
            Calc::Sma(n) => {
                std::thread::sleep(Duration::from_micros(50));
                Ok((0..n).sum())
            }
            Calc::Panic => panic!("corrupt bar series"),
            Calc::Quote { fail } => ctx
                .call_dependency("quotes", || {
                    if fail {
                        Err(anyhow::anyhow!("quote provider unavailable"))
                    } else {
                        Ok(100)
                    }
                })
                .map_err(BreakerError::into_anyhow),
        }
    }
}

fn base_config(workers: usize) -> Config {
    let mut config = Config::for_profile("");
    config.pool.worker_count = workers;
    config.budget.max_concurrent_operations = 100_000;
    config.budget.max_request_rate_per_minute = 10_000_000;
    config.shedder.delay_base_ms = 1;
    config.shedder.delay_max_ms = 4;
    config.control.file = None;
    config
}

fn start(config: Config) -> (Arc<Scheduler<Indicators>>, Arc<ManualProbe>) {
    let probe = Arc::new(ManualProbe::new());
    let scheduler = Scheduler::start(config, Indicators, probe.clone(), None).unwrap();
    (Arc::new(scheduler), probe)
}

fn force_memory_pct(scheduler: &Scheduler<Indicators>, probe: &ManualProbe, pct: u64) {
    let max = scheduler.budget().current_config().max_memory_mb;
    probe.set_memory_mb(max * pct / 100);
    scheduler.monitor().sample_now();
}

fn sma(key: &str, priority: Priority) -> WorkItem<Calc> {
    WorkItem::new(key, priority, Calc::Sma(10))
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn same_key_lands_on_same_worker() {
    let (scheduler, _) = start(base_config(8));
    for k in 0..20 {
        let key = format!("SYM{k}");
        let mut workers = HashSet::new();
        for _ in 0..20 {
            let done = scheduler.execute(sma(&key, Priority::Normal)).await.unwrap();
            assert!(!done.stolen);
            workers.insert(done.worker);
        }
        assert_eq!(workers.len(), 1, "{key} ran on {workers:?}");
    }
    assert_eq!(scheduler.metrics().pool.rebalances, 0);
    scheduler.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn every_accepted_item_has_exactly_one_outcome() {
    let (scheduler, _) = start(base_config(4));

    let mut submitters = Vec::new();
    for t in 0..8 {
        let scheduler = Arc::clone(&scheduler);
        submitters.push(tokio::spawn(async move {
            let mut handles = Vec::new();
            for i in 0..250 {
                let key = format!("K{}", (t * 31 + i) % 30);
                handles.push(scheduler.submit(sma(&key, Priority::High)).await.unwrap());
            }
            handles
        }));
    }

    // Membership changes while work is queued.
    tokio::time::sleep(Duration::from_millis(5)).await;
    let victim = scheduler.pool().worker_ids()[0];
    scheduler.remove_worker(victim).unwrap();
    scheduler.add_worker().unwrap();

    let mut ids = HashSet::new();
    let mut outcomes = 0;
    for submitter in submitters {
        for handle in submitter.await.unwrap() {
            assert!(ids.insert(handle.id()));
            let done = handle.wait().await.unwrap();
            assert_eq!(done.output, 45);
            outcomes += 1;
        }
    }
    assert_eq!(outcomes, 2000);

    let m = scheduler.metrics();
    assert_eq!(m.admission.accepted, 2000);
    assert_eq!(m.admission.completed, 2000);
    assert_eq!(m.in_flight, 0);
    scheduler.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn critical_pressure_admits_only_critical_and_high() {
    let (scheduler, probe) = start(base_config(4));
    force_memory_pct(&scheduler, &probe, 105);
    assert_eq!(scheduler.monitor().level(), PressureLevel::Critical);

    let mut admitted: HashMap<Priority, usize> = HashMap::new();
    let mut rejected: HashMap<Priority, usize> = HashMap::new();
    let mut handles = Vec::new();
    for i in 0..1200 {
        let priority = Priority::ALL[i % 4];
        match scheduler.submit(sma(&format!("S{}", i % 40), priority)).await {
            Ok(handle) => {
                *admitted.entry(priority).or_default() += 1;
                handles.push(handle);
            }
            Err(err) => {
                assert_eq!(err.code(), "shed_critical");
                *rejected.entry(priority).or_default() += 1;
            }
        }
    }

    assert_eq!(admitted.get(&Priority::Critical), Some(&300));
    assert_eq!(admitted.get(&Priority::High), Some(&300));
    assert_eq!(rejected.get(&Priority::Normal), Some(&300));
    assert_eq!(rejected.get(&Priority::Low), Some(&300));
    assert!(!admitted.contains_key(&Priority::Low));

    for handle in handles {
        handle.wait().await.unwrap();
    }
    assert_eq!(scheduler.metrics().shed.rejected["shed_critical"], 600);
    scheduler.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn heavy_memory_delays_or_rejects_low_and_admits_critical() {
    let (scheduler, probe) = start(base_config(4));
    force_memory_pct(&scheduler, &probe, 96);
    assert_eq!(scheduler.monitor().level(), PressureLevel::Heavy);

    let mut tasks = Vec::new();
    for i in 0..100 {
        for priority in [Priority::Low, Priority::Critical] {
            let scheduler = Arc::clone(&scheduler);
            tasks.push(tokio::spawn(async move {
                let result = scheduler.execute(sma(&format!("H{}", i % 25), priority)).await;
                (priority, result)
            }));
        }
    }

    let mut critical_ok = 0;
    let mut low_shed = 0;
    for task in tasks {
        match task.await.unwrap() {
            (Priority::Critical, Ok(_)) => critical_ok += 1,
            (Priority::Low, Err(err)) => {
                assert_eq!(err.code(), "shed_heavy");
                low_shed += 1;
            }
            (priority, other) => panic!("unexpected outcome for {priority}: {:?}", other.map(|c| c.output)),
        }
    }
    assert_eq!(critical_ok, 100);
    assert_eq!(low_shed, 100);
    assert!(scheduler.metrics().shed.delayed >= 100);
    scheduler.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn ten_thousand_items_across_fifty_keys_complete() {
    let (scheduler, _) = start(base_config(8));

    let mut handles = Vec::with_capacity(10_000);
    for i in 0..10_000 {
        let key = format!("INST{}", i % 50);
        handles.push(scheduler.submit(sma(&key, Priority::Normal)).await.unwrap());
    }
    for handle in handles {
        assert_eq!(handle.wait().await.unwrap().output, 45);
    }

    let m = scheduler.metrics();
    assert_eq!(m.admission.completed, 10_000);
    assert_eq!(m.workers.len(), 8);
    let executed: Vec<u64> = m.workers.iter().map(|w| w.executed).collect();
    assert_eq!(executed.iter().sum::<u64>(), 10_000);
    let max = *executed.iter().max().unwrap();
    let min = *executed.iter().min().unwrap();
    assert!(min > 0, "idle worker never stole: {executed:?}");
    // Spread within four steal batches.
    let steal_batch = scheduler.config().pool.steal_batch as u64;
    assert!(
        max - min <= 4 * steal_batch,
        "spread {} over steal batch {steal_batch}: {executed:?}",
        max - min
    );
    scheduler.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn worker_panic_fails_item_and_pool_recovers() {
    let (scheduler, _) = start(base_config(3));

    let err = scheduler
        .execute(WorkItem::new("BAD", Priority::Normal, Calc::Panic))
        .await
        .unwrap_err();
    assert_eq!(err.code(), "worker_failure");

    for _ in 0..200 {
        if scheduler.metrics().pool.respawns == 1 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    let m = scheduler.metrics();
    assert_eq!(m.pool.worker_failures, 1);
    assert_eq!(m.pool.respawns, 1);
    assert_eq!(m.workers.len(), 3);

    for i in 0..30 {
        let key = format!("BAD{}", i % 3);
        assert!(scheduler.execute(sma(&key, Priority::Normal)).await.is_ok());
    }
    scheduler.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn breaker_isolates_failing_dependency() {
    let mut config = base_config(2);
    config.breaker.failure_threshold = 3;
    config.breaker.cooldown_ms = 50;
    config.breaker.half_open_trials = 2;
    config.breaker.success_threshold = 2;
    let (scheduler, _) = start(config);
    let quote = |fail| WorkItem::new("AAPL", Priority::High, Calc::Quote { fail });
    let state = || scheduler.breakers().breaker("quotes").state();

    // Opens after exactly the threshold.
    for n in 1..=3 {
        let err = scheduler.execute(quote(true)).await.unwrap_err();
        assert_eq!(err.code(), "kernel_error");
        if n < 3 {
            assert_eq!(state(), CircuitState::Closed);
        }
    }
    assert_eq!(state(), CircuitState::Open);
    let err = scheduler.execute(quote(false)).await.unwrap_err();
    assert_eq!(err.code(), "circuit_open");

    // Half-open successes close it.
    tokio::time::sleep(Duration::from_millis(70)).await;
    assert_eq!(scheduler.execute(quote(false)).await.unwrap().output, 100);
    assert_eq!(scheduler.execute(quote(false)).await.unwrap().output, 100);
    assert_eq!(state(), CircuitState::Closed);

    // A failed trial reopens it.
    for _ in 0..3 {
        let _ = scheduler.execute(quote(true)).await;
    }
    assert_eq!(state(), CircuitState::Open);
    tokio::time::sleep(Duration::from_millis(70)).await;
    let err = scheduler.execute(quote(true)).await.unwrap_err();
    assert_eq!(err.code(), "kernel_error");
    assert_eq!(state(), CircuitState::Open);

    let snapshot = scheduler
        .metrics()
        .breakers
        .into_iter()
        .find(|b| b.dependency == "quotes")
        .unwrap();
    assert!(snapshot.short_circuited_total >= 1);
    scheduler.shutdown().await;
}
