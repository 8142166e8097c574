//! scheduler-sim — drive the scheduling plane with synthetic indicator load.
//!
//! Submits `--items` work items spread over `--keys` instruments with a
//! configurable priority mix, then prints per-outcome counts and the
//! scheduler metrics snapshot as JSON.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Context;
use clap::Parser;
use rand::Rng;
use tracing::info;

use tickgate_compute::budget::source_for;
use tickgate_compute::{
    BreakerError, ComputeKernel, KernelContext, ManualProbe, ProcessProbe, ResourceProbe, Scheduler,
};
use tickgate_core::{Config, Priority, WorkItem};

// ── CLI ─────────────────────────────────────────────────────────────

/// Synthetic load generator for the admission and scheduling plane.
#[derive(Parser, Debug)]
#[command(name = "scheduler-sim", version, about)]
struct Cli {
    /// Worker count (0 = value from config / available parallelism).
    #[arg(long, env = "SIM_WORKERS", default_value_t = 0)]
    workers: usize,

    /// Total work items to submit.
    #[arg(long, default_value_t = 10_000)]
    items: usize,

    /// Distinct affinity keys (instruments).
    #[arg(long, default_value_t = 50)]
    keys: usize,

    /// Priority weights as `critical=N,high=N,normal=N,low=N`.
    #[arg(long, default_value = "critical=5,high=15,normal=60,low=20", value_parser = parse_mix)]
    mix: [u32; 4],

    /// Busy time of one kernel call in microseconds.
    #[arg(long, default_value_t = 200)]
    kernel_micros: u64,

    /// Fraction of kernel calls whose quote dependency fails.
    #[arg(long, default_value_t = 0.0)]
    quote_failure_rate: f64,

    /// Pin the memory gauge to this percentage of the budget instead of
    /// measuring the process.
    #[arg(long)]
    memory_pct: Option<u64>,

    /// Concurrent submitting tasks.
    #[arg(long, default_value_t = 16)]
    submitters: usize,

    /// Pretty-print the JSON report.
    #[arg(long)]
    pretty: bool,
}

fn parse_mix(s: &str) -> Result<[u32; 4], String> {
    let mut weights = [0u32; 4];
    for part in s.split(',').filter(|p| !p.trim().is_empty()) {
        let (name, weight) = part
            .split_once('=')
            .ok_or_else(|| format!("expected priority=weight, got '{part}'"))?;
        let priority: Priority = name.trim().parse()?;
        weights[priority.as_index()] = weight
            .trim()
            .parse()
            .map_err(|e| format!("bad weight for {priority}: {e}"))?;
    }
    if weights.iter().all(|w| *w == 0) {
        return Err("at least one priority needs a non-zero weight".into());
    }
    Ok(weights)
}

fn pick_priority(mix: &[u32; 4], rng: &mut impl Rng) -> Priority {
    let total: u32 = mix.iter().sum();
    let mut roll = rng.gen_range(0..total);
    for priority in Priority::ALL {
        let weight = mix[priority.as_index()];
        if roll < weight {
            return priority;
        }
        roll -= weight;
    }
    Priority::Low
}

// ── Synthetic kernel ────────────────────────────────────────────────

struct SyntheticBar {
    busy: Duration,
    quote_fails: bool,
}

struct SyntheticIndicators;

impl ComputeKernel for SyntheticIndicators {
    type Payload = SyntheticBar;
    type Output = f64;

    fn name(&self) -> &str {
        "synthetic-indicators"
    }

    fn execute(&self, bar: SyntheticBar, ctx: &KernelContext<'_>) -> anyhow::Result<f64> {
        let quote = ctx
            .call_dependency("quotes", || {
                if bar.quote_fails {
                    Err(anyhow::anyhow!("quote provider timed out"))
                } else {
                    Ok(100.0_f64)
                }
            })
            .map_err(BreakerError::into_anyhow)?;

        let started = Instant::now();
        let mut acc: f64 = quote;
        while started.elapsed() < bar.busy {
            if ctx.is_cancelled() {
                anyhow::bail!("cancelled after {:?}", started.elapsed());
            }
            acc = (acc * 1.0001).sqrt() + 1.0;
        }
        Ok(acc)
    }
}

// ── Main ────────────────────────────────────────────────────────────

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    tickgate_core::load_dotenv();
    let cli = Cli::parse();

    let mut config = Config::from_env();
    if cli.workers > 0 {
        config.pool.worker_count = cli.workers;
    }
    config.log_summary();

    let manual = cli.memory_pct.map(|_| Arc::new(ManualProbe::new()));
    let probe: Arc<dyn ResourceProbe> = match &manual {
        Some(manual) => manual.clone(),
        None => Arc::new(ProcessProbe::new()),
    };
    let source = source_for(&config);
    let scheduler = Arc::new(
        Scheduler::start(config, SyntheticIndicators, probe, Some(source))
            .context("failed to start scheduler")?,
    );
    if let (Some(manual), Some(pct)) = (&manual, cli.memory_pct) {
        let max = scheduler.budget().current_config().max_memory_mb;
        manual.set_memory_mb(max * pct / 100);
        scheduler.monitor().sample_now();
    }
    scheduler.spawn_background();

    info!(
        items = cli.items,
        keys = cli.keys,
        submitters = cli.submitters,
        "Starting synthetic load"
    );
    let started = Instant::now();
    let submitters = cli.submitters.max(1);
    let per_task = cli.items.div_ceil(submitters);
    let keys = cli.keys.max(1);

    let mut tasks = Vec::with_capacity(submitters);
    for t in 0..submitters {
        let scheduler = Arc::clone(&scheduler);
        let mix = cli.mix;
        let busy = Duration::from_micros(cli.kernel_micros);
        let failure_rate = cli.quote_failure_rate.clamp(0.0, 1.0);
        let count = per_task.min(cli.items.saturating_sub(t * per_task));
        tasks.push(tokio::spawn(async move {
            let mut outcomes: BTreeMap<&'static str, u64> = BTreeMap::new();
            let mut handles = Vec::with_capacity(count);
            for i in 0..count {
                // Rng is not Send; keep it out of the awaits.
                let (priority, quote_fails) = {
                    let mut rng = rand::thread_rng();
                    (pick_priority(&mix, &mut rng), rng.gen_bool(failure_rate))
                };
                let key = format!("INST{:03}", (t * per_task + i) % keys);
                let item = WorkItem::new(key, priority, SyntheticBar { busy, quote_fails });
                match scheduler.submit(item).await {
                    Ok(handle) => handles.push(handle),
                    Err(e) => *outcomes.entry(e.code()).or_default() += 1,
                }
            }
            for handle in handles {
                let code = match handle.wait().await {
                    Ok(_) => "ok",
                    Err(e) => e.code(),
                };
                *outcomes.entry(code).or_default() += 1;
            }
            outcomes
        }));
    }

    let mut outcomes: BTreeMap<&'static str, u64> = BTreeMap::new();
    for task in tasks {
        for (code, n) in task.await.context("submitter task failed")? {
            *outcomes.entry(code).or_default() += n;
        }
    }
    let elapsed = started.elapsed();
    info!(elapsed_ms = elapsed.as_millis() as u64, ?outcomes, "Synthetic load finished");

    let report = serde_json::json!({
        "elapsed_ms": elapsed.as_millis() as u64,
        "outcomes": outcomes,
        "metrics": scheduler.metrics(),
    });
    let rendered = if cli.pretty {
        serde_json::to_string_pretty(&report)?
    } else {
        serde_json::to_string(&report)?
    };
    println!("{rendered}");

    scheduler.shutdown().await;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mix_parses_named_weights() {
        assert_eq!(parse_mix("critical=1,low=3").unwrap(), [1, 0, 0, 3]);
        assert!(parse_mix("urgent=2").is_err());
        assert!(parse_mix("high=0").is_err());
    }

    #[test]
    fn single_weight_always_picks_that_priority() {
        let mut rng = rand::thread_rng();
        for _ in 0..100 {
            assert_eq!(pick_priority(&[0, 0, 7, 0], &mut rng), Priority::Normal);
        }
    }
}
