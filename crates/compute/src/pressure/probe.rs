use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use sysinfo::{Pid, System};

/// One reading of process-wide resource gauges.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct ResourceReading {
    /// Resident set size.
    pub memory_bytes: u64,
    /// CPU use as a percentage of the whole machine (0-100).
    pub cpu_percent: f64,
}

/// Source of memory/CPU gauges for the backpressure monitor.
pub trait ResourceProbe: Send + Sync {
    fn sample(&self) -> ResourceReading;
}

/// Samples the current process through `sysinfo`.
pub struct ProcessProbe {
    system: Mutex<System>,
    pid: Pid,
    cpus: f64,
}

impl ProcessProbe {
    pub fn new() -> Self {
        let cpus = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1) as f64;
        Self {
            system: Mutex::new(System::new()),
            pid: Pid::from(std::process::id() as usize),
            cpus,
        }
    }
}

impl Default for ProcessProbe {
    fn default() -> Self {
        Self::new()
    }
}

impl ResourceProbe for ProcessProbe {
    fn sample(&self) -> ResourceReading {
        let mut system = self.system.lock().unwrap_or_else(|p| p.into_inner());
        system.refresh_process(self.pid);
        match system.process(self.pid) {
            // sysinfo reports CPU per core; normalise to the whole machine.
            Some(proc) => ResourceReading {
                memory_bytes: proc.memory(),
                cpu_percent: proc.cpu_usage() as f64 / self.cpus,
            },
            None => ResourceReading::default(),
        }
    }
}

/// Settable gauges for simulations and tests.
#[derive(Debug, Default)]
pub struct ManualProbe {
    memory_bytes: AtomicU64,
    cpu_percent_x100: AtomicU64,
}

impl ManualProbe {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_memory_mb(&self, mb: u64) {
        self.memory_bytes.store(mb * 1024 * 1024, Ordering::Release);
    }

    pub fn set_cpu_percent(&self, percent: f64) {
        self.cpu_percent_x100
            .store((percent.max(0.0) * 100.0) as u64, Ordering::Release);
    }
}

impl ResourceProbe for ManualProbe {
    fn sample(&self) -> ResourceReading {
        ResourceReading {
            memory_bytes: self.memory_bytes.load(Ordering::Acquire),
            cpu_percent: self.cpu_percent_x100.load(Ordering::Acquire) as f64 / 100.0,
        }
    }
}
