//! Backpressure: resource probes and the pressure-level state machine.

mod monitor;
mod probe;

pub use monitor::{BackpressureMonitor, PressureLevel, PressureMetric, PressureSample, QueueGauge};
pub use probe::{ManualProbe, ProcessProbe, ResourceProbe, ResourceReading};
