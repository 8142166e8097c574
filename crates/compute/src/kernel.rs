//! The computation kernel seam: what a worker actually runs.

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use tickgate_core::WorkerId;

use crate::breaker::{BreakerError, BreakerRegistry};

/// Per-execution context handed to a kernel.
///
/// Cancellation is cooperative: the scheduler never interrupts a running
/// kernel, it only exposes the deadline and the shutdown flag.
pub struct KernelContext<'a> {
    pub worker: WorkerId,
    pub affinity_key: &'a str,
    pub deadline: Option<Instant>,
    pub(crate) shutdown: &'a AtomicBool,
    pub(crate) breakers: &'a BreakerRegistry,
}

impl KernelContext<'_> {
    /// Deadline passed or the pool is shutting down.
    pub fn is_cancelled(&self) -> bool {
        self.shutdown.load(Ordering::Acquire)
            || self.deadline.map(|d| Instant::now() >= d).unwrap_or(false)
    }

    pub fn remaining(&self) -> Option<Duration> {
        self.deadline
            .map(|d| d.saturating_duration_since(Instant::now()))
    }

    pub fn breakers(&self) -> &BreakerRegistry {
        self.breakers
    }

    /// Call an external dependency through its circuit breaker.
    pub fn call_dependency<T, E>(
        &self,
        dependency: &str,
        f: impl FnOnce() -> Result<T, E>,
    ) -> Result<T, BreakerError<E>> {
        self.breakers.call(dependency, f)
    }

    /// Async flavour for kernels that drive their own runtime handle.
    pub async fn call_dependency_async<T, E, F, Fut>(
        &self,
        dependency: &str,
        f: F,
    ) -> Result<T, BreakerError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        self.breakers.call_async(dependency, f).await
    }
}

/// A pure computation over an opaque payload.
///
/// Runs on a worker thread and may block. Errors are passed through to the
/// submitter untouched; returning a
/// [`CircuitOpenError`](crate::breaker::CircuitOpenError) (directly or via
/// [`BreakerError::into_anyhow`]) surfaces as `circuit_open`.
pub trait ComputeKernel: Send + Sync + 'static {
    type Payload: Send + 'static;
    type Output: Send + 'static;

    fn name(&self) -> &str {
        "kernel"
    }

    fn execute(&self, payload: Self::Payload, ctx: &KernelContext<'_>) -> anyhow::Result<Self::Output>;
}
