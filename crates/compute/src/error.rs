use std::fmt;

use thiserror::Error;

use tickgate_core::WorkerId;

use crate::breaker::CircuitOpenError;
use crate::budget::BudgetRejection;
use crate::partition::PartitionError;
use crate::shedder::{RejectReason, ShedReason};

/// Why an item was refused for lack of capacity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CapacityReason {
    NoWorkers,
    Budget(BudgetRejection),
}

impl fmt::Display for CapacityReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CapacityReason::NoWorkers => f.write_str("no workers registered"),
            CapacityReason::Budget(r) => write!(f, "{r}"),
        }
    }
}

/// Where a deadline was found to be expired.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeoutPhase {
    /// Before the item could be enqueued.
    Admission,
    /// At dequeue, before execution started.
    Queued,
    /// The kernel returned after the deadline.
    Execution,
}

impl fmt::Display for TimeoutPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            TimeoutPhase::Admission => "admission",
            TimeoutPhase::Queued => "queued",
            TimeoutPhase::Execution => "execution",
        })
    }
}

/// Every way a submitted item can fail. Each variant maps to a stable
/// reason code via [`ScheduleError::code`].
#[derive(Debug, Error)]
pub enum ScheduleError {
    #[error("capacity rejected: {0}")]
    CapacityRejected(CapacityReason),

    #[error("shed: {0}")]
    Shed(ShedReason),

    #[error("deadline expired during {phase}")]
    Timeout { phase: TimeoutPhase },

    #[error("worker {worker} failed: {message}")]
    WorkerFailure { worker: WorkerId, message: String },

    #[error(transparent)]
    CircuitOpen(#[from] CircuitOpenError),

    #[error("kernel error: {0:#}")]
    Kernel(anyhow::Error),

    #[error("scheduler is shutting down")]
    ShuttingDown,
}

impl ScheduleError {
    /// Machine-readable reason code.
    pub fn code(&self) -> &'static str {
        match self {
            ScheduleError::CapacityRejected(CapacityReason::NoWorkers) => "no_capacity",
            ScheduleError::CapacityRejected(CapacityReason::Budget(_)) => "budget_exceeded",
            ScheduleError::Shed(reason) => reason.code(),
            ScheduleError::Timeout { .. } => "timeout",
            ScheduleError::WorkerFailure { .. } => "worker_failure",
            ScheduleError::CircuitOpen(_) => "circuit_open",
            ScheduleError::Kernel(_) => "kernel_error",
            ScheduleError::ShuttingDown => "shutting_down",
        }
    }

    /// Refused at admission because the system is saturated; safe to retry later.
    pub fn is_overload(&self) -> bool {
        matches!(
            self,
            ScheduleError::CapacityRejected(_) | ScheduleError::Shed(_)
        )
    }

    /// Map a kernel failure, surfacing short-circuited dependencies distinctly.
    pub(crate) fn from_kernel(err: anyhow::Error) -> Self {
        match err.downcast::<CircuitOpenError>() {
            Ok(open) => ScheduleError::CircuitOpen(open),
            Err(err) => ScheduleError::Kernel(err),
        }
    }
}

impl From<PartitionError> for ScheduleError {
    fn from(err: PartitionError) -> Self {
        match err {
            PartitionError::NoCapacity => ScheduleError::CapacityRejected(CapacityReason::NoWorkers),
        }
    }
}

impl From<BudgetRejection> for ScheduleError {
    fn from(r: BudgetRejection) -> Self {
        ScheduleError::CapacityRejected(CapacityReason::Budget(r))
    }
}

impl From<RejectReason> for ScheduleError {
    fn from(reason: RejectReason) -> Self {
        match reason {
            RejectReason::Budget(r) => r.into(),
            RejectReason::Shed(r) => ScheduleError::Shed(r),
        }
    }
}
