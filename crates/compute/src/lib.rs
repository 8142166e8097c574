pub mod breaker;
pub mod budget;
pub mod error;
pub mod kernel;
pub mod partition;
pub mod pool;
pub mod pressure;
pub mod scheduler;
pub mod shedder;

pub use breaker::{BreakerError, BreakerRegistry, BreakerSnapshot, CircuitBreaker, CircuitOpenError, CircuitState};
pub use budget::{BudgetGuard, BudgetHealth, BudgetRejection, ConfigRefresher, ControlSource, EnvSource, TomlFileSource};
pub use error::{CapacityReason, ScheduleError, TimeoutPhase};
pub use kernel::{ComputeKernel, KernelContext};
pub use partition::{PartitionError, Partitioner};
pub use pool::{Completion, PoolStats, WorkerPool, WorkerStats};
pub use pressure::{BackpressureMonitor, ManualProbe, PressureLevel, PressureMetric, ProcessProbe, ResourceProbe};
pub use scheduler::{Scheduler, SchedulerMetrics, WorkHandle};
pub use shedder::{Admission, LoadShedder, RejectReason, ShedReason, ShedStats};
