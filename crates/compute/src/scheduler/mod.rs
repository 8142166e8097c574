//! Orchestrator tying admission, placement and flow control together.
//!
//! A submission passes the [`LoadShedder`](crate::shedder::LoadShedder)
//! (budget ceilings plus pressure policy), is resolved to a shard by the
//! [`Partitioner`](crate::partition::Partitioner), and is enqueued on the
//! owning worker of the [`WorkerPool`](crate::pool::WorkerPool). The caller
//! gets a [`WorkHandle`] that yields exactly one outcome.

pub mod metrics;
pub mod runner;

pub use metrics::{AdmissionStats, SchedulerMetrics};
pub use runner::{Scheduler, WorkHandle};
