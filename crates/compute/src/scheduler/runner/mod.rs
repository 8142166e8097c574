//! Scheduler runner -- admission, placement and lifecycle.
//!
//! Split into focused submodules:
//! - `core`: Scheduler struct, constructor, accessors and metrics
//! - `admission`: submit pipeline with delay rounds and bounded enqueue
//! - `lifecycle`: background tasks, worker membership and shutdown

mod admission;
mod core;
mod lifecycle;

pub use self::admission::WorkHandle;
pub use self::core::Scheduler;
