//! Resource budget: hard admission ceilings plus the TTL-refreshed control
//! configuration they are read from.

mod guard;
mod refresher;
mod source;

pub use guard::{BudgetGuard, BudgetHealth, BudgetPermit, BudgetRejection, ConfigOrigin, ResourceAdvisory};
pub use refresher::ConfigRefresher;
pub use source::{source_for, ConfigSourceError, ControlSource, EnvSource, TomlFileSource};
