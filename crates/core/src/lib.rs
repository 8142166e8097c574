pub mod config;
pub mod control;
pub mod error;
pub mod work;

pub use config::{
    load_dotenv, Config, ControlSourceConfig, PoolConfig, PressureConfig, ShedderConfig,
};
pub use control::{BreakerConfig, BudgetConfig, ControlConfig};
pub use error::*;
pub use work::*;
