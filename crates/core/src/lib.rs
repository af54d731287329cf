pub mod config;
pub mod config_loader;
pub mod config_watcher;
pub mod kelly;

pub use config::{
    AlertConfig, AppConfig, DatabaseConfig, ExecutionConfig, HealthConfig, PricingConfig,
    RegimeConfig, RepairConfig, RouterConfig, SchedulerConfig, ServerConfig, SizingConfig,
};
pub use config_loader::ConfigLoader;
pub use config_watcher::ConfigWatcher;
pub use kelly::{RiskSizer, SizeDecision, SizeReason};
