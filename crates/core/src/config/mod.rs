pub mod app_config;
pub mod validation;

pub use app_config::{
    AppConfig, CacheConfig, ControllerConfig, DatabaseConfig, ObservabilityConfig, PollingConfig,
    ProcessConfig, WorkerConfig,
};
pub use validation::{ConfigValidator, ValidationUtils};
