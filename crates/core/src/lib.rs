pub mod config;
pub mod logging;
pub mod polling;
pub mod retry;

pub use config::{AppConfig, ConfigValidator};
pub use logging::init_logging;
pub use polling::run_polling_loop;
pub use retry::{repeat_until_success, RetryConfig};
pub use trellis_errors::{ErrorKind, TrellisError, TrellisResult};
