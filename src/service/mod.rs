pub use app_error::{AppError, AppResult};
pub use self::config::{global_config, ClientConfig, ConsumeConfig, DemoConfig, FranzConfig, GLOBAL_CONFIG};
pub use tracing_config::{setup_local_tracing, setup_tracing, OtelGuard};

mod app_error;
mod config;
mod tracing_config;
