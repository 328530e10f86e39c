use crate::error::AppError;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

pub const LOG_FILTER_ENV: &str = "WALLET_SYNC_LOG";
pub const DEFAULT_LOG_FILTER: &str = "info";

pub fn resolve_log_filter() -> String {
    std::env::var(LOG_FILTER_ENV)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
        .unwrap_or_else(|| DEFAULT_LOG_FILTER.to_string())
}

/// Install the global tracing subscriber writing to stdout.
pub fn init_tracing(filter: &str) -> Result<(), AppError> {
    let stdout_layer = fmt::layer()
        .with_target(false)
        .with_filter(EnvFilter::new(filter));
    tracing_subscriber::registry()
        .with(stdout_layer)
        .try_init()
        .map_err(|error| AppError::Telemetry(error.to_string()))
}
