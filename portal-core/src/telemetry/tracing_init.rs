use tracing_subscriber::EnvFilter;

use crate::config::LoggingConfig;

/// Initialize the global `tracing` subscriber from a `LoggingConfig`.
///
/// `RUST_LOG` takes precedence over `logging.level` if set, matching the
/// teacher crate's `telemetry::tracing::init_tracing_with_otel` shape
/// (minus the OpenTelemetry exporter, which is out of scope for Portal).
pub fn init_tracing(cfg: &LoggingConfig) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(cfg.level.clone()));

    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(cfg.show_target)
        .try_init()
        .map_err(|e| format!("failed to set global tracing subscriber: {e}").into())
}
