use serde::Deserialize;

/// Logging configuration, consumed by `telemetry::tracing::init_tracing`.
#[derive(Debug, Deserialize, Clone)]
pub struct LoggingConfig {
    /// `tracing_subscriber::EnvFilter` directive, e.g. "info" or
    /// "portal_core=debug,tower=warn". Overridden by `RUST_LOG` if set.
    #[serde(default = "default_level")]
    pub level: String,
    /// Include the module path as the `target` field on each log line.
    #[serde(default)]
    pub show_target: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self { level: default_level(), show_target: false }
    }
}

fn default_level() -> String {
    "info".to_string()
}
