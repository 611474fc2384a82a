mod loader;
mod root;
mod telemetry;
mod timeout;
mod tls;

pub use loader::load_from_path;
pub use root::{Config, PortRange, SecurityConfig};
pub use telemetry::LoggingConfig;
pub use timeout::TimeoutConfig;
pub use tls::TlsConfig;
