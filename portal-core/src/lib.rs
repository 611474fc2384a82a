pub mod config;
pub mod error;
pub mod http_proxy;
pub mod leasor;
pub mod rpc;
pub mod tcp_proxy;
pub mod telemetry;
pub mod tls;

pub use config::{load_from_path, Config};
pub use error::{ProxyError, Result};
