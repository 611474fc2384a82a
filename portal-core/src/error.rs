use thiserror::Error;

/// Errors that can occur in the proxy core (config, TLS, persistence).
///
/// Leasor-specific errors live in [`crate::leasor::LeasorError`] since they
/// cross the RPC boundary and need a different mapping (see
/// `rpc::server::leasor_error_to_status`).
#[derive(Error, Debug)]
pub enum ProxyError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("TLS error: {0}")]
    Tls(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("HTTP error: {0}")]
    Http(String),

    #[error("Invalid URI: {0}")]
    InvalidUri(#[from] http::uri::InvalidUri),

    #[error("no private key found in key file")]
    NoPrivateKey,

    #[error("persisted state is corrupt: {0}")]
    CorruptState(String),
}

pub type Result<T> = std::result::Result<T, ProxyError>;
