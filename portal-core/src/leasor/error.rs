use thiserror::Error;

/// Error taxonomy for the Leasor, per spec §7. Mapped 1:1 onto
/// `tonic::Status` at the RPC boundary (`rpc::server::leasor_error_to_status`)
/// with the variant name preserved in the message so `portal-client` can
/// parse it back without custom gRPC status details.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LeasorError {
    #[error("NotRegistered: no live lease for port {port} pattern {pattern:?}")]
    NotRegistered { port: u16, pattern: String },

    #[error("PatternMismatch: lease port {port} is registered under a different pattern")]
    PatternMismatch { port: u16 },

    #[error("FixedPortTaken: port {0} is already leased")]
    FixedPortTaken(u16),

    #[error("PatternCovered: pattern {requested:?} is covered by (or covers) live pattern {existing:?}")]
    PatternCovered { requested: String, existing: String },

    #[error("ReservedPattern: {0:?} is reserved for the ACME challenge webroot")]
    ReservedPattern(String),

    #[error("OutOfPorts: no auto-assignable ports remain in the configured range")]
    OutOfPorts,

    #[error("InvalidRequest: {0}")]
    InvalidRequest(String),

    #[error("Fatal: {0}")]
    Fatal(String),
}

pub type Result<T> = std::result::Result<T, LeasorError>;
