use tonic::Status;

/// Typed view of an RPC failure. Portal's server preserves the
/// `LeasorError` variant name as the leading word of the status message
/// (e.g. `"NotRegistered: no live lease for port 4242 pattern \"/a/\""`)
/// specifically so this client can recover the variant without relying on
/// custom gRPC status details.
#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("failed to connect to portal: {0}")]
    Connect(String),

    #[error("no live lease for this registration")]
    NotRegistered,

    #[error("lease port is registered under a different pattern")]
    PatternMismatch,

    #[error("requested fixed port is already leased")]
    FixedPortTaken,

    #[error("requested pattern is covered by (or covers) another live pattern")]
    PatternCovered,

    #[error("pattern is reserved for the ACME challenge webroot")]
    ReservedPattern,

    #[error("no auto-assignable ports remain")]
    OutOfPorts,

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("portal server error: {0}")]
    Server(String),

    #[error("rpc failed: {0}")]
    Rpc(String),
}

impl From<Status> for ClientError {
    fn from(status: Status) -> Self {
        let msg = status.message();
        if let Some(rest) = msg.strip_prefix("NotRegistered") {
            let _ = rest;
            return ClientError::NotRegistered;
        }
        if msg.starts_with("PatternMismatch") {
            return ClientError::PatternMismatch;
        }
        if msg.starts_with("FixedPortTaken") {
            return ClientError::FixedPortTaken;
        }
        if msg.starts_with("PatternCovered") {
            return ClientError::PatternCovered;
        }
        if msg.starts_with("ReservedPattern") {
            return ClientError::ReservedPattern;
        }
        if msg.starts_with("OutOfPorts") {
            return ClientError::OutOfPorts;
        }
        if let Some(rest) = msg.strip_prefix("InvalidRequest: ") {
            return ClientError::InvalidRequest(rest.to_string());
        }
        if let Some(rest) = msg.strip_prefix("Fatal: ") {
            return ClientError::Server(rest.to_string());
        }
        ClientError::Rpc(msg.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tonic::Code;

    #[test]
    fn recognizes_not_registered() {
        let status = Status::new(Code::NotFound, "NotRegistered: no live lease for port 1 pattern \"/a/\"");
        assert!(matches!(ClientError::from(status), ClientError::NotRegistered));
    }

    #[test]
    fn falls_back_to_raw_message_for_unknown_shapes() {
        let status = Status::new(Code::Unavailable, "connection refused");
        assert!(matches!(ClientError::from(status), ClientError::Rpc(_)));
    }

    #[test]
    fn recognizes_invalid_request_payload() {
        let status = Status::new(Code::InvalidArgument, "InvalidRequest: fixed_port 80 lies inside the auto-assigned range");
        match ClientError::from(status) {
            ClientError::InvalidRequest(m) => assert!(m.contains("fixed_port")),
            other => panic!("unexpected variant: {other:?}"),
        }
    }
}
