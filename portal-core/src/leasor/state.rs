use std::time::{SystemTime, UNIX_EPOCH};

use crate::rpc::pb;

use super::pattern::Pattern;

/// The request a backend made to obtain a lease, already carrying a
/// classified `Pattern` rather than the raw wire string.
#[derive(Debug, Clone)]
pub struct RegisterRequest {
    pub pattern: Pattern,
    /// Raw wire value, not yet validated against `u16`'s range: §7
    /// requires `InvalidRequest` for `fixed_port >= 2^16`, so narrowing
    /// happens in `Leasor::register`, not at the conversion boundary.
    pub fixed_port: u32,
    pub strip_pattern: bool,
    pub certificate_request: Option<Vec<u8>>,
    pub hostname: Option<String>,
}

/// Time-bound reservation of `(pattern, port)` granted to a backend.
#[derive(Debug, Clone)]
pub struct Lease {
    pub pattern: Pattern,
    pub port: u16,
    /// Absolute wall-clock expiry.
    pub timeout: SystemTime,
    pub certificate: Option<Vec<u8>>,
}

impl Lease {
    pub fn is_expired(&self, now: SystemTime) -> bool {
        self.timeout <= now
    }
}

/// Persisted record: enough to reconstruct a live forwarding rule on
/// restart without the backend re-issuing RPCs.
#[derive(Debug, Clone)]
pub struct Registration {
    pub request: RegisterRequest,
    pub lease: Lease,
    pub client_addr: String,
}

fn unix_secs(t: SystemTime) -> i64 {
    t.duration_since(UNIX_EPOCH).map(|d| d.as_secs() as i64).unwrap_or(0)
}

fn from_unix_secs(secs: i64) -> SystemTime {
    if secs <= 0 {
        UNIX_EPOCH
    } else {
        UNIX_EPOCH + std::time::Duration::from_secs(secs as u64)
    }
}

impl Lease {
    pub fn to_proto(&self) -> pb::Lease {
        pb::Lease {
            pattern: self.pattern.to_string(),
            port: u32::from(self.port),
            timeout_unix_secs: unix_secs(self.timeout),
            certificate: self.certificate.clone().unwrap_or_default(),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConversionError {
    #[error("invalid pattern: {0}")]
    Pattern(#[from] super::pattern::PatternParseError),
    #[error("port {0} out of range for a u16")]
    PortRange(u32),
    #[error("missing required field {0}")]
    MissingField(&'static str),
}

impl TryFrom<pb::Lease> for Lease {
    type Error = ConversionError;

    fn try_from(value: pb::Lease) -> Result<Self, Self::Error> {
        let port = u16::try_from(value.port).map_err(|_| ConversionError::PortRange(value.port))?;
        Ok(Lease {
            pattern: Pattern::parse(&value.pattern)?,
            port,
            timeout: from_unix_secs(value.timeout_unix_secs),
            certificate: (!value.certificate.is_empty()).then_some(value.certificate),
        })
    }
}

impl TryFrom<pb::RegisterRequest> for RegisterRequest {
    type Error = ConversionError;

    fn try_from(value: pb::RegisterRequest) -> Result<Self, Self::Error> {
        Ok(RegisterRequest {
            pattern: Pattern::parse(&value.pattern)?,
            fixed_port: value.fixed_port,
            strip_pattern: value.strip_pattern,
            certificate_request: (!value.certificate_request.is_empty())
                .then_some(value.certificate_request),
            hostname: (!value.hostname.is_empty()).then_some(value.hostname),
        })
    }
}

impl RegisterRequest {
    pub fn to_proto(&self) -> pb::RegisterRequest {
        pb::RegisterRequest {
            pattern: self.pattern.to_string(),
            fixed_port: self.fixed_port,
            strip_pattern: self.strip_pattern,
            certificate_request: self.certificate_request.clone().unwrap_or_default(),
            hostname: self.hostname.clone().unwrap_or_default(),
        }
    }
}

impl Registration {
    pub fn to_proto(&self) -> pb::Registration {
        pb::Registration {
            request: Some(self.request.to_proto()),
            lease: Some(self.lease.to_proto()),
            client_addr: self.client_addr.clone(),
        }
    }

    pub fn try_from_proto(value: pb::Registration) -> Result<Self, ConversionError> {
        let request = value
            .request
            .ok_or(ConversionError::MissingField("request"))
            .and_then(RegisterRequest::try_from)?;
        let lease = value
            .lease
            .ok_or(ConversionError::MissingField("lease"))
            .and_then(Lease::try_from)?;
        Ok(Registration { request, lease, client_addr: value.client_addr })
    }
}
