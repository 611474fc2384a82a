use http::{HeaderValue, Uri};

use crate::leasor::{HttpPattern, Lease};

/// Runtime object implementing request rewrite + dispatch for one HTTP
/// lease (§3 "Forwarder").
#[derive(Debug, Clone)]
pub struct Forwarder {
    pub pattern: HttpPattern,
    pub lease: Lease,
    pub strip_pattern: bool,
    pub client_addr: String,
    /// True when the backend registered with a CSR: it is dialed over
    /// mTLS rather than plain HTTP (§4.2).
    pub uses_tls: bool,
}

impl Forwarder {
    fn prefix(&self) -> &str {
        self.pattern.path.strip_suffix('/').unwrap_or(&self.pattern.path)
    }

    pub fn backend_host_port(&self) -> String {
        // `client_addr` is `ip:peer_rpc_port`; the lease's own port is
        // where the backend actually listens for forwarded traffic.
        let host = self.client_addr.rsplit_once(':').map(|(h, _)| h).unwrap_or(&self.client_addr);
        format!("{host}:{}", self.lease.port)
    }

    pub fn scheme(&self) -> &'static str {
        if self.uses_tls {
            "https"
        } else {
            "http"
        }
    }

    /// Compute the rewritten path for `original_path`, applying
    /// `strip_pattern` per §4.2 rule 2.
    pub fn rewrite_path(&self, original_path: &str) -> String {
        if !self.strip_pattern {
            return original_path.to_string();
        }
        if !self.pattern.path.ends_with('/') {
            return "/".to_string();
        }
        let prefix = self.prefix();
        let stripped = original_path.strip_prefix(prefix).unwrap_or(original_path);
        if stripped.is_empty() {
            "/".to_string()
        } else {
            stripped.to_string()
        }
    }

    /// Build the full backend target URI for an incoming request whose
    /// path/query is `path_and_query`.
    pub fn target_uri(&self, path: &str, query: Option<&str>) -> Result<Uri, http::Error> {
        let mut pq = path.to_string();
        if let Some(q) = query {
            pq.push('?');
            pq.push_str(q);
        }
        Uri::builder()
            .scheme(self.scheme())
            .authority(self.backend_host_port())
            .path_and_query(pq)
            .build()
    }
}

/// `Orig-Address` header value for the original client address.
pub fn orig_address_header(peer: std::net::SocketAddr) -> HeaderValue {
    HeaderValue::from_str(&peer.to_string()).unwrap_or_else(|_| HeaderValue::from_static("unknown"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::leasor::Pattern;
    use std::time::SystemTime;

    fn forwarder(pattern: &str, strip: bool) -> Forwarder {
        Forwarder {
            pattern: HttpPattern::parse(pattern).unwrap(),
            lease: Lease {
                pattern: Pattern::parse(pattern).unwrap(),
                port: 9090,
                timeout: SystemTime::now(),
                certificate: None,
            },
            strip_pattern: strip,
            client_addr: "10.0.0.5:55555".to_string(),
            uses_tls: false,
        }
    }

    #[test]
    fn strips_prefix_pattern() {
        let f = forwarder("/a/", true);
        assert_eq!(f.rewrite_path("/a/b/x"), "/b/x");
        assert_eq!(f.rewrite_path("/a/"), "/");
    }

    #[test]
    fn strips_exact_pattern_to_root() {
        let f = forwarder("/x", true);
        assert_eq!(f.rewrite_path("/x"), "/");
    }

    #[test]
    fn no_strip_preserves_path() {
        let f = forwarder("/a/", false);
        assert_eq!(f.rewrite_path("/a/b"), "/a/b");
    }

    #[test]
    fn backend_host_port_uses_client_ip_and_lease_port() {
        let f = forwarder("/a/", false);
        assert_eq!(f.backend_host_port(), "10.0.0.5:9090");
    }

    #[test]
    fn strips_prefix_of_a_host_scoped_pattern() {
        let f = forwarder("api.example.com/a/", true);
        assert_eq!(f.rewrite_path("/a/b/x"), "/b/x");
    }
}
