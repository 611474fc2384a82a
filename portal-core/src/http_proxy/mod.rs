mod backend_client;
mod connection;
mod forwarder;
pub mod server;

pub use backend_client::BackendClient;
pub use connection::ConnectionManager;
pub use forwarder::{orig_address_header, Forwarder};

use std::sync::Arc;

use dashmap::DashMap;

/// Concurrent `pattern -> Forwarder` map, tolerating concurrent range
/// iteration and modification (§5). Lookup is longest-pattern-match.
#[derive(Default)]
pub struct RoutingTable {
    forwarders: DashMap<String, Arc<Forwarder>>,
}

impl RoutingTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, forwarder: Arc<Forwarder>) {
        self.forwarders.insert(forwarder.pattern.raw.clone(), forwarder);
    }

    pub fn remove(&self, pattern: &str) {
        self.forwarders.remove(pattern);
    }

    /// Longest-pattern-match lookup (§4.2), scoped to `host` (the
    /// request's `Host` header, port stripped, or `None` if absent). A
    /// linear scan is adequate at the expected O(10^2) rule count (§9).
    pub fn match_path(&self, host: Option<&str>, path: &str) -> Option<Arc<Forwarder>> {
        let mut best: Option<Arc<Forwarder>> = None;
        for entry in self.forwarders.iter() {
            let forwarder = entry.value();
            if forwarder.pattern.matches(host, path) {
                let is_longer = best
                    .as_ref()
                    .map(|b| forwarder.pattern.raw.len() > b.pattern.raw.len())
                    .unwrap_or(true);
                if is_longer {
                    best = Some(Arc::clone(forwarder));
                }
            }
        }
        best
    }

    pub fn len(&self) -> usize {
        self.forwarders.len()
    }

    pub fn is_empty(&self) -> bool {
        self.forwarders.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::leasor::Pattern;
    use std::time::SystemTime;

    fn forwarder(pattern: &str) -> Arc<Forwarder> {
        Arc::new(Forwarder {
            pattern: crate::leasor::HttpPattern::parse(pattern).unwrap(),
            lease: crate::leasor::Lease {
                pattern: Pattern::parse(pattern).unwrap(),
                port: 9999,
                timeout: SystemTime::now(),
                certificate: None,
            },
            strip_pattern: false,
            client_addr: "127.0.0.1:1".to_string(),
            uses_tls: false,
        })
    }

    #[test]
    fn longest_pattern_wins() {
        let table = RoutingTable::new();
        table.insert(forwarder("/a/"));
        table.insert(forwarder("/a/b/"));

        assert_eq!(table.match_path(None, "/a/b/x").unwrap().pattern.raw, "/a/b/");
        assert_eq!(table.match_path(None, "/a/x").unwrap().pattern.raw, "/a/");
    }

    #[test]
    fn no_match_returns_none() {
        let table = RoutingTable::new();
        table.insert(forwarder("/a/"));
        assert!(table.match_path(None, "/z").is_none());
    }

    #[test]
    fn remove_drops_the_route() {
        let table = RoutingTable::new();
        table.insert(forwarder("/a/"));
        table.remove("/a/");
        assert!(table.match_path(None, "/a/x").is_none());
    }

    #[test]
    fn host_scoped_pattern_is_ignored_for_other_hosts() {
        let table = RoutingTable::new();
        table.insert(forwarder("api.example.com/a/"));
        assert!(table.match_path(Some("other.example.com"), "/a/x").is_none());
        assert_eq!(
            table.match_path(Some("api.example.com"), "/a/x").unwrap().pattern.raw,
            "api.example.com/a/"
        );
    }
}
