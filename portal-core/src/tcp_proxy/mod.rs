mod tunnel;

pub use tunnel::{Tunnel, TunnelStats};

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::RwLock;
use tokio_rustls::TlsAcceptor;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Owns one TLS-accepting listener per live TCP-tunnel lease, keyed by the
/// bind port the backend registered under `:tcp:<port>` (§4.3).
///
/// Unlike the HTTP proxy's routing table, overlapping ports are never
/// valid side by side, so there is no "cover" concept here: a second
/// registration on the same port simply evicts the first's listener
/// (enforced upstream by the Leasor's `FixedPortTaken`/pattern-replace
/// rules; `TcpProxy` only ever sees one live tunnel per port at a time).
///
/// The Leasor's cancellation hook for a TCP lease is built from `bind_port`
/// alone, before the lease (and its port) exists — see
/// `rpc::server::build_hook` — so installation (`install`, which needs the
/// resolved backend address) and reclamation (`remove_port`, keyed only on
/// the pattern's bind port) are deliberately separate entry points.
pub struct TcpProxy {
    tls_acceptor: Arc<RwLock<TlsAcceptor>>,
    tunnels: DashMap<u16, CancellationToken>,
    shutdown: CancellationToken,
    connect_timeout: Duration,
}

impl TcpProxy {
    pub fn new(
        tls_acceptor: Arc<RwLock<TlsAcceptor>>,
        shutdown: CancellationToken,
        connect_timeout: Duration,
    ) -> Arc<Self> {
        Arc::new(Self { tls_acceptor, tunnels: DashMap::new(), shutdown, connect_timeout })
    }

    /// Start a tunnel listening on `bind_port` and forwarding to
    /// `backend_addr`, replacing whatever previously listened there.
    pub fn install(&self, bind_port: u16, backend_addr: String) {
        if let Some((_, prev)) = self.tunnels.remove(&bind_port) {
            debug!(port = bind_port, "replacing existing TCP tunnel");
            prev.cancel();
        }
        let token = self.shutdown.child_token();
        self.tunnels.insert(bind_port, token.clone());

        let tunnel = Tunnel::new(bind_port, backend_addr, Arc::clone(&self.tls_acceptor), self.connect_timeout);
        tokio::spawn(async move {
            tunnel.run(token).await;
        });
    }

    /// Tear down the tunnel on `bind_port`, if any. This is the body of
    /// the Leasor cancellation hook for every TCP lease.
    pub fn remove_port(&self, bind_port: u16) {
        if let Some((_, token)) = self.tunnels.remove(&bind_port) {
            token.cancel();
        }
    }

    pub fn active_ports(&self) -> Vec<u16> {
        self.tunnels.iter().map(|e| *e.key()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn remove_port_is_a_no_op_when_nothing_is_installed() {
        let tunnels: DashMap<u16, CancellationToken> = DashMap::new();
        assert!(tunnels.remove(&4242).is_none());
    }

    #[test]
    fn install_then_remove_clears_the_port() {
        // Exercises bookkeeping directly; a real `install()` would also
        // need a bindable port and a running Tokio runtime to accept on.
        let shutdown = CancellationToken::new();
        let tunnels: DashMap<u16, CancellationToken> = DashMap::new();
        let token = shutdown.child_token();
        tunnels.insert(4242, token.clone());
        assert_eq!(tunnels.len(), 1);

        let removed = tunnels.remove(&4242);
        assert!(removed.is_some());
        assert!(!token.is_cancelled());
        removed.unwrap().1.cancel();
        assert!(token.is_cancelled());
    }
}
