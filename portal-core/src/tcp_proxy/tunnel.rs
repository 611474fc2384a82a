use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::RwLock;
use tokio_rustls::TlsAcceptor;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Lifetime counters for one tunnel, surfaced for scenario S5's
/// per-tunnel accounting (§8).
#[derive(Default)]
pub struct TunnelStats {
    pub connections: AtomicU64,
    pub bytes_forwarded: AtomicU64,
}

/// Accepts TLS connections on `bind_port` and relays each one, byte for
/// byte, to `backend_addr` over plain TCP. One tunnel per live TCP lease;
/// torn down by `cancel` when the lease is reclaimed or overridden (§4.3).
pub struct Tunnel {
    bind_port: u16,
    backend_addr: String,
    tls_acceptor: Arc<RwLock<TlsAcceptor>>,
    connect_timeout: Duration,
    stats: Arc<TunnelStats>,
}

impl Tunnel {
    pub fn new(
        bind_port: u16,
        backend_addr: String,
        tls_acceptor: Arc<RwLock<TlsAcceptor>>,
        connect_timeout: Duration,
    ) -> Self {
        Self { bind_port, backend_addr, tls_acceptor, connect_timeout, stats: Arc::new(TunnelStats::default()) }
    }

    pub fn stats(&self) -> Arc<TunnelStats> {
        Arc::clone(&self.stats)
    }

    /// Run the accept loop until `cancel` fires. Each accepted connection
    /// is handled on its own task so one slow backend cannot stall new
    /// connections on the same bind port.
    pub async fn run(self, cancel: CancellationToken) {
        let listener = match TcpListener::bind(("0.0.0.0", self.bind_port)).await {
            Ok(l) => l,
            Err(e) => {
                warn!(port = self.bind_port, error = %e, "failed to bind TCP tunnel listener");
                return;
            }
        };
        info!(port = self.bind_port, backend = %self.backend_addr, "TCP tunnel listening");

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    info!(port = self.bind_port, "TCP tunnel shutting down");
                    return;
                }
                accepted = listener.accept() => {
                    let (stream, peer) = match accepted {
                        Ok(v) => v,
                        Err(e) => { warn!(port = self.bind_port, error = %e, "accept failed"); continue; }
                    };
                    let acceptor = self.tls_acceptor.read().await.clone();
                    let backend_addr = self.backend_addr.clone();
                    let bind_port = self.bind_port;
                    let connect_timeout = self.connect_timeout;
                    let stats = Arc::clone(&self.stats);
                    tokio::spawn(async move {
                        handle_connection(stream, peer, acceptor, backend_addr, bind_port, connect_timeout, stats)
                            .await;
                    });
                }
            }
        }
    }
}

async fn handle_connection(
    stream: TcpStream,
    peer: SocketAddr,
    acceptor: TlsAcceptor,
    backend_addr: String,
    bind_port: u16,
    connect_timeout: Duration,
    stats: Arc<TunnelStats>,
) {
    let tls_stream = match acceptor.accept(stream).await {
        Ok(s) => s,
        Err(e) => {
            debug!(%peer, port = bind_port, error = %e, "TLS handshake failed");
            return;
        }
    };

    let mut upstream = match tokio::time::timeout(connect_timeout, TcpStream::connect(&backend_addr)).await {
        Ok(Ok(s)) => s,
        Ok(Err(e)) => {
            warn!(%peer, backend = %backend_addr, port = bind_port, error = %e, "failed to dial backend");
            return;
        }
        Err(_) => {
            warn!(%peer, backend = %backend_addr, port = bind_port, "backend dial timed out");
            return;
        }
    };

    stats.connections.fetch_add(1, Ordering::Relaxed);
    info!(%peer, backend = %backend_addr, port = bind_port, "tunnel connection opened");

    let mut client = tls_stream;
    match copy_bidirectional_counted(&mut client, &mut upstream, &stats).await {
        Ok(()) => info!(%peer, backend = %backend_addr, port = bind_port, "tunnel connection closed"),
        Err(e) => debug!(%peer, backend = %backend_addr, port = bind_port, error = %e, "tunnel connection ended with error"),
    }
}

/// Bidirectional byte copy; closes both sides on the first error or EOF,
/// logging exactly once at the call site (§4.3 "exactly-once" rule).
async fn copy_bidirectional_counted<C, U>(
    client: &mut C,
    upstream: &mut U,
    stats: &TunnelStats,
) -> std::io::Result<()>
where
    C: AsyncRead + AsyncWrite + Unpin,
    U: AsyncRead + AsyncWrite + Unpin,
{
    let (from_client, from_upstream) = tokio::io::copy_bidirectional(client, upstream).await?;
    stats.bytes_forwarded.fetch_add(from_client + from_upstream, Ordering::Relaxed);
    let _ = client.shutdown().await;
    let _ = upstream.shutdown().await;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use rustls_pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer, ServerName, UnixTime};
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio_rustls::rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
    use tokio_rustls::rustls::{ClientConfig, DigitallySignedStruct, ServerConfig, SignatureScheme};
    use tokio_rustls::TlsConnector;

    #[derive(Debug)]
    struct AcceptAny;

    impl ServerCertVerifier for AcceptAny {
        fn verify_server_cert(
            &self,
            _end_entity: &CertificateDer<'_>,
            _intermediates: &[CertificateDer<'_>],
            _server_name: &ServerName<'_>,
            _ocsp_response: &[u8],
            _now: UnixTime,
        ) -> Result<ServerCertVerified, tokio_rustls::rustls::Error> {
            Ok(ServerCertVerified::assertion())
        }
        fn verify_tls12_signature(
            &self,
            _message: &[u8],
            _cert: &CertificateDer<'_>,
            _dss: &DigitallySignedStruct,
        ) -> Result<HandshakeSignatureValid, tokio_rustls::rustls::Error> {
            Ok(HandshakeSignatureValid::assertion())
        }
        fn verify_tls13_signature(
            &self,
            _message: &[u8],
            _cert: &CertificateDer<'_>,
            _dss: &DigitallySignedStruct,
        ) -> Result<HandshakeSignatureValid, tokio_rustls::rustls::Error> {
            Ok(HandshakeSignatureValid::assertion())
        }
        fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
            vec![SignatureScheme::ECDSA_NISTP256_SHA256, SignatureScheme::ED25519, SignatureScheme::RSA_PKCS1_SHA256]
        }
    }

    fn self_signed_acceptor() -> TlsAcceptor {
        let rcgen::CertifiedKey { cert, signing_key } =
            rcgen::generate_simple_self_signed(vec!["localhost".to_string()]).unwrap();
        let leaf = CertificateDer::from(cert.der().to_vec());
        let key_der = PrivatePkcs8KeyDer::from(signing_key.serialize_der());
        let server_config = ServerConfig::builder()
            .with_no_client_auth()
            .with_single_cert(vec![leaf], PrivateKeyDer::Pkcs8(key_der))
            .unwrap();
        TlsAcceptor::from(Arc::new(server_config))
    }

    /// S5: a TLS client connects to the tunnel's bind port, writes bytes;
    /// the plain-TCP backend receives them exactly and replies; the client
    /// reads the reply; closing the client closes the backend side too.
    #[tokio::test]
    async fn s5_relays_bytes_exactly_in_both_directions() {
        let backend_listener = TcpListener::bind(("127.0.0.1", 0)).await.unwrap();
        let backend_addr = backend_listener.local_addr().unwrap();
        let backend_task = tokio::spawn(async move {
            let (mut sock, _) = backend_listener.accept().await.unwrap();
            let mut buf = [0u8; 3];
            sock.read_exact(&mut buf).await.unwrap();
            assert_eq!(&buf, b"XYZ");
            sock.write_all(b"ABC").await.unwrap();
            sock.shutdown().await.unwrap();
        });

        let bind_listener = TcpListener::bind(("127.0.0.1", 0)).await.unwrap();
        let bind_port = bind_listener.local_addr().unwrap().port();
        drop(bind_listener);

        let acceptor = Arc::new(RwLock::new(self_signed_acceptor()));
        let tunnel =
            Tunnel::new(bind_port, backend_addr.to_string(), Arc::clone(&acceptor), Duration::from_secs(10));
        let stats = tunnel.stats();
        let cancel = CancellationToken::new();
        let run_cancel = cancel.clone();
        let tunnel_task = tokio::spawn(async move { tunnel.run(run_cancel).await });

        // Give the accept loop a moment to bind before dialing.
        tokio::time::sleep(Duration::from_millis(50)).await;

        let client_config = ClientConfig::builder()
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(AcceptAny))
            .with_no_client_auth();
        let connector = TlsConnector::from(Arc::new(client_config));
        let tcp = TcpStream::connect(("127.0.0.1", bind_port)).await.unwrap();
        let server_name = ServerName::try_from("localhost").unwrap();
        let mut tls = connector.connect(server_name, tcp).await.unwrap();

        tls.write_all(b"XYZ").await.unwrap();
        let mut reply = [0u8; 3];
        tls.read_exact(&mut reply).await.unwrap();
        assert_eq!(&reply, b"ABC");

        tls.shutdown().await.unwrap();
        let closed = tokio::time::timeout(Duration::from_secs(2), tls.read(&mut [0u8; 1])).await;
        assert!(matches!(closed, Ok(Ok(0)) | Err(_) | Ok(Err(_))));

        backend_task.await.unwrap();
        cancel.cancel();
        tunnel_task.await.unwrap();

        assert_eq!(stats.connections.load(Ordering::Relaxed), 1);
        assert!(stats.bytes_forwarded.load(Ordering::Relaxed) >= 6);
    }
}
