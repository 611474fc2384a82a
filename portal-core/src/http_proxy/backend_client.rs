use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use http::{Request, Response};
use http_body_util::combinators::BoxBody;
use http_body_util::BodyExt;
use hyper::body::Incoming;
use hyper_util::rt::TokioIo;
use rustls_pki_types::{CertificateDer, PrivateKeyDer, ServerName};
use tokio::net::TcpStream;
use tokio_rustls::TlsConnector;

use crate::error::{ProxyError, Result};
use crate::tls::RootCaStore;

pub type RespBody = BoxBody<Bytes, hyper::Error>;

/// Dials backends on behalf of the HTTP proxy. Backends that registered
/// with a CSR are reached via mTLS, where Portal presents its own signed
/// server certificate as a *client* certificate and trusts any CA
/// currently in `roots` (§4.2).
pub struct BackendClient {
    roots: Arc<RootCaStore>,
    client_cert: Vec<CertificateDer<'static>>,
    client_key: PrivateKeyDer<'static>,
    connect_timeout: Duration,
    idle_timeout: Duration,
}

impl BackendClient {
    pub fn new(
        roots: Arc<RootCaStore>,
        client_cert: Vec<CertificateDer<'static>>,
        client_key: PrivateKeyDer<'static>,
        connect_timeout: Duration,
        idle_timeout: Duration,
    ) -> Self {
        Self { roots, client_cert, client_key, connect_timeout, idle_timeout }
    }

    /// Send `req` to `host_port`, establishing a fresh connection per
    /// call. Portal's expected backend fleet is small (O(10^2) routes)
    /// and short-lived per request, so a one-shot handshake keeps this
    /// layer simple; see SPEC_FULL.md §9 on the longest-prefix scan for
    /// the same "adequate at this scale" reasoning.
    pub async fn send(
        &self,
        host_port: &str,
        uses_tls: bool,
        req: Request<RespBody>,
    ) -> Result<Response<Incoming>> {
        let tcp = tokio::time::timeout(self.connect_timeout, TcpStream::connect(host_port))
            .await
            .map_err(|_| ProxyError::Http(format!("timed out dialing backend {host_port}")))?
            .map_err(|e| ProxyError::Http(format!("failed to dial backend {host_port}: {e}")))?;

        if uses_tls {
            let host = host_port.rsplit_once(':').map(|(h, _)| h).unwrap_or(host_port);
            let config = self
                .roots
                .client_config(self.client_cert.clone(), self.client_key.clone_key())?;
            let connector = TlsConnector::from(Arc::new(config));
            let server_name = ServerName::try_from(host.to_string())
                .map_err(|e| ProxyError::Tls(format!("invalid backend server name {host}: {e}")))?;
            let tls_stream = connector
                .connect(server_name, tcp)
                .await
                .map_err(|e| ProxyError::Tls(format!("mTLS handshake with {host_port} failed: {e}")))?;
            self.send_over(tls_stream, req).await
        } else {
            self.send_over(tcp, req).await
        }
    }

    async fn send_over<S>(&self, stream: S, req: Request<RespBody>) -> Result<Response<Incoming>>
    where
        S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin + Send + 'static,
    {
        let io = TokioIo::new(stream);
        let (mut sender, conn) = hyper::client::conn::http1::handshake(io)
            .await
            .map_err(|e| ProxyError::Http(format!("backend handshake failed: {e}")))?;

        tokio::spawn(async move {
            if let Err(e) = conn.await {
                tracing::debug!(error = %e, "backend connection closed");
            }
        });

        tokio::time::timeout(self.idle_timeout, sender.send_request(req))
            .await
            .map_err(|_| ProxyError::Http("backend request timed out waiting for a response".to_string()))?
            .map_err(|e| ProxyError::Http(format!("backend request failed: {e}")))
    }
}

pub fn empty_body() -> RespBody {
    http_body_util::Empty::<Bytes>::new().map_err(|never| match never {}).boxed()
}
