use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::TcpListener;
use tokio::sync::RwLock;
use tokio_rustls::{server::TlsStream, TlsAcceptor};
use tokio_stream::wrappers::TcpListenerStream;
use tokio_stream::StreamExt;
use tokio_util::sync::CancellationToken;
use tonic::transport::server::Connected;
use tonic::transport::Server;
use tracing::info;

use crate::error::{ProxyError, Result};

use super::auth::AuthInterceptor;
use super::pb::portal_server::PortalServer;
use super::server::PortalService;

/// Wraps our hot-reloadable `TlsStream` so it can be fed into tonic's
/// `serve_with_incoming`. `Connected::connect_info` is how `peer_addr`
/// ends up in each request's extensions (see `server::peer_addr`), since
/// we bypass tonic's own TLS transport in favor of the shared
/// `tls::setup::TlsSetup` acceptor used by the HTTP and TCP proxies too.
struct RpcConn(TlsStream<tokio::net::TcpStream>);

impl Connected for RpcConn {
    type ConnectInfo = Option<SocketAddr>;

    fn connect_info(&self) -> Self::ConnectInfo {
        self.0.get_ref().0.peer_addr().ok()
    }
}

impl AsyncRead for RpcConn {
    fn poll_read(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &mut ReadBuf<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().0).poll_read(cx, buf)
    }
}

impl AsyncWrite for RpcConn {
    fn poll_write(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &[u8]) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.get_mut().0).poll_write(cx, buf)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().0).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().0).poll_shutdown(cx)
    }
}

/// Run the RPC server until `cancel` fires, terminating TLS itself (via
/// the shared hot-reloadable acceptor) rather than through tonic's own
/// TLS transport, and enforcing the bearer-token `AuthInterceptor` on
/// every call.
pub async fn run(
    bind_addr: SocketAddr,
    tls_acceptor: Arc<RwLock<TlsAcceptor>>,
    service: PortalService,
    api_token: String,
    cancel: CancellationToken,
) -> Result<()> {
    let listener = TcpListener::bind(bind_addr).await?;
    info!(%bind_addr, "RPC server listening");

    let incoming = TcpListenerStream::new(listener).then(move |accepted| {
        let tls_acceptor = Arc::clone(&tls_acceptor);
        async move {
            let stream = accepted?;
            let acceptor = tls_acceptor.read().await.clone();
            acceptor.accept(stream).await.map(RpcConn)
        }
    });

    let interceptor = AuthInterceptor::new(api_token);
    let svc = PortalServer::with_interceptor(service, interceptor);

    Server::builder()
        .add_service(svc)
        .serve_with_incoming_shutdown(incoming, cancel.cancelled())
        .await
        .map_err(|e| ProxyError::Http(format!("RPC server error: {e}")))?;

    Ok(())
}
