use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use http::{Request, Response, StatusCode};
use http_body_util::combinators::BoxBody;
use http_body_util::BodyExt;
use hyper::body::Incoming;
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder as ConnBuilder;
use tokio::net::TcpListener;
use tokio::sync::RwLock;
use tokio_rustls::TlsAcceptor;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::Result;
use crate::leasor::ACME_CHALLENGE_PATTERN;

use super::backend_client::{empty_body, RespBody};
use super::connection::ConnectionManager;
use super::forwarder::orig_address_header;
use super::{BackendClient, RoutingTable};

pub struct HttpProxyConfig {
    pub listen_http: SocketAddr,
    pub listen_https: SocketAddr,
    pub acme_webroot: Option<PathBuf>,
    pub max_connections: usize,
    pub shutdown_timeout: Duration,
    pub tls_handshake_timeout: Duration,
}

/// Run the HTTPS listener (routing + TLS termination + ACME webroot) and
/// the plain-HTTP redirect listener until `cancel` fires, waiting up to
/// `shutdown_timeout` for in-flight HTTPS requests to drain.
pub async fn run(
    config: HttpProxyConfig,
    routing: Arc<RoutingTable>,
    backend_client: Arc<BackendClient>,
    tls_acceptor: Arc<RwLock<TlsAcceptor>>,
    cancel: CancellationToken,
) -> Result<()> {
    let https_listener = TcpListener::bind(config.listen_https).await?;
    let http_listener = TcpListener::bind(config.listen_http).await?;
    info!(https = %config.listen_https, http = %config.listen_http, "HTTP proxy listening");

    let connections = Arc::new(ConnectionManager::new(config.max_connections));
    let acme_webroot = config.acme_webroot.map(Arc::new);

    let https_cancel = cancel.clone();
    let https_connections = Arc::clone(&connections);
    let https_routing = Arc::clone(&routing);
    let https_backend = Arc::clone(&backend_client);
    let https_webroot = acme_webroot.clone();
    let tls_handshake_timeout = config.tls_handshake_timeout;
    let https_task = tokio::spawn(async move {
        run_https_listener(
            https_listener,
            https_routing,
            https_backend,
            tls_acceptor,
            https_webroot,
            https_connections,
            tls_handshake_timeout,
            https_cancel,
        )
        .await;
    });

    let http_cancel = cancel.clone();
    let http_task = tokio::spawn(async move {
        run_http_redirect_listener(http_listener, http_cancel).await;
    });

    cancel.cancelled().await;
    connections.wait_drained(config.shutdown_timeout).await;
    let _ = https_task.await;
    let _ = http_task.await;
    Ok(())
}

async fn run_https_listener(
    listener: TcpListener,
    routing: Arc<RoutingTable>,
    backend_client: Arc<BackendClient>,
    tls_acceptor: Arc<RwLock<TlsAcceptor>>,
    acme_webroot: Option<Arc<PathBuf>>,
    connections: Arc<ConnectionManager>,
    tls_handshake_timeout: Duration,
    cancel: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = cancel.cancelled() => return,
            accepted = listener.accept() => {
                let (stream, peer) = match accepted {
                    Ok(v) => v,
                    Err(e) => { warn!(error = %e, "accept failed"); continue; }
                };
                let Some(guard) = connections.try_admit() else {
                    debug!(%peer, "rejecting connection: max_connections reached");
                    continue;
                };
                let routing = Arc::clone(&routing);
                let backend_client = Arc::clone(&backend_client);
                let acceptor = tls_acceptor.read().await.clone();
                let acme_webroot = acme_webroot.clone();
                tokio::spawn(async move {
                    let _guard = guard;
                    match tokio::time::timeout(tls_handshake_timeout, acceptor.accept(stream)).await {
                        Ok(Ok(tls_stream)) => {
                            serve_https(tls_stream, peer, routing, backend_client, acme_webroot).await;
                        }
                        Ok(Err(e)) => debug!(%peer, error = %e, "TLS handshake failed"),
                        Err(_) => debug!(%peer, "TLS handshake timed out"),
                    }
                });
            }
        }
    }
}

async fn serve_https<S>(
    stream: S,
    peer: SocketAddr,
    routing: Arc<RoutingTable>,
    backend_client: Arc<BackendClient>,
    acme_webroot: Option<Arc<PathBuf>>,
) where
    S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin + Send + 'static,
{
    let svc = hyper::service::service_fn(move |req: Request<Incoming>| {
        let routing = Arc::clone(&routing);
        let backend_client = Arc::clone(&backend_client);
        let acme_webroot = acme_webroot.clone();
        async move { Ok::<_, hyper::Error>(handle_request(req, peer, routing, backend_client, acme_webroot).await) }
    });

    let builder = ConnBuilder::new(TokioExecutor::new());
    if let Err(e) = builder.serve_connection(TokioIo::new(stream), svc).await {
        debug!(%peer, error = %e, "connection closed with error");
    }
}

async fn run_http_redirect_listener(listener: TcpListener, cancel: CancellationToken) {
    loop {
        tokio::select! {
            _ = cancel.cancelled() => return,
            accepted = listener.accept() => {
                let (stream, peer) = match accepted {
                    Ok(v) => v,
                    Err(e) => { warn!(error = %e, "accept failed"); continue; }
                };
                tokio::spawn(async move {
                    let svc = hyper::service::service_fn(|req: Request<Incoming>| async move {
                        Ok::<_, hyper::Error>(redirect_to_https(&req))
                    });
                    let builder = ConnBuilder::new(TokioExecutor::new());
                    if let Err(e) = builder.serve_connection(TokioIo::new(stream), svc).await {
                        debug!(%peer, error = %e, "plain-HTTP connection closed with error");
                    }
                });
            }
        }
    }
}

/// The plain-HTTP listener serves only this: a 303 redirect to the same
/// URL with scheme `https` and the host stripped of its port (§4.2).
fn redirect_to_https<B>(req: &Request<B>) -> Response<RespBody> {
    let host = req
        .headers()
        .get(http::header::HOST)
        .and_then(|h| h.to_str().ok())
        .unwrap_or("");
    let host_no_port = host.split(':').next().unwrap_or(host);
    let path_and_query = req.uri().path_and_query().map(|pq| pq.as_str()).unwrap_or("/");
    let location = format!("https://{host_no_port}{path_and_query}");

    Response::builder()
        .status(StatusCode::SEE_OTHER)
        .header(http::header::LOCATION, location)
        .body(empty_body())
        .unwrap_or_else(|_| internal_error())
}

async fn handle_request(
    mut req: Request<Incoming>,
    peer: SocketAddr,
    routing: Arc<RoutingTable>,
    backend_client: Arc<BackendClient>,
    acme_webroot: Option<Arc<PathBuf>>,
) -> Response<RespBody> {
    let path = req.uri().path().to_string();
    let host = req
        .headers()
        .get(http::header::HOST)
        .and_then(|h| h.to_str().ok())
        .map(|h| h.split(':').next().unwrap_or(h).to_string());

    if let Some(webroot) = &acme_webroot {
        if let Some(token) = path.strip_prefix(ACME_CHALLENGE_PATTERN) {
            return serve_acme_challenge(webroot, token).await;
        }
    }

    let Some(forwarder) = routing.match_path(host.as_deref(), &path) else {
        return not_found();
    };

    if forwarder.pattern.needs_redirect(host.as_deref(), &path) {
        let location = format!("{}/", path);
        return Response::builder()
            .status(StatusCode::SEE_OTHER)
            .header(http::header::LOCATION, location)
            .body(empty_body())
            .unwrap_or_else(|_| internal_error());
    }

    let new_path = forwarder.rewrite_path(&path);
    let query = req.uri().query().map(str::to_string);
    let target = match forwarder.target_uri(&new_path, query.as_deref()) {
        Ok(u) => u,
        Err(e) => {
            warn!(error = %e, "failed to build backend target URI");
            return bad_gateway();
        }
    };

    *req.uri_mut() = target;
    let scheme = forwarder.scheme();
    req.headers_mut().insert(
        http::header::HOST,
        http::HeaderValue::from_str(&forwarder.backend_host_port()).unwrap_or(http::HeaderValue::from_static("")),
    );
    req.headers_mut().insert("Orig-Address", orig_address_header(peer));
    if !req.headers().contains_key(http::header::USER_AGENT) {
        req.headers_mut().insert(http::header::USER_AGENT, http::HeaderValue::from_static(""));
    }
    let _ = scheme; // scheme is embedded in `target` already.

    let (parts, body) = req.into_parts();
    let boxed_body: RespBody = body.map_err(|e| e).boxed();
    let req = Request::from_parts(parts, boxed_body);

    match backend_client.send(&forwarder.backend_host_port(), forwarder.uses_tls, req).await {
        Ok(resp) => {
            let (parts, body) = resp.into_parts();
            Response::from_parts(parts, body.map_err(|e| e).boxed())
        }
        Err(e) => {
            warn!(error = %e, pattern = %forwarder.pattern.raw, "backend dial/request failed");
            bad_gateway()
        }
    }
}

async fn serve_acme_challenge(webroot: &PathBuf, token: &str) -> Response<RespBody> {
    if token.is_empty() || token.contains('/') || token.contains("..") {
        return not_found();
    }
    let path = webroot.join(token);
    match tokio::fs::metadata(&path).await {
        Ok(meta) if meta.is_file() => {}
        _ => return not_found(),
    }
    match tokio::fs::read(&path).await {
        Ok(bytes) => Response::builder()
            .status(StatusCode::OK)
            .body(full_body(bytes))
            .unwrap_or_else(|_| internal_error()),
        Err(e) => {
            warn!(error = %e, "failed to read ACME challenge file");
            internal_error()
        }
    }
}

fn full_body(bytes: Vec<u8>) -> RespBody {
    http_body_util::Full::new(Bytes::from(bytes)).map_err(|never| match never {}).boxed()
}

fn not_found() -> Response<RespBody> {
    Response::builder().status(StatusCode::NOT_FOUND).body(empty_body()).unwrap_or_else(|_| internal_error())
}

fn bad_gateway() -> Response<RespBody> {
    Response::builder().status(StatusCode::BAD_GATEWAY).body(empty_body()).unwrap_or_else(|_| internal_error())
}

fn internal_error() -> Response<RespBody> {
    let mut resp = Response::new(empty_body());
    *resp.status_mut() = StatusCode::INTERNAL_SERVER_ERROR;
    resp
}
