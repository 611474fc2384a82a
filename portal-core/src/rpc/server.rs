use std::net::SocketAddr;
use std::sync::Arc;

use tonic::{Request, Response, Status};
use tracing::info;

use crate::http_proxy::{Forwarder, RoutingTable};
use crate::leasor::{CancellationHook, Lease, Leasor, LeasorError, Pattern, Registration};
use crate::leasor::RegisterRequest as DomainRegisterRequest;
use crate::tcp_proxy::TcpProxy;
use crate::tls::CertAuthority;

use super::pb;
use super::pb::portal_server::Portal;

/// The `Portal` gRPC service: dispatches `Register`/`Renew`/`Unregister`
/// through the Leasor, then installs (or tears down) the matching
/// forwarder in the HTTP routing table or TCP tunnel manager (§4.4).
pub struct PortalService {
    leasor: Arc<Leasor>,
    routing: Arc<RoutingTable>,
    tcp_proxy: Arc<TcpProxy>,
    hostname: String,
    /// `None` disables the CSR flow: backends submitting a
    /// `certificate_request` get `InvalidRequest` instead of a signed cert.
    ca: Option<Arc<CertAuthority>>,
}

impl PortalService {
    pub fn new(
        leasor: Arc<Leasor>,
        routing: Arc<RoutingTable>,
        tcp_proxy: Arc<TcpProxy>,
        hostname: String,
        ca: Option<Arc<CertAuthority>>,
    ) -> Self {
        Self { leasor, routing, tcp_proxy, hostname, ca }
    }

    /// Sign `csr` with the configured CA, if any.
    fn sign(&self, csr: &[u8]) -> Result<Vec<u8>, Status> {
        let ca = self
            .ca
            .as_ref()
            .ok_or_else(|| Status::failed_precondition("this server has no certificate-signing CA configured"))?;
        ca.sign_csr(csr).map_err(|e| Status::internal(e.to_string()))
    }

    /// Build the cancellation hook for `pattern`. Referenced only by the
    /// pattern's own key (the routing-table pattern string, or the TCP
    /// bind port) so it can be constructed *before* the Leasor has
    /// assigned a port for this registration (§9 "Cyclic backreferences").
    pub fn build_hook(routing: &Arc<RoutingTable>, tcp_proxy: &Arc<TcpProxy>, pattern: &Pattern) -> CancellationHook {
        match pattern {
            Pattern::Http(p) => {
                let routing = Arc::clone(routing);
                let raw = p.raw.clone();
                Box::new(move || routing.remove(&raw))
            }
            Pattern::Tcp { bind_port } => {
                let tcp_proxy = Arc::clone(tcp_proxy);
                let bind_port = *bind_port;
                Box::new(move || tcp_proxy.remove_port(bind_port))
            }
        }
    }

    /// Install the live forwarder/tunnel for a just-granted or just-replayed
    /// lease.
    fn install(&self, pattern: &Pattern, strip_pattern: bool, uses_tls: bool, client_addr: &str, lease: &Lease) {
        match pattern {
            Pattern::Http(p) => {
                let forwarder = Arc::new(Forwarder {
                    pattern: p.clone(),
                    lease: lease.clone(),
                    strip_pattern,
                    client_addr: client_addr.to_string(),
                    uses_tls,
                });
                self.routing.insert(forwarder);
            }
            Pattern::Tcp { bind_port } => {
                let host = client_addr.rsplit_once(':').map(|(h, _)| h).unwrap_or(client_addr);
                let backend_addr = format!("{host}:{}", lease.port);
                self.tcp_proxy.install(*bind_port, backend_addr);
            }
        }
    }

    /// Replay every persisted registration into the routing table / TCP
    /// proxy at startup, after `Leasor::load_persisted` has already
    /// revalidated (and possibly extended the TTL of) each one.
    pub fn install_persisted(&self, registrations: &[Registration]) {
        for reg in registrations {
            let uses_tls = reg.request.certificate_request.is_some();
            self.install(
                &reg.request.pattern,
                reg.request.strip_pattern,
                uses_tls,
                &reg.client_addr,
                &reg.lease,
            );
        }
    }
}

fn peer_addr<T>(request: &Request<T>) -> String {
    request
        .extensions()
        .get::<Option<SocketAddr>>()
        .copied()
        .flatten()
        .map(|a| a.to_string())
        .unwrap_or_else(|| "unknown".to_string())
}

/// Map a Leasor error onto the `tonic::Status` table from §7, preserving
/// the variant name in the message so `portal-client` can parse it back
/// without custom status details.
pub fn leasor_error_to_status(err: LeasorError) -> Status {
    match err {
        LeasorError::NotRegistered { .. } => Status::not_found(err.to_string()),
        LeasorError::PatternMismatch { .. } => Status::failed_precondition(err.to_string()),
        LeasorError::FixedPortTaken(_) => Status::already_exists(err.to_string()),
        LeasorError::PatternCovered { .. } => Status::already_exists(err.to_string()),
        LeasorError::ReservedPattern(_) => Status::not_found(err.to_string()),
        LeasorError::OutOfPorts => Status::resource_exhausted(err.to_string()),
        LeasorError::InvalidRequest(_) => Status::invalid_argument(err.to_string()),
        LeasorError::Fatal(_) => Status::internal(err.to_string()),
    }
}

#[tonic::async_trait]
impl Portal for PortalService {
    async fn register(&self, request: Request<pb::RegisterRequest>) -> Result<Response<pb::Lease>, Status> {
        let client_addr = peer_addr(&request);
        let wire = request.into_inner();
        let domain_req =
            DomainRegisterRequest::try_from(wire).map_err(|e| Status::invalid_argument(e.to_string()))?;

        let pattern = domain_req.pattern.clone();
        let strip_pattern = domain_req.strip_pattern;
        let uses_tls = domain_req.certificate_request.is_some();
        let csr = domain_req.certificate_request.clone();

        let hook = Self::build_hook(&self.routing, &self.tcp_proxy, &pattern);
        let mut lease = self
            .leasor
            .register(client_addr.clone(), domain_req, hook)
            .map_err(leasor_error_to_status)?;

        if let Some(csr) = csr {
            let cert = self.sign(&csr)?;
            lease = self.leasor.attach_certificate(&pattern, cert).map_err(leasor_error_to_status)?;
        }

        self.install(&pattern, strip_pattern, uses_tls, &client_addr, &lease);
        info!(pattern = %pattern, port = lease.port, %client_addr, "registered lease");
        Ok(Response::new(lease.to_proto()))
    }

    async fn renew(&self, request: Request<pb::Lease>) -> Result<Response<pb::Lease>, Status> {
        let wire = request.into_inner();
        let lease = Lease::try_from(wire).map_err(|e| Status::invalid_argument(e.to_string()))?;
        let mut renewed = self.leasor.renew(&lease).map_err(leasor_error_to_status)?;

        if let Some(reg) = self.leasor.registration(&renewed.pattern) {
            if let Some(csr) = &reg.request.certificate_request {
                let cert = self.sign(csr)?;
                renewed = self.leasor.attach_certificate(&renewed.pattern, cert).map_err(leasor_error_to_status)?;
            }
        }

        Ok(Response::new(renewed.to_proto()))
    }

    async fn unregister(&self, request: Request<pb::Lease>) -> Result<Response<pb::Lease>, Status> {
        let wire = request.into_inner();
        let lease = Lease::try_from(wire).map_err(|e| Status::invalid_argument(e.to_string()))?;
        self.leasor.unregister(&lease).map_err(leasor_error_to_status)?;
        info!(pattern = %lease.pattern, port = lease.port, "unregistered lease");
        Ok(Response::new(lease.to_proto()))
    }

    async fn get_hostname(&self, _request: Request<pb::Empty>) -> Result<Response<pb::HostnameReply>, Status> {
        Ok(Response::new(pb::HostnameReply { hostname: self.hostname.clone() }))
    }
}
