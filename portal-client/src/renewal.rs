use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tonic::metadata::{Ascii, MetadataValue};
use tonic::service::interceptor::InterceptedService;
use tonic::service::Interceptor;
use tonic::transport::{Channel, Endpoint};
use tonic::{Request, Status};
use tracing::{info, warn};

use portal_core::rpc::pb;
use portal_core::rpc::pb::portal_client::PortalClient as RawClient;

use crate::csr::{CertResolver, ClientIdentity};
use crate::error::ClientError;
use crate::transport::InsecureTlsConnector;

#[derive(Clone)]
struct BearerAuth {
    token: MetadataValue<Ascii>,
}

impl BearerAuth {
    fn new(token: &str) -> Result<Self, ClientError> {
        let value: MetadataValue<Ascii> = format!("Bearer {token}")
            .parse()
            .map_err(|_| ClientError::InvalidRequest("api token contains invalid header characters".to_string()))?;
        Ok(Self { token: value })
    }
}

impl Interceptor for BearerAuth {
    fn call(&mut self, mut request: Request<()>) -> Result<Request<()>, Status> {
        request.metadata_mut().insert("authorization", self.token.clone());
        Ok(request)
    }
}

type Inner = RawClient<InterceptedService<Channel, BearerAuth>>;

/// One backend's connection to a Portal server: issues `Register`/`Renew`/
/// `Unregister`/`GetHostname` calls directly, and can drive the background
/// renewal loop described in §4.5.
pub struct PortalClient {
    inner: Mutex<Inner>,
}

impl PortalClient {
    /// Dial `endpoint` (e.g. `https://portal.example.com:9443`) without
    /// validating the server's certificate against a CA — Portal's RPC
    /// listener cert is self-signed; the bearer token is what actually
    /// authenticates the channel.
    pub async fn connect(endpoint: &str, api_token: &str) -> Result<Self, ClientError> {
        let endpoint =
            Endpoint::from_shared(endpoint.to_string()).map_err(|e| ClientError::Connect(e.to_string()))?;
        let channel = endpoint
            .connect_with_connector(InsecureTlsConnector::new())
            .await
            .map_err(|e| ClientError::Connect(e.to_string()))?;
        let auth = BearerAuth::new(api_token)?;
        Ok(Self { inner: Mutex::new(RawClient::with_interceptor(channel, auth)) })
    }

    pub async fn register(&self, request: pb::RegisterRequest) -> Result<pb::Lease, ClientError> {
        let resp = self.inner.lock().await.register(request).await?;
        Ok(resp.into_inner())
    }

    pub async fn renew(&self, lease: pb::Lease) -> Result<pb::Lease, ClientError> {
        let resp = self.inner.lock().await.renew(lease).await?;
        Ok(resp.into_inner())
    }

    pub async fn unregister(&self, lease: pb::Lease) -> Result<pb::Lease, ClientError> {
        let resp = self.inner.lock().await.unregister(lease).await?;
        Ok(resp.into_inner())
    }

    pub async fn get_hostname(&self) -> Result<String, ClientError> {
        let resp = self.inner.lock().await.get_hostname(pb::Empty {}).await?;
        Ok(resp.into_inner().hostname)
    }

    /// Spawn the background renewal loop for `request`. Fires at
    /// `timeout - renew_buffer` before each lease's expiry; recovers from
    /// an expired lease (`NotRegistered`) by re-registering from scratch;
    /// unregisters and exits once `cancel` fires.
    pub fn spawn_renewal(
        self: Arc<Self>,
        request: pb::RegisterRequest,
        renew_buffer: Duration,
        identity: Option<Arc<ClientIdentity>>,
        cert_resolver: Option<Arc<CertResolver>>,
        cancel: CancellationToken,
    ) -> RenewalHandle {
        let handle = tokio::spawn(async move {
            renewal_loop(self, request, renew_buffer, identity, cert_resolver, cancel).await;
        });
        RenewalHandle { handle }
    }
}

/// Handle to a spawned renewal loop task.
pub struct RenewalHandle {
    handle: JoinHandle<()>,
}

impl RenewalHandle {
    pub async fn join(self) {
        let _ = self.handle.await;
    }
}

fn install_cert(identity: &Option<Arc<ClientIdentity>>, resolver: &Option<Arc<CertResolver>>, lease: &pb::Lease) {
    let (Some(identity), Some(resolver)) = (identity, resolver) else { return };
    if lease.certificate.is_empty() {
        return;
    }
    match identity.certified_key(lease.certificate.clone()) {
        Ok(key) => resolver.update(key),
        Err(e) => warn!(error = %e, "failed to install renewed certificate"),
    }
}

fn next_tick(lease: &pb::Lease, renew_buffer: Duration) -> Duration {
    let timeout = UNIX_EPOCH + Duration::from_secs(lease.timeout_unix_secs.max(0) as u64);
    let fire_at = timeout.checked_sub(renew_buffer).unwrap_or(UNIX_EPOCH);
    fire_at.duration_since(SystemTime::now()).unwrap_or(Duration::ZERO)
}

async fn renewal_loop(
    client: Arc<PortalClient>,
    original_request: pb::RegisterRequest,
    renew_buffer: Duration,
    identity: Option<Arc<ClientIdentity>>,
    cert_resolver: Option<Arc<CertResolver>>,
    cancel: CancellationToken,
) {
    let mut lease = match client.register(original_request.clone()).await {
        Ok(lease) => lease,
        Err(e) => {
            warn!(error = %e, "initial registration failed, renewal loop exiting");
            return;
        }
    };
    install_cert(&identity, &cert_resolver, &lease);
    info!(pattern = %lease.pattern, port = lease.port, "registered with portal");

    loop {
        let sleep = tokio::time::sleep(next_tick(&lease, renew_buffer));
        tokio::select! {
            _ = cancel.cancelled() => {
                if let Err(e) = client.unregister(lease.clone()).await {
                    warn!(error = %e, "unregister on shutdown failed");
                }
                return;
            }
            _ = sleep => {}
        }

        match client.renew(lease.clone()).await {
            Ok(renewed) => {
                lease = renewed;
                install_cert(&identity, &cert_resolver, &lease);
                info!(pattern = %lease.pattern, port = lease.port, "renewed lease");
            }
            Err(ClientError::NotRegistered) => {
                warn!("lease expired while partitioned, re-registering");
                match client.register(original_request.clone()).await {
                    Ok(fresh) => {
                        lease = fresh;
                        install_cert(&identity, &cert_resolver, &lease);
                    }
                    Err(e) => warn!(error = %e, "re-registration failed, retrying at next tick"),
                }
            }
            Err(e) => warn!(error = %e, "renew failed, retrying at next tick"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn next_tick_fires_renew_buffer_before_timeout() {
        let now = SystemTime::now().duration_since(UNIX_EPOCH).unwrap();
        let lease = pb::Lease {
            pattern: "/a/".to_string(),
            port: 1,
            timeout_unix_secs: (now.as_secs() + 3600) as i64,
            certificate: Vec::new(),
        };
        let delay = next_tick(&lease, Duration::from_secs(600));
        assert!(delay <= Duration::from_secs(3000) && delay > Duration::from_secs(2900));
    }

    #[test]
    fn next_tick_is_zero_once_past_the_buffer() {
        let lease = pb::Lease { pattern: "/a/".to_string(), port: 1, timeout_unix_secs: 1, certificate: Vec::new() };
        assert_eq!(next_tick(&lease, Duration::from_secs(600)), Duration::ZERO);
    }
}
