use std::sync::Arc;

use arc_swap::ArcSwapOption;
use rcgen::{CertificateParams, DnType, KeyPair};
use rustls_pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer};
use tokio_rustls::rustls::server::{ClientHello, ResolvesServerCert};
use tokio_rustls::rustls::sign::{self, CertifiedKey};

use crate::error::ClientError;

/// A generated keypair for the optional CSR flow (§4.5): built once at
/// startup, used to produce the CSR attached to `Register`, and to wrap
/// whatever signed leaf certificate comes back on `Register`/`Renew` into
/// a `CertifiedKey` a TLS server can present.
pub struct ClientIdentity {
    key_pair: KeyPair,
    hostname: String,
}

impl ClientIdentity {
    /// Generate a fresh keypair for `hostname` (as learned from
    /// `GetHostname`).
    pub fn generate(hostname: String) -> Result<Self, ClientError> {
        let key_pair = KeyPair::generate().map_err(|e| ClientError::Server(e.to_string()))?;
        Ok(Self { key_pair, hostname })
    }

    /// DER-encoded CSR to attach to `RegisterRequest::certificate_request`.
    pub fn csr_der(&self) -> Result<Vec<u8>, ClientError> {
        let mut params = CertificateParams::new(vec![self.hostname.clone()])
            .map_err(|e| ClientError::Server(e.to_string()))?;
        params.distinguished_name.push(DnType::CommonName, self.hostname.clone());
        let csr = params.serialize_request(&self.key_pair).map_err(|e| ClientError::Server(e.to_string()))?;
        Ok(csr.der().to_vec())
    }

    fn private_key_der(&self) -> PrivateKeyDer<'static> {
        PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(self.key_pair.serialize_der()))
    }

    /// Wrap a signed leaf certificate (from `Lease::certificate`) together
    /// with this identity's private key into a `CertifiedKey`.
    pub fn certified_key(&self, leaf_der: Vec<u8>) -> Result<CertifiedKey, ClientError> {
        let cert_chain = vec![CertificateDer::from(leaf_der)];
        let key = sign::any_supported_type(&self.private_key_der()).map_err(|e| ClientError::Server(e.to_string()))?;
        Ok(CertifiedKey::new(cert_chain, key))
    }
}

/// Hot-swappable server certificate for a backend's own TLS listener,
/// refreshed every time the renewal loop receives a new signed cert from
/// Portal. Mirrors the way `portal-core`'s `TlsSetup` hot-swaps its
/// `TlsAcceptor` on certificate rotation.
#[derive(Default)]
pub struct CertResolver {
    current: ArcSwapOption<CertifiedKey>,
}

impl CertResolver {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn update(&self, key: CertifiedKey) {
        self.current.store(Some(Arc::new(key)));
    }
}

impl std::fmt::Debug for CertResolver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CertResolver").finish_non_exhaustive()
    }
}

impl ResolvesServerCert for CertResolver {
    fn resolve(&self, _client_hello: ClientHello<'_>) -> Option<Arc<CertifiedKey>> {
        self.current.load_full()
    }
}
