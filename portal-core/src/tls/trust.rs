use std::sync::Arc;

use arc_swap::ArcSwap;
use rustls_pki_types::pem::PemObject;
use rustls_pki_types::{CertificateDer, PrivateKeyDer};
use tokio_rustls::rustls::{ClientConfig, RootCertStore};

use crate::error::{ProxyError, Result};

/// Rotating set of trust anchors used for mTLS between Portal and backends
/// that registered with a CSR.
///
/// Rotation is a single atomic pointer swap under no lock (§4.6,
/// §9 "Global mutable state, part 2"); it is never held across an outbound
/// network call because there is no lock to hold at all.
pub struct RootCaStore {
    inner: ArcSwap<RootCertStore>,
}

impl RootCaStore {
    pub fn new(initial: impl IntoIterator<Item = Vec<u8>>) -> Result<Self> {
        let mut store = RootCertStore::empty();
        for der in initial {
            store
                .add(CertificateDer::from(der))
                .map_err(|e| ProxyError::Tls(format!("invalid root CA certificate: {e}")))?;
        }
        Ok(Self { inner: ArcSwap::from_pointee(store) })
    }

    pub fn empty() -> Self {
        Self { inner: ArcSwap::from_pointee(RootCertStore::empty()) }
    }

    /// Atomically replace the trust anchor set.
    pub fn rotate(&self, certs: impl IntoIterator<Item = Vec<u8>>) -> Result<()> {
        let mut store = RootCertStore::empty();
        for der in certs {
            store
                .add(CertificateDer::from(der))
                .map_err(|e| ProxyError::Tls(format!("invalid root CA certificate: {e}")))?;
        }
        self.inner.store(Arc::new(store));
        Ok(())
    }

    /// Add a single DER-encoded certificate to the current set, preserving
    /// everything already trusted.
    pub fn add(&self, der: Vec<u8>) -> Result<()> {
        let current = self.inner.load();
        let mut next = (**current).clone();
        next.add(CertificateDer::from(der))
            .map_err(|e| ProxyError::Tls(format!("invalid root CA certificate: {e}")))?;
        self.inner.store(Arc::new(next));
        Ok(())
    }

    pub fn snapshot(&self) -> Arc<RootCertStore> {
        self.inner.load_full()
    }

    /// Build a `ClientConfig` for dialing a backend: trusts every CA
    /// currently in the store and presents Portal's own server certificate
    /// as a client certificate, per §4.2's mutual-trust requirement.
    pub fn client_config(
        &self,
        client_cert: Vec<CertificateDer<'static>>,
        client_key: PrivateKeyDer<'static>,
    ) -> Result<ClientConfig> {
        let roots = (*self.snapshot()).clone();
        ClientConfig::builder()
            .with_root_certificates(roots)
            .with_client_auth_cert(client_cert, client_key)
            .map_err(|e| ProxyError::Tls(format!("failed to build backend client TLS config: {e}")))
    }
}

/// Parse a bundle of PEM-encoded root certificates from disk, as used for
/// `TlsConfig::extra_root_certs_path` bootstrap overrides.
pub fn load_pem_bundle(path: &str) -> Result<Vec<Vec<u8>>> {
    let bytes = std::fs::read(path)
        .map_err(|e| ProxyError::Tls(format!("failed to read root CA bundle {path}: {e}")))?;
    CertificateDer::pem_slice_iter(&bytes)
        .map(|r| r.map(|c| c.to_vec()))
        .collect::<std::result::Result<Vec<_>, _>>()
        .map_err(|e| ProxyError::Tls(format!("failed to parse root CA bundle {path}: {e}")))
}
