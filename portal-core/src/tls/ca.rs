use rcgen::{CertificateSigningRequestParams, Issuer, KeyPair};
use rustls_pki_types::{CertificateDer, PrivateKeyDer};

use crate::error::{ProxyError, Result};

/// Signs backend-submitted CSRs using Portal's own server cert/key as the
/// issuing CA (§4.5 CSR flow). Portal's cert is self-signed, so a backend
/// cert signed by this `CertAuthority` chains straight back to the same
/// identity Portal adds to its own root-CA set at startup.
pub struct CertAuthority {
    issuer: Issuer<'static, KeyPair>,
}

impl CertAuthority {
    pub fn new(ca_cert: &CertificateDer<'static>, ca_key: &PrivateKeyDer<'static>) -> Result<Self> {
        let key_pair = KeyPair::from_der(ca_key.secret_der())
            .map_err(|e| ProxyError::Tls(format!("failed to load CA private key: {e}")))?;
        let issuer = Issuer::from_ca_cert_der(ca_cert.as_ref(), key_pair)
            .map_err(|e| ProxyError::Tls(format!("failed to load CA certificate: {e}")))?;
        Ok(Self { issuer })
    }

    /// Sign a DER-encoded CSR, returning the DER-encoded leaf certificate.
    pub fn sign_csr(&self, csr_der: &[u8]) -> Result<Vec<u8>> {
        let params = CertificateSigningRequestParams::from_der(csr_der)
            .map_err(|e| ProxyError::Tls(format!("invalid certificate signing request: {e}")))?;
        let cert = params
            .signed_by(&self.issuer)
            .map_err(|e| ProxyError::Tls(format!("failed to sign certificate request: {e}")))?;
        Ok(cert.der().to_vec())
    }
}
