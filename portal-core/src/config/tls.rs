use serde::Deserialize;

/// TLS termination configuration.
///
/// Portal uses a single cert/key pair for HTTPS, the RPC listener, and TCP
/// tunnel listeners alike (§5: "the TLS key material is held by the HTTP
/// Proxy ... and cloned into each TCP tunnel listener").
#[derive(Debug, Deserialize, Clone)]
pub struct TlsConfig {
    /// Path to the server certificate (PEM format).
    pub cert_path: String,
    /// Path to the server private key (PEM format).
    pub key_path: String,
    /// ALPN protocols to advertise. Default: `["h2", "http/1.1"]`.
    #[serde(default)]
    pub alpn: Vec<String>,
    /// Certificate watch delay in seconds for hot reload.
    #[serde(default = "default_watch_delay_secs")]
    pub watch_delay_secs: u32,
    /// Root CA bundle trusted when dialing backends over mTLS. Starts
    /// empty and rotates at runtime via `tls::trust::RootCaStore`; this is
    /// the bootstrap set loaded at startup (from `PersistedState`, not
    /// this file, in the normal case) unless overridden here for tests.
    #[serde(default)]
    pub extra_root_certs_path: Option<String>,
}

fn default_watch_delay_secs() -> u32 {
    60
}
