use serde::Deserialize;
use std::net::SocketAddr;

use super::telemetry::LoggingConfig;
use super::timeout::TimeoutConfig;
use super::tls::TlsConfig;

/// Auto-assignable port range `[start, end]`, inclusive.
///
/// Fixed ports requested by backends must lie outside this range; the
/// Leasor's auto-port pool draws exclusively from inside it.
#[derive(Debug, Deserialize, Clone, Copy)]
pub struct PortRange {
    pub start: u16,
    pub end: u16,
}

impl PortRange {
    pub fn contains(&self, port: u16) -> bool {
        port >= self.start && port <= self.end
    }

    pub fn len(&self) -> usize {
        usize::from(self.end - self.start) + 1
    }

    pub fn is_empty(&self) -> bool {
        false
    }
}

/// Security-adjacent knobs that aren't about TLS material itself.
#[derive(Debug, Deserialize, Clone)]
pub struct SecurityConfig {
    /// Hard ceiling on concurrently open HTTPS connections. Connections
    /// beyond the ceiling are rejected before they reach routing.
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,
}

impl Default for SecurityConfig {
    fn default() -> Self {
        Self { max_connections: default_max_connections() }
    }
}

fn default_max_connections() -> usize {
    10_000
}

/// Main configuration structure for a Portal server process.
#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    /// Plain-HTTP listener; serves only a 303 redirect to HTTPS.
    pub listen_http: SocketAddr,
    /// HTTPS listener; serves all proxied traffic and the ACME webroot.
    pub listen_https: SocketAddr,
    /// RPC (gRPC/tonic) listener backends dial to register.
    pub listen_rpc: SocketAddr,

    /// Range auto-assigned ports are drawn from.
    pub port_range: PortRange,

    /// Path the Leasor's persisted state is written to and reloaded from.
    pub save_file: String,

    /// Lease time-to-live, in seconds. Default: 24h.
    #[serde(default = "default_ttl_secs")]
    pub ttl_secs: u64,
    /// How long before `timeout` the client library's renewal loop fires.
    /// Default: 1h.
    #[serde(default = "default_renew_buffer_secs")]
    pub renew_buffer_secs: u64,
    /// TTL sweeper interval, in seconds. Default: 15m.
    #[serde(default = "default_ttl_check_freq_secs")]
    pub ttl_check_freq_secs: u64,

    /// Bearer token RPC callers must present. Compared byte-for-byte.
    pub api_token: String,

    /// Portal's own externally-visible hostname, returned by the `GetHostname`
    /// RPC so clients doing the CSR flow (§4.5) know what name to request a
    /// certificate for.
    pub hostname: String,

    /// TLS termination configuration, used for HTTPS, RPC, and TCP tunnels.
    pub tls: TlsConfig,

    /// Optional ACME HTTP-01 challenge webroot; when set, a pseudo-lease
    /// serves `/.well-known/acme-challenge/` from this directory.
    #[serde(default)]
    pub acme_webroot: Option<String>,

    /// Timeout configuration.
    #[serde(default)]
    pub timeout: TimeoutConfig,
    /// Logging configuration.
    #[serde(default)]
    pub logging: LoggingConfig,
    /// Security configuration.
    #[serde(default)]
    pub security: SecurityConfig,
}

fn default_ttl_secs() -> u64 {
    24 * 3600
}

fn default_renew_buffer_secs() -> u64 {
    3600
}

fn default_ttl_check_freq_secs() -> u64 {
    15 * 60
}
