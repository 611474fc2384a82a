use serde::Deserialize;

/// Timeout configuration shared by the HTTP proxy and TCP proxy listeners.
#[derive(Debug, Deserialize, Clone)]
pub struct TimeoutConfig {
    /// Connect timeout when dialing a backend, in milliseconds.
    #[serde(default = "default_connect_ms")]
    pub connect_ms: u64,
    /// Idle connection timeout, in milliseconds.
    #[serde(default = "default_idle_ms")]
    pub idle_ms: u64,
    /// Graceful shutdown drain budget for in-flight HTTP requests, in
    /// seconds. TCP tunnels are not drained; see `SPEC_FULL.md` §5.
    #[serde(default = "default_shutdown_secs")]
    pub shutdown_secs: u64,
    /// TLS handshake timeout, in seconds.
    #[serde(default = "default_tls_handshake_secs")]
    pub tls_handshake_secs: u64,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            connect_ms: default_connect_ms(),
            idle_ms: default_idle_ms(),
            shutdown_secs: default_shutdown_secs(),
            tls_handshake_secs: default_tls_handshake_secs(),
        }
    }
}

fn default_connect_ms() -> u64 {
    5_000
}

fn default_idle_ms() -> u64 {
    60_000
}

fn default_shutdown_secs() -> u64 {
    30
}

fn default_tls_handshake_secs() -> u64 {
    15
}
