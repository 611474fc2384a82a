use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use portal_core::config::load_from_path;
use portal_core::http_proxy::{server as http_server, BackendClient, RoutingTable};
use portal_core::leasor::{Leasor, LeasorConfig};
use portal_core::rpc::{self, PortalService};
use portal_core::tcp_proxy::TcpProxy;
use portal_core::tls::{
    load_cert_chain_and_key, load_pem_bundle, setup_tls_with_hot_reload, CertAuthority, RootCaStore,
};

#[derive(Parser, Debug)]
#[command(author, version, about = "Portal: a dynamically-configured HTTPS reverse proxy")]
struct Cli {
    /// Path to the configuration TOML file.
    #[arg(short, long, value_name = "FILE")]
    config: PathBuf,
}

#[tokio::main]
async fn main() {
    init_tracing_fallback();

    let cli = Cli::parse();
    if let Err(err) = run(cli).await {
        error!(%err, "portal exited with error");
        std::process::exit(1);
    }
}

/// A minimal subscriber so config-load failures (before `logging.level` is
/// known) are still visible; `run` replaces it with the configured one.
fn init_tracing_fallback() {
    let _ = tracing_subscriber::fmt().with_env_filter("info").try_init();
}

async fn run(cli: Cli) -> portal_core::Result<()> {
    let cfg = load_from_path(&cli.config)?;
    let _ = portal_core::telemetry::init_tracing(&cfg.logging);

    info!(listen_http = %cfg.listen_http, listen_https = %cfg.listen_https, listen_rpc = %cfg.listen_rpc, "configuration loaded");

    let shutdown = CancellationToken::new();

    let leasor = Arc::new(Leasor::new(LeasorConfig {
        port_range: cfg.port_range,
        ttl: Duration::from_secs(cfg.ttl_secs),
        ttl_check_freq: Duration::from_secs(cfg.ttl_check_freq_secs),
        save_file: PathBuf::from(&cfg.save_file),
        port_seed: rand::random(),
    }));

    let routing = Arc::new(RoutingTable::new());
    let tls_setup = setup_tls_with_hot_reload(&cfg.tls).await?;
    let tcp_proxy = TcpProxy::new(
        Arc::clone(&tls_setup.acceptor),
        shutdown.clone(),
        Duration::from_millis(cfg.timeout.connect_ms),
    );

    {
        let routing = Arc::clone(&routing);
        let tcp_proxy = Arc::clone(&tcp_proxy);
        let (loaded, total) =
            leasor.load_persisted(move |pattern| PortalService::build_hook(&routing, &tcp_proxy, pattern))?;
        info!(loaded, total, "leasor state restored from disk");
    }

    let (client_cert, client_key) = load_cert_chain_and_key(&cfg.tls)?;

    // Portal signs backend CSRs with its own (self-signed) server identity,
    // so the leaf certs it hands out chain back to a CA it already trusts.
    let ca = match client_cert.first() {
        Some(leaf) => Some(Arc::new(CertAuthority::new(leaf, &client_key.clone_key())?)),
        None => None,
    };

    let mut root_certs = leasor.current_root_certs();
    if let Some(leaf) = client_cert.first() {
        root_certs.push(leaf.to_vec());
    }
    if let Some(path) = &cfg.tls.extra_root_certs_path {
        root_certs.extend(load_pem_bundle(path)?);
    }
    let root_store = Arc::new(RootCaStore::new(root_certs)?);

    let backend_client = Arc::new(BackendClient::new(
        root_store,
        client_cert,
        client_key.clone_key(),
        Duration::from_millis(cfg.timeout.connect_ms),
        Duration::from_millis(cfg.timeout.idle_ms),
    ));

    let portal_service = PortalService::new(
        Arc::clone(&leasor),
        Arc::clone(&routing),
        Arc::clone(&tcp_proxy),
        cfg.hostname.clone(),
        ca,
    );
    portal_service.install_persisted(&leasor.live_registrations());

    leasor.spawn_sweeper(shutdown.clone());

    let rpc_addr: SocketAddr = cfg.listen_rpc;
    let rpc_task = tokio::spawn(rpc::run(
        rpc_addr,
        Arc::clone(&tls_setup.acceptor),
        portal_service,
        cfg.api_token.clone(),
        shutdown.clone(),
    ));

    let http_config = http_server::HttpProxyConfig {
        listen_http: cfg.listen_http,
        listen_https: cfg.listen_https,
        acme_webroot: cfg.acme_webroot.clone().map(PathBuf::from),
        max_connections: cfg.security.max_connections,
        shutdown_timeout: Duration::from_secs(cfg.timeout.shutdown_secs),
        tls_handshake_timeout: Duration::from_secs(cfg.timeout.tls_handshake_secs),
    };
    let http_task = tokio::spawn(http_server::run(
        http_config,
        Arc::clone(&routing),
        backend_client,
        Arc::clone(&tls_setup.acceptor),
        shutdown.clone(),
    ));

    wait_for_shutdown_signal().await;
    info!("shutdown signal received, draining");
    shutdown.cancel();

    let _ = rpc_task.await;
    let _ = http_task.await;
    info!("portal shut down cleanly");
    Ok(())
}

async fn wait_for_shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();
    #[cfg(unix)]
    {
        let mut terminate = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler");
        tokio::select! {
            _ = ctrl_c => {},
            _ = terminate.recv() => {},
        }
    }
    #[cfg(not(unix))]
    {
        let _ = ctrl_c.await;
    }
}
