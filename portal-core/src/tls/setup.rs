use std::sync::Arc;
use std::time::Duration;

use notify::{Event, RecommendedWatcher, RecursiveMode, Watcher};
use tokio::sync::RwLock;
use tokio_rustls::TlsAcceptor;
use tracing::{error, info, warn};

use super::acceptor::build_rustls;
use crate::config::TlsConfig;
use crate::error::Result;

/// Holds a hot-swappable `TlsAcceptor`; the HTTPS listener, the RPC
/// listener, and every TCP tunnel clone `acceptor` and re-read it on each
/// accept, so a cert rotation takes effect for new connections without a
/// restart.
pub struct TlsSetup {
    pub acceptor: Arc<RwLock<TlsAcceptor>>,
}

/// Build the initial acceptor and start a filesystem watcher that rebuilds
/// it whenever the cert or key file changes on disk.
///
/// This mirrors the teacher crate's certificate hot-reload in spirit (same
/// watch-and-rebuild shape) but is implemented directly against `notify`
/// rather than through an intermediate reloader-service abstraction, since
/// Portal's cert source is always a single file pair, never multiple named
/// server identities.
pub async fn setup_tls_with_hot_reload(tls_config: &TlsConfig) -> Result<TlsSetup> {
    let initial = build_rustls(tls_config)?;
    let acceptor = Arc::new(RwLock::new(initial));

    let cfg = tls_config.clone();
    let acceptor_for_watch = Arc::clone(&acceptor);
    let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel::<()>();

    let mut watcher: RecommendedWatcher = notify::recommended_watcher(move |res: notify::Result<Event>| {
        if res.is_ok() {
            let _ = tx.send(());
        }
    })
    .map_err(|e| crate::error::ProxyError::Tls(format!("failed to start cert watcher: {e}")))?;

    for path in [&cfg.cert_path, &cfg.key_path] {
        if let Err(e) = watcher.watch(std::path::Path::new(path), RecursiveMode::NonRecursive) {
            warn!(%path, error = %e, "failed to watch TLS material for changes");
        }
    }

    let watch_delay = Duration::from_secs(u64::from(cfg.watch_delay_secs.max(1)));
    tokio::spawn(async move {
        // Keep the watcher alive for the life of the process.
        let _watcher = watcher;
        while rx.recv().await.is_some() {
            tokio::time::sleep(watch_delay).await;
            // Drain any coalesced events from the debounce window.
            while rx.try_recv().is_ok() {}
            match build_rustls(&cfg) {
                Ok(new_acceptor) => {
                    *acceptor_for_watch.write().await = new_acceptor;
                    info!("TLS certificate reloaded");
                }
                Err(e) => error!(error = %e, "failed to reload TLS certificate, keeping previous"),
            }
        }
    });

    Ok(TlsSetup { acceptor })
}
