use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::info;

use super::Leasor;

/// Spawn the periodic task that scans for and reclaims expired leases,
/// running until `cancel` fires (§4.1, §5).
pub fn spawn(leasor: Arc<Leasor>, cancel: CancellationToken) {
    let freq = leasor.ttl_check_freq();
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(freq);
        // The first tick fires immediately; skip it so we don't sweep a
        // leasor that was just constructed.
        interval.tick().await;
        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    info!("TTL sweeper shutting down");
                    return;
                }
                _ = interval.tick() => {
                    leasor.sweep_once();
                }
            }
        }
    });
}
