use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use tokio::sync::watch;

/// Tracks in-flight HTTPS connections so graceful shutdown can wait
/// (bounded by `timeout.shutdown_secs`) for them to finish, mirroring the
/// teacher crate's `proxy::connection` module (SPEC_FULL.md §4.2).
pub struct ConnectionManager {
    active: Arc<AtomicUsize>,
    max: usize,
    empty_tx: watch::Sender<()>,
}

impl ConnectionManager {
    pub fn new(max: usize) -> Self {
        let (empty_tx, _rx) = watch::channel(());
        Self { active: Arc::new(AtomicUsize::new(0)), max, empty_tx }
    }

    /// Try to admit a new connection. Returns `None` if the hard ceiling
    /// (`security.max_connections`) is already reached.
    pub fn try_admit(&self) -> Option<ConnectionGuard> {
        let prev = self.active.fetch_add(1, Ordering::AcqRel);
        if prev >= self.max {
            self.active.fetch_sub(1, Ordering::AcqRel);
            return None;
        }
        Some(ConnectionGuard { active: Arc::clone(&self.active), notify: self.empty_tx.clone() })
    }

    pub fn active_count(&self) -> usize {
        self.active.load(Ordering::Acquire)
    }

    /// Wait until the active-connection count reaches zero, or `budget`
    /// elapses first.
    pub async fn wait_drained(&self, budget: std::time::Duration) {
        if self.active_count() == 0 {
            return;
        }
        let mut rx = self.empty_tx.subscribe();
        let _ = tokio::time::timeout(budget, async {
            while self.active_count() > 0 {
                let _ = rx.changed().await;
            }
        })
        .await;
    }
}

pub struct ConnectionGuard {
    active: Arc<AtomicUsize>,
    notify: watch::Sender<()>,
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        let remaining = self.active.fetch_sub(1, Ordering::AcqRel);
        if remaining == 1 {
            let _ = self.notify.send(());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn admits_up_to_the_ceiling_then_rejects() {
        let mgr = ConnectionManager::new(2);
        let a = mgr.try_admit().unwrap();
        let b = mgr.try_admit().unwrap();
        assert!(mgr.try_admit().is_none());
        drop(a);
        assert!(mgr.try_admit().is_some());
        drop(b);
    }

    #[tokio::test]
    async fn wait_drained_returns_once_all_guards_dropped() {
        let mgr = ConnectionManager::new(10);
        let guard = mgr.try_admit().unwrap();
        drop(guard);
        mgr.wait_drained(std::time::Duration::from_millis(50)).await;
        assert_eq!(mgr.active_count(), 0);
    }
}
