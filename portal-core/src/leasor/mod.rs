mod error;
mod pattern;
mod persistence;
mod ports;
mod state;
mod sweeper;

pub use error::{LeasorError, Result};
pub use pattern::{HttpPattern, Pattern, ACME_CHALLENGE_PATTERN};
pub use persistence::PersistedState;
pub use state::{Lease, RegisterRequest, Registration};

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use ports::PortPool;

/// Invoked exactly once when a lease is reclaimed: by expiry, by an
/// overriding `Register` on the same pattern, or by an explicit
/// `Unregister`. Closes the forwarder's listener (TCP) or deletes it from
/// the HTTP routing table. A handle-typed callback, not an owning
/// reference, per §9 "Cyclic backreferences".
pub type CancellationHook = Box<dyn FnOnce() + Send>;

/// Callback invoked by the TTL sweeper with every lease it reclaims.
pub type TtlCallback = Box<dyn Fn(&Lease) + Send + Sync>;

struct Entry {
    registration: Registration,
    hook: Option<CancellationHook>,
}

struct Inner {
    /// Keyed by pattern: at most one live lease per pattern (invariant).
    by_pattern: HashMap<Pattern, Entry>,
    /// Keyed by port: at most one live lease per port (invariant).
    by_port: HashMap<u16, Pattern>,
    port_pool: PortPool,
}

pub struct LeasorConfig {
    pub port_range: crate::config::PortRange,
    pub ttl: Duration,
    pub ttl_check_freq: Duration,
    pub save_file: PathBuf,
    pub port_seed: u64,
}

/// Authoritative registry of `{pattern -> port, timeout, client, original
/// request}`. Generates ports, enforces TTL, persists state. See
/// SPEC_FULL.md §4.1.
pub struct Leasor {
    inner: Mutex<Inner>,
    config: LeasorConfig,
    ttl_callbacks: Mutex<Vec<TtlCallback>>,
    root_certs: Mutex<Vec<Vec<u8>>>,
}

impl Leasor {
    pub fn new(config: LeasorConfig) -> Self {
        let port_pool = PortPool::new(config.port_range, config.port_seed);
        Self {
            inner: Mutex::new(Inner {
                by_pattern: HashMap::new(),
                by_port: HashMap::new(),
                port_pool,
            }),
            config,
            ttl_callbacks: Mutex::new(Vec::new()),
            root_certs: Mutex::new(Vec::new()),
        }
    }

    /// Load persisted state from `config.save_file`, if any, replaying
    /// every entry through the ordinary `register` path marked internal
    /// (not re-validated against an RPC client, but pattern/port collision
    /// logic is identical). Expired leases get an implicit one-TTL
    /// extension because the server just started (§4.1).
    ///
    /// Returns `(loaded, total)` for the "loaded N/N saved registrations"
    /// log line required by scenario S6.
    pub fn load_persisted(self: &Arc<Self>, make_hook: impl Fn(&Pattern) -> CancellationHook) -> crate::error::Result<(usize, usize)> {
        let Some(state) = persistence::load(&self.config.save_file)
            .map_err(|e| crate::error::ProxyError::CorruptState(e.to_string()))?
        else {
            info!("no persisted state file found, starting empty");
            return Ok((0, 0));
        };

        *self.root_certs.lock() = state.root_certs;

        let total = state.registrations.len();
        let mut loaded = 0;
        let now = SystemTime::now();
        for mut reg in state.registrations {
            if reg.lease.is_expired(now) {
                reg.lease.timeout = now + self.config.ttl;
            }
            let hook = make_hook(&reg.request.pattern);
            match self.register_internal(reg.request, reg.lease.port, reg.client_addr, hook, true) {
                Ok(_) => loaded += 1,
                Err(e) => warn!(error = %e, "dropping persisted registration that no longer validates"),
            }
        }
        info!(loaded, total, "loaded {loaded}/{total} saved registrations");
        Ok((loaded, total))
    }

    /// Register a new lease, or atomically replace the existing lease on
    /// an identical pattern. `hook` is remembered and invoked once this
    /// lease is reclaimed by expiry, override, or `Unregister`.
    pub fn register(
        &self,
        client_addr: String,
        request: RegisterRequest,
        hook: CancellationHook,
    ) -> Result<Lease> {
        let fixed_port = self.validate_fixed_port(&request)?;
        self.register_internal(request, fixed_port.unwrap_or(0), client_addr, hook, false)
    }

    fn validate_fixed_port(&self, request: &RegisterRequest) -> Result<Option<u16>> {
        if request.fixed_port == 0 {
            return Ok(None);
        }
        if request.fixed_port >= 65536 {
            return Err(LeasorError::InvalidRequest(format!(
                "fixed_port {} is >= 2^16",
                request.fixed_port
            )));
        }
        let port = request.fixed_port as u16;
        if self.config.port_range.contains(port) {
            return Err(LeasorError::InvalidRequest(format!(
                "fixed_port {port} lies inside the auto-assigned range"
            )));
        }
        Ok(Some(port))
    }

    fn register_internal(
        &self,
        request: RegisterRequest,
        requested_port: u16,
        client_addr: String,
        hook: CancellationHook,
        internal: bool,
    ) -> Result<Lease> {
        if request.pattern.is_reserved() {
            return Err(LeasorError::ReservedPattern(request.pattern.to_string()));
        }

        let mut inner = self.inner.lock();

        // Pattern-uniqueness / covering check against every *other* live
        // pattern. An identical pattern is a replace, not a collision.
        if let Some(http) = request.pattern.as_http() {
            for (existing, _) in inner.by_pattern.iter() {
                if let Some(existing_http) = existing.as_http() {
                    if existing_http.raw != http.raw && existing_http.covers(http) {
                        return Err(LeasorError::PatternCovered {
                            requested: http.raw.clone(),
                            existing: existing_http.raw.clone(),
                        });
                    }
                }
            }
        }

        let previous = inner.by_pattern.remove(&request.pattern);
        if let Some(prev) = &previous {
            inner.by_port.remove(&prev.registration.lease.port);
        }

        // Reuse the replaced registration's own port when it's eligible
        // (same slot, auto-drawn), so a same-pattern re-register never
        // leaks the old port out of both `by_port` and the pool.
        let reused_port = previous.as_ref().and_then(|prev| {
            let prev_port = prev.registration.lease.port;
            (requested_port == 0 && self.config.port_range.contains(prev_port)).then_some(prev_port)
        });

        let port = if requested_port != 0 {
            if !internal && inner.by_port.contains_key(&requested_port) {
                self.restore(&mut inner, previous);
                return Err(LeasorError::FixedPortTaken(requested_port));
            }
            requested_port
        } else if let Some(p) = reused_port {
            p
        } else {
            let by_port = &inner.by_port;
            match inner.port_pool.acquire(|p| by_port.contains_key(&p)) {
                Some(p) => p,
                None => {
                    self.restore(&mut inner, previous);
                    return Err(LeasorError::OutOfPorts);
                }
            }
        };

        // The previous port is only truly freed if it's not the one the
        // new lease just took over.
        if let Some(prev) = &previous {
            let prev_port = prev.registration.lease.port;
            if prev_port != port {
                inner.port_pool.release(prev_port);
            }
        }

        let lease = Lease {
            pattern: request.pattern.clone(),
            port,
            timeout: SystemTime::now() + self.config.ttl,
            certificate: None,
        };

        let registration = Registration { request, lease: lease.clone(), client_addr };
        let pattern = registration.request.pattern.clone();

        inner.by_port.insert(port, pattern.clone());
        inner.by_pattern.insert(pattern, Entry { registration, hook: Some(hook) });

        self.persist_locked(&inner);
        drop(inner);

        if let Some(prev) = previous {
            if let Some(prev_hook) = prev.hook {
                prev_hook();
            }
        }

        Ok(lease)
    }

    /// Put a removed `previous` entry back into both maps after a failed
    /// register attempt, so the failure has no observable side effect.
    fn restore(&self, inner: &mut Inner, previous: Option<Entry>) {
        if let Some(prev) = previous {
            inner.by_port.insert(prev.registration.lease.port, prev.registration.request.pattern.clone());
            inner.by_pattern.insert(prev.registration.request.pattern.clone(), prev);
        }
    }

    /// Advance `timeout` to `now + ttl`. `port` and `pattern` never change.
    /// Per §9's recorded open-question decision, `client_addr` is not
    /// re-validated; only `(port, pattern)` gate acceptance.
    pub fn renew(&self, lease: &Lease) -> Result<Lease> {
        let mut inner = self.inner.lock();
        let Some(stored_pattern) = inner.by_port.get(&lease.port).cloned() else {
            return Err(LeasorError::NotRegistered {
                port: lease.port,
                pattern: lease.pattern.to_string(),
            });
        };
        if stored_pattern != lease.pattern {
            return Err(LeasorError::PatternMismatch { port: lease.port });
        }
        let entry = inner.by_pattern.get_mut(&stored_pattern).expect("by_port/by_pattern must agree");
        entry.registration.lease.timeout = SystemTime::now() + self.config.ttl;
        let renewed = entry.registration.lease.clone();
        self.persist_locked(&inner);
        Ok(renewed)
    }

    /// Invoke the cancellation hook, release the port (if auto-assigned),
    /// and remove the registration.
    pub fn unregister(&self, lease: &Lease) -> Result<()> {
        let mut inner = self.inner.lock();
        let Some(stored_pattern) = inner.by_port.get(&lease.port).cloned() else {
            return Err(LeasorError::NotRegistered {
                port: lease.port,
                pattern: lease.pattern.to_string(),
            });
        };
        if stored_pattern != lease.pattern {
            return Err(LeasorError::PatternMismatch { port: lease.port });
        }
        let entry = inner.by_pattern.remove(&stored_pattern).expect("by_port/by_pattern must agree");
        inner.by_port.remove(&lease.port);
        inner.port_pool.release(lease.port);
        self.persist_locked(&inner);
        drop(inner);

        if let Some(hook) = entry.hook {
            hook();
        }
        Ok(())
    }

    /// Register a callback invoked with every lease the TTL sweeper
    /// reclaims.
    pub fn on_ttl(&self, callback: TtlCallback) {
        self.ttl_callbacks.lock().push(callback);
    }

    pub fn current_root_certs(&self) -> Vec<Vec<u8>> {
        self.root_certs.lock().clone()
    }

    /// Snapshot every currently live registration, in the same shape
    /// `install_persisted` replays at startup.
    pub fn live_registrations(&self) -> Vec<Registration> {
        self.inner.lock().by_pattern.values().map(|e| e.registration.clone()).collect()
    }

    /// Look up the live registration behind `pattern`, e.g. to read back
    /// the original `certificate_request` bytes when (re-)signing a CSR
    /// on renewal.
    pub fn registration(&self, pattern: &Pattern) -> Option<Registration> {
        self.inner.lock().by_pattern.get(pattern).map(|e| e.registration.clone())
    }

    /// Overwrite the certificate on the live lease for `pattern` after a
    /// CSR has been (re-)signed, and persist. `port` and `timeout` are
    /// untouched.
    pub fn attach_certificate(&self, pattern: &Pattern, certificate: Vec<u8>) -> Result<Lease> {
        let mut inner = self.inner.lock();
        let Some(entry) = inner.by_pattern.get_mut(pattern) else {
            return Err(LeasorError::NotRegistered { port: 0, pattern: pattern.to_string() });
        };
        entry.registration.lease.certificate = Some(certificate);
        let lease = entry.registration.lease.clone();
        self.persist_locked(&inner);
        Ok(lease)
    }

    pub fn set_root_certs(&self, certs: Vec<Vec<u8>>) {
        let mut guard = self.root_certs.lock();
        *guard = certs;
        drop(guard);
        let inner = self.inner.lock();
        self.persist_locked(&inner);
    }

    fn persist_locked(&self, inner: &Inner) {
        let registrations =
            inner.by_pattern.values().map(|e| e.registration.clone()).collect::<Vec<_>>();
        let state = PersistedState { registrations, root_certs: self.root_certs.lock().clone() };
        if let Err(e) = persistence::save(&self.config.save_file, &state) {
            warn!(error = %e, "failed to persist leasor state");
        }
    }

    /// Scan every registration under the lock; any whose `timeout` is in
    /// the past is reclaimed via the same cancellation-hook path and the
    /// TTL callbacks fire. Runs until `cancel` fires.
    pub fn spawn_sweeper(self: &Arc<Self>, cancel: CancellationToken) {
        sweeper::spawn(Arc::clone(self), cancel);
    }

    fn sweep_once(&self) {
        let now = SystemTime::now();
        let expired_patterns: Vec<Pattern> = {
            let inner = self.inner.lock();
            inner
                .by_pattern
                .iter()
                .filter(|(_, e)| e.registration.lease.is_expired(now))
                .map(|(p, _)| p.clone())
                .collect()
        };

        for pattern in expired_patterns {
            let (entry, lease) = {
                let mut inner = self.inner.lock();
                let Some(entry) = inner.by_pattern.remove(&pattern) else { continue };
                inner.by_port.remove(&entry.registration.lease.port);
                inner.port_pool.release(entry.registration.lease.port);
                let lease = entry.registration.lease.clone();
                self.persist_locked(&inner);
                (entry, lease)
            };
            info!(pattern = %pattern, port = lease.port, "lease expired, reclaiming");
            if let Some(hook) = entry.hook {
                hook();
            }
            for cb in self.ttl_callbacks.lock().iter() {
                cb(&lease);
            }
        }
    }

    pub fn ttl_check_freq(&self) -> Duration {
        self.config.ttl_check_freq
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PortRange;

    fn leasor() -> Arc<Leasor> {
        let dir = tempfile::tempdir().unwrap();
        Arc::new(Leasor::new(LeasorConfig {
            port_range: PortRange { start: 9100, end: 9110 },
            ttl: Duration::from_secs(3600),
            ttl_check_freq: Duration::from_secs(900),
            save_file: dir.path().join("state.bin"),
            port_seed: 7,
        }))
    }

    fn req(pattern: &str) -> RegisterRequest {
        RegisterRequest {
            pattern: Pattern::parse(pattern).unwrap(),
            fixed_port: 0,
            strip_pattern: false,
            certificate_request: None,
            hostname: None,
        }
    }

    #[test]
    fn register_then_renew_advances_timeout_strictly() {
        let l = leasor();
        let lease = l.register("127.0.0.1:1".into(), req("/a/"), Box::new(|| {})).unwrap();
        std::thread::sleep(Duration::from_millis(5));
        let renewed = l.renew(&lease).unwrap();
        assert!(renewed.timeout > lease.timeout);
        assert_eq!(renewed.port, lease.port);
    }

    #[test]
    fn no_two_live_leases_share_a_port() {
        let l = leasor();
        let a = l.register("c1".into(), req("/a/"), Box::new(|| {})).unwrap();
        let b = l.register("c2".into(), req("/b/"), Box::new(|| {})).unwrap();
        assert_ne!(a.port, b.port);
    }

    #[test]
    fn covering_pattern_is_rejected() {
        let l = leasor();
        l.register("c1".into(), req("/a/"), Box::new(|| {})).unwrap();
        let err = l.register("c2".into(), req("/a/b"), Box::new(|| {})).unwrap_err();
        assert!(matches!(err, LeasorError::PatternCovered { .. }));
    }

    #[test]
    fn nested_prefix_subtrees_both_stay_live() {
        // S1: "/a/" and "/a/b/" are both prefix patterns, so they coexist;
        // only an exact pattern nested under a prefix is rejected (S2).
        let l = leasor();
        l.register("c1".into(), req("/a/"), Box::new(|| {})).unwrap();
        l.register("c2".into(), req("/a/b/"), Box::new(|| {})).unwrap();
        assert_eq!(l.live_registrations().len(), 2);
    }

    #[test]
    fn reregistering_same_pattern_replaces_and_fires_hook() {
        let l = leasor();
        let fired = Arc::new(std::sync::atomic::AtomicBool::new(false));
        let fired2 = Arc::clone(&fired);
        let first = l
            .register("c1".into(), req("/svc/"), Box::new(move || fired2.store(true, std::sync::atomic::Ordering::SeqCst)))
            .unwrap();
        let second = l.register("c2".into(), req("/svc/"), Box::new(|| {})).unwrap();
        assert!(fired.load(std::sync::atomic::Ordering::SeqCst));
        assert_ne!(first.port, second.port, "auto ports are freed and may be reused, but not guaranteed equal");
    }

    #[test]
    fn fixed_port_taken_is_rejected() {
        let l = leasor();
        let mut r = req("/a/");
        r.fixed_port = 7000;
        l.register("c1".into(), r, Box::new(|| {})).unwrap();
        let mut r2 = req("/b/");
        r2.fixed_port = 7000;
        let err = l.register("c2".into(), r2, Box::new(|| {})).unwrap_err();
        assert!(matches!(err, LeasorError::FixedPortTaken(7000)));
    }

    #[test]
    fn fixed_port_inside_auto_range_is_invalid() {
        let l = leasor();
        let mut r = req("/a/");
        r.fixed_port = 9105;
        let err = l.register("c1".into(), r, Box::new(|| {})).unwrap_err();
        assert!(matches!(err, LeasorError::InvalidRequest(_)));
    }

    #[test]
    fn reserved_acme_pattern_is_rejected() {
        let l = leasor();
        let err = l.register("c1".into(), req(ACME_CHALLENGE_PATTERN), Box::new(|| {})).unwrap_err();
        assert!(matches!(err, LeasorError::ReservedPattern(_)));
    }

    #[test]
    fn renew_with_wrong_pattern_is_mismatch() {
        let l = leasor();
        let lease = l.register("c1".into(), req("/a/"), Box::new(|| {})).unwrap();
        let mut bad = lease.clone();
        bad.pattern = Pattern::parse("/other/").unwrap();
        let err = l.renew(&bad).unwrap_err();
        assert!(matches!(err, LeasorError::PatternMismatch { .. }));
    }

    #[test]
    fn unregister_then_renew_is_not_registered() {
        let l = leasor();
        let lease = l.register("c1".into(), req("/a/"), Box::new(|| {})).unwrap();
        l.unregister(&lease).unwrap();
        let err = l.renew(&lease).unwrap_err();
        assert!(matches!(err, LeasorError::NotRegistered { .. }));
    }

    #[test]
    fn unregister_releases_port_for_reuse() {
        let l = leasor();
        let range_len = 11; // 9100..=9110
        let mut leases = Vec::new();
        for i in 0..range_len {
            leases.push(l.register(format!("c{i}"), req(&format!("/p{i}/")), Box::new(|| {})).unwrap());
        }
        assert!(l.register("cx".into(), req("/px/"), Box::new(|| {})).is_err(), "pool should be exhausted");
        l.unregister(&leases[0]).unwrap();
        assert!(l.register("cy".into(), req("/py/"), Box::new(|| {})).is_ok());
    }

    #[test]
    fn persists_and_reloads_across_restart() {
        let dir = tempfile::tempdir().unwrap();
        let save_file = dir.path().join("state.bin");
        let make = |port_seed| {
            Arc::new(Leasor::new(LeasorConfig {
                port_range: PortRange { start: 9200, end: 9210 },
                ttl: Duration::from_secs(3600),
                ttl_check_freq: Duration::from_secs(900),
                save_file: save_file.clone(),
                port_seed,
            }))
        };
        let first = make(1);
        let lease = first.register("c1".into(), req("/a/"), Box::new(|| {})).unwrap();

        let second = make(2);
        let (loaded, total) = second.load_persisted(|_| Box::new(|| {})).unwrap();
        assert_eq!((loaded, total), (1, 1));
        let renewed = second.renew(&lease).unwrap();
        assert_eq!(renewed.port, lease.port);
    }
}
