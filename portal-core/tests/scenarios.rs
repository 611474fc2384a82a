//! Integration-style tests exercising the scenarios in SPEC_FULL.md §8,
//! at the level of the Leasor and the HTTP routing table (no real TLS
//! listeners; the wire/network layers are covered by the in-crate unit
//! tests next to their modules).

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use portal_core::config::PortRange;
use portal_core::http_proxy::{Forwarder, RoutingTable};
use portal_core::leasor::{Leasor, LeasorConfig, Pattern, RegisterRequest};

fn leasor(port_seed: u64) -> Arc<Leasor> {
    let dir = tempfile::tempdir().unwrap();
    Arc::new(Leasor::new(LeasorConfig {
        port_range: PortRange { start: 9300, end: 9320 },
        ttl: Duration::from_secs(3600),
        ttl_check_freq: Duration::from_secs(900),
        save_file: dir.path().join("state.bin"),
        port_seed,
    }))
}

fn req(pattern: &str, fixed_port: u32, strip: bool) -> RegisterRequest {
    RegisterRequest {
        pattern: Pattern::parse(pattern).unwrap(),
        fixed_port,
        strip_pattern: strip,
        certificate_request: None,
        hostname: None,
    }
}

fn install(routing: &RoutingTable, leasor: &Leasor, client_addr: &str, pattern: &str, strip: bool) {
    let lease = leasor.register(client_addr.to_string(), req(pattern, 0, strip), Box::new(|| {})).unwrap();
    let http = lease.pattern.as_http().unwrap().clone();
    routing.insert(Arc::new(Forwarder {
        pattern: http,
        lease,
        strip_pattern: strip,
        client_addr: client_addr.to_string(),
        uses_tls: false,
    }));
}

/// S1: nested subtree patterns both stay live; longest-prefix match picks
/// the more specific one.
#[test]
fn s1_nested_prefixes_route_by_longest_match() {
    let leasor = leasor(1);
    let routing = RoutingTable::new();
    install(&routing, &leasor, "10.0.0.1:1", "/a/", false);
    install(&routing, &leasor, "10.0.0.2:1", "/a/b/", false);

    assert_eq!(routing.match_path(None, "/a/b/x").unwrap().pattern.raw, "/a/b/");
    assert_eq!(routing.match_path(None, "/a/x").unwrap().pattern.raw, "/a/");
}

/// S2: an exact pattern nested under an existing prefix is rejected.
#[test]
fn s2_exact_pattern_under_prefix_is_covered() {
    let leasor = leasor(2);
    leasor.register("10.0.0.1:1".into(), req("/a/", 0, false), Box::new(|| {})).unwrap();
    let err = leasor.register("10.0.0.2:1".into(), req("/a/b", 0, false), Box::new(|| {})).unwrap_err();
    assert!(matches!(err, portal_core::leasor::LeasorError::PatternCovered { .. }));
}

/// S3: a stripped exact pattern rewrites the path to "/" and preserves
/// the query string; `Orig-Address` carries the caller's address.
#[test]
fn s3_strip_pattern_rewrites_to_root_and_preserves_query() {
    let leasor = leasor(3);
    let lease = leasor.register("203.0.113.9:5555".into(), req("/x", 9090, true), Box::new(|| {})).unwrap();
    assert_eq!(lease.port, 9090);

    let forwarder = Forwarder {
        pattern: lease.pattern.as_http().unwrap().clone(),
        lease: lease.clone(),
        strip_pattern: true,
        client_addr: "203.0.113.9:5555".to_string(),
        uses_tls: false,
    };

    assert_eq!(forwarder.rewrite_path("/x"), "/");
    let target = forwarder.target_uri("/", Some("q=1")).unwrap();
    assert_eq!(target.path_and_query().unwrap().as_str(), "/?q=1");
    assert_eq!(forwarder.backend_host_port(), "203.0.113.9:9090");

    let header = portal_core::http_proxy::orig_address_header("198.51.100.4:6000".parse().unwrap());
    assert_eq!(header.to_str().unwrap(), "198.51.100.4:6000");
}

/// S4: two backends register the same pattern in succession; the first's
/// forwarder is removed, the second's is live, the first's hook fired.
#[test]
fn s4_same_pattern_reregister_replaces_and_fires_hook() {
    let leasor = leasor(4);
    let routing = RoutingTable::new();

    let first_fired = Arc::new(AtomicBool::new(false));
    let hook_flag = Arc::clone(&first_fired);
    let first_lease = leasor
        .register(
            "10.0.0.1:1".into(),
            req("/svc/", 0, false),
            Box::new(move || hook_flag.store(true, Ordering::SeqCst)),
        )
        .unwrap();
    routing.insert(Arc::new(Forwarder {
        pattern: first_lease.pattern.as_http().unwrap().clone(),
        lease: first_lease.clone(),
        strip_pattern: false,
        client_addr: "10.0.0.1:1".to_string(),
        uses_tls: false,
    }));

    // The second backend's `Register` replaces the first lease (same
    // pattern); the RPC layer wires the Leasor's cancellation hook to
    // `RoutingTable::remove`, so the stale forwarder is dropped from the
    // table in lockstep with the lease it belonged to.
    install(&routing, &leasor, "10.0.0.2:1", "/svc/", false);

    assert!(first_fired.load(Ordering::SeqCst), "the first lease's cancellation hook must have fired");
    assert_eq!(routing.match_path(None, "/svc/x").unwrap().client_addr, "10.0.0.2:1");
    assert_eq!(routing.len(), 1, "the first forwarder must have been replaced, not merely shadowed");
}

/// S6: a lease persisted before restart is still resolvable by pattern
/// after reload, with identical rewrite semantics.
#[test]
fn s6_persists_and_reloads_across_restart() {
    let dir = tempfile::tempdir().unwrap();
    let save_file = dir.path().join("state.bin");

    let first = Arc::new(Leasor::new(LeasorConfig {
        port_range: PortRange { start: 9400, end: 9410 },
        ttl: Duration::from_secs(3600),
        ttl_check_freq: Duration::from_secs(900),
        save_file: save_file.clone(),
        port_seed: 11,
    }));
    first.register("192.0.2.1:1".into(), req("/restart/", 0, true), Box::new(|| {})).unwrap();

    let second = Arc::new(Leasor::new(LeasorConfig {
        port_range: PortRange { start: 9400, end: 9410 },
        ttl: Duration::from_secs(3600),
        ttl_check_freq: Duration::from_secs(900),
        save_file,
        port_seed: 12,
    }));
    let (loaded, total) = second.load_persisted(|_| Box::new(|| {})).unwrap();
    assert_eq!((loaded, total), (1, 1));

    let registrations = second.live_registrations();
    assert_eq!(registrations.len(), 1);
    let reg = &registrations[0];
    assert_eq!(reg.request.pattern.to_string(), "/restart/");

    let routing = RoutingTable::new();
    routing.insert(Arc::new(Forwarder {
        pattern: reg.request.pattern.as_http().unwrap().clone(),
        lease: reg.lease.clone(),
        strip_pattern: reg.request.strip_pattern,
        client_addr: reg.client_addr.clone(),
        uses_tls: false,
    }));
    let forwarder = routing.match_path(None, "/restart/y").expect("persisted pattern must still route");
    assert_eq!(forwarder.rewrite_path("/restart/y"), "/y");
}
