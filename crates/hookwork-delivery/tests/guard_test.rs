//! Guard behavior across literal addresses, hostnames and resolution.

#![allow(clippy::unwrap_used)]

use std::{
    net::{IpAddr, Ipv4Addr, Ipv6Addr},
    sync::Arc,
};

use hookwork_delivery::{CallbackGuard, SsrfPolicy, StaticResolver, Verdict};
use proptest::{prelude::*, test_runner::Config as ProptestConfig};

fn guard_with(resolver: &StaticResolver) -> CallbackGuard {
    CallbackGuard::new(SsrfPolicy::default(), Arc::new(resolver.clone()))
}

fn runtime() -> tokio::runtime::Runtime {
    tokio::runtime::Builder::new_current_thread().enable_all().build().unwrap()
}

#[tokio::test]
async fn internal_targets_are_denied() {
    let guard = guard_with(&StaticResolver::new());

    for url in [
        "http://127.0.0.1/x",
        "http://10.0.0.5/x",
        "http://169.254.169.254/x",
        "http://169.254.169.254/",
        "http://foo.internal/x",
        "http://localhost:8080/x",
        "http://api.localhost/x",
        "http://[::1]/x",
        "http://[::ffff:127.0.0.1]/x",
        "http://[fd00::1]/x",
        "http://0.0.0.0/x",
        "http://[::]/x",
        "http://[::]:8080/x",
        "http://[::127.0.0.1]/x",
    ] {
        let verdict = guard.check(url).await;
        assert!(matches!(verdict, Verdict::Deny(_)), "{url} should be denied, got {verdict:?}");
    }
}

#[tokio::test]
async fn public_host_is_allowed_with_resolved_addresses() {
    let resolver = StaticResolver::new();
    resolver.set("example.com", vec![IpAddr::V4(Ipv4Addr::new(93, 184, 216, 34))]);
    let guard = guard_with(&resolver);

    let verdict = guard.check("https://example.com/hook").await;

    assert_eq!(verdict, Verdict::Allow { addrs: vec!["93.184.216.34:443".parse().unwrap()] });
}

#[tokio::test]
async fn hostname_resolving_to_private_address_is_denied() {
    let resolver = StaticResolver::new();
    resolver.set("sneaky.example.com", vec![
        IpAddr::V4(Ipv4Addr::new(93, 184, 216, 34)),
        IpAddr::V4(Ipv4Addr::new(192, 168, 1, 10)),
    ]);
    let guard = guard_with(&resolver);

    let Verdict::Deny(reason) = guard.check("https://sneaky.example.com/cb").await else {
        panic!("expected deny");
    };
    assert!(reason.contains("192.168.0.0/16"), "unexpected reason: {reason}");
}

#[tokio::test]
async fn unknown_host_is_unresolvable() {
    let guard = guard_with(&StaticResolver::new());

    let verdict = guard.check("https://nowhere.example.com/cb").await;

    assert!(matches!(verdict, Verdict::Unresolvable(_)));
}

#[tokio::test]
async fn non_http_schemes_and_garbage_are_denied() {
    let guard = guard_with(&StaticResolver::new());

    for url in ["ftp://example.com/x", "file:///etc/passwd", "gopher://example.com", "not a url"] {
        assert!(matches!(guard.check(url).await, Verdict::Deny(_)), "{url} should be denied");
    }
}

#[tokio::test]
async fn hostname_matching_is_case_insensitive() {
    let guard = guard_with(&StaticResolver::new());

    assert!(matches!(guard.check("http://LOCALHOST/x").await, Verdict::Deny(_)));
    assert!(matches!(guard.check("http://Metadata.Internal./x").await, Verdict::Deny(_)));
}

#[tokio::test]
async fn loopback_policy_still_blocks_private_ranges() {
    let guard = CallbackGuard::new(
        SsrfPolicy::default().allowing_loopback(),
        Arc::new(StaticResolver::new()),
    );

    assert!(guard.check("http://127.0.0.1:9000/x").await.is_allowed());
    assert!(!guard.check("http://10.1.2.3/x").await.is_allowed());
    assert!(!guard.check("http://169.254.169.254/").await.is_allowed());
    assert!(!guard.check("http://[::]:9000/x").await.is_allowed());
    assert!(!guard.check("http://[::10.1.2.3]/x").await.is_allowed());
}

#[tokio::test]
async fn hostname_resolving_to_unspecified_address_is_denied() {
    let resolver = StaticResolver::new();
    resolver.set("wildcard.example.com", vec![IpAddr::V6(Ipv6Addr::UNSPECIFIED)]);
    let guard = guard_with(&resolver);

    let verdict = guard.check("http://wildcard.example.com:8080/x").await;

    let Verdict::Deny(reason) = &verdict else {
        panic!("expected deny, got {verdict:?}");
    };
    assert!(reason.contains("::/128"), "{reason}");
}

fn proptest_config() -> ProptestConfig {
    ProptestConfig { cases: 128, failure_persistence: None, ..ProptestConfig::default() }
}

proptest! {
    #![proptest_config(proptest_config())]

    #[test]
    fn every_rfc1918_address_is_denied(
        b in 0u8..=255,
        c in 0u8..=255,
        d in 0u8..=255,
        which in 0u8..3,
    ) {
        let ip = match which {
            0 => Ipv4Addr::new(10, b, c, d),
            1 => Ipv4Addr::new(172, 16 + (b % 16), c, d),
            _ => Ipv4Addr::new(192, 168, c, d),
        };
        let guard = guard_with(&StaticResolver::new());

        let verdict = runtime().block_on(guard.check(&format!("http://{ip}/x")));

        prop_assert!(matches!(verdict, Verdict::Deny(_)));
    }

    #[test]
    fn every_loopback_address_behind_a_hostname_is_denied(
        b in 0u8..=255,
        c in 0u8..=255,
        d in 0u8..=255,
        form in 0u8..4,
    ) {
        let v4 = Ipv4Addr::new(127, b, c, d);
        let ip = match form {
            0 => IpAddr::V4(v4),
            1 => IpAddr::V6(v4.to_ipv6_mapped()),
            2 => IpAddr::V6(v4.to_ipv6_compatible()),
            _ => IpAddr::V6(Ipv6Addr::UNSPECIFIED),
        };
        let resolver = StaticResolver::new();
        resolver.set("rebind.example.com", vec![ip]);
        let guard = guard_with(&resolver);

        let verdict = runtime().block_on(guard.check("https://rebind.example.com/x"));

        prop_assert!(matches!(verdict, Verdict::Deny(_)));
    }

    #[test]
    fn unspecified_address_literal_is_denied_on_any_port(port in 1u16..=u16::MAX) {
        let guard = guard_with(&StaticResolver::new());

        let verdict = runtime().block_on(guard.check(&format!("http://[::]:{port}/x")));

        prop_assert!(matches!(verdict, Verdict::Deny(_)));
    }
}
