//! SSRF guard for callback targets.
//!
//! The guard runs at submission and again before every delivery attempt. A
//! target is rejected when its scheme is not allowed, its hostname matches a
//! blocked pattern, or any address it resolves to lies in a blocked network.
//! An allowed verdict carries the resolved addresses so the transport can
//! connect to exactly what was checked.

use std::{
    collections::HashMap,
    fmt,
    net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr},
    str::FromStr,
    sync::{Arc, RwLock},
};

use async_trait::async_trait;
use reqwest::Url;
use tracing::debug;

use crate::error::DeliveryError;

/// An IP network in CIDR notation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CidrBlock {
    network: IpAddr,
    prefix: u8,
}

impl CidrBlock {
    /// Creates a block, rejecting prefixes longer than the address width.
    ///
    /// # Errors
    ///
    /// Returns `DeliveryError::Configuration` for an out-of-range prefix.
    pub fn new(network: IpAddr, prefix: u8) -> Result<Self, DeliveryError> {
        let width = if network.is_ipv4() { 32 } else { 128 };
        if prefix > width {
            return Err(DeliveryError::configuration(format!(
                "prefix /{prefix} too long for {network}"
            )));
        }
        Ok(Self { network, prefix })
    }

    /// Returns true if `ip` falls inside this block.
    pub fn contains(&self, ip: IpAddr) -> bool {
        match (self.network, ip) {
            (IpAddr::V4(net), IpAddr::V4(ip)) => {
                let mask = u32::MAX.checked_shl(32 - u32::from(self.prefix)).unwrap_or(0);
                u32::from(net) & mask == u32::from(ip) & mask
            },
            (IpAddr::V6(net), IpAddr::V6(ip)) => {
                let mask = u128::MAX.checked_shl(128 - u32::from(self.prefix)).unwrap_or(0);
                u128::from(net) & mask == u128::from(ip) & mask
            },
            _ => false,
        }
    }
}

impl FromStr for CidrBlock {
    type Err = DeliveryError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (addr, prefix) = s
            .split_once('/')
            .ok_or_else(|| DeliveryError::configuration(format!("missing prefix in {s:?}")))?;
        let network = addr
            .parse::<IpAddr>()
            .map_err(|e| DeliveryError::configuration(format!("bad network {addr:?}: {e}")))?;
        let prefix = prefix
            .parse::<u8>()
            .map_err(|e| DeliveryError::configuration(format!("bad prefix {prefix:?}: {e}")))?;
        Self::new(network, prefix)
    }
}

impl fmt::Display for CidrBlock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.network, self.prefix)
    }
}

/// Hostname pattern, matched case-insensitively.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HostPattern {
    /// Matches the hostname exactly.
    Exact(String),
    /// Matches any hostname ending in this suffix, e.g. `.internal`.
    Suffix(String),
}

impl HostPattern {
    /// Returns true if the normalized `host` matches.
    pub fn matches(&self, host: &str) -> bool {
        match self {
            Self::Exact(exact) => host == exact,
            Self::Suffix(suffix) => host.ends_with(suffix.as_str()),
        }
    }
}

impl fmt::Display for HostPattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Exact(exact) => f.write_str(exact),
            Self::Suffix(suffix) => write!(f, "*{suffix}"),
        }
    }
}

/// Which callback targets are acceptable.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SsrfPolicy {
    /// Allowed URL schemes.
    pub schemes: Vec<String>,
    /// Networks no resolved address may fall in.
    pub blocked_networks: Vec<CidrBlock>,
    /// Hostnames rejected without resolution.
    pub blocked_hosts: Vec<HostPattern>,
}

impl Default for SsrfPolicy {
    fn default() -> Self {
        let v4 = |a, b, c, d, prefix| CidrBlock {
            network: IpAddr::V4(Ipv4Addr::new(a, b, c, d)),
            prefix,
        };
        let v6 = |network: Ipv6Addr, prefix| CidrBlock { network: IpAddr::V6(network), prefix };

        Self {
            schemes: vec!["http".to_string(), "https".to_string()],
            blocked_networks: vec![
                v4(0, 0, 0, 0, 8),
                v4(10, 0, 0, 0, 8),
                v4(127, 0, 0, 0, 8),
                v4(169, 254, 0, 0, 16),
                v4(172, 16, 0, 0, 12),
                v4(192, 168, 0, 0, 16),
                v6(Ipv6Addr::UNSPECIFIED, 128),
                v6(Ipv6Addr::LOCALHOST, 128),
                v6(Ipv6Addr::new(0xfc00, 0, 0, 0, 0, 0, 0, 0), 7),
                v6(Ipv6Addr::new(0xfe80, 0, 0, 0, 0, 0, 0, 0), 10),
            ],
            blocked_hosts: vec![
                HostPattern::Exact("localhost".to_string()),
                HostPattern::Suffix(".localhost".to_string()),
                HostPattern::Suffix(".internal".to_string()),
            ],
        }
    }
}

impl SsrfPolicy {
    /// Drops the loopback networks and `localhost` patterns.
    ///
    /// Intended for local development and tests that run receivers on
    /// 127.0.0.1. Every other block stays in place.
    #[must_use]
    pub fn allowing_loopback(mut self) -> Self {
        let loopback = [IpAddr::V4(Ipv4Addr::LOCALHOST), IpAddr::V6(Ipv6Addr::LOCALHOST)];
        self.blocked_networks.retain(|block| !loopback.iter().any(|ip| block.contains(*ip)));
        self.blocked_hosts.retain(|pattern| match pattern {
            HostPattern::Exact(h) | HostPattern::Suffix(h) => !h.ends_with("localhost"),
        });
        self
    }

    fn blocking_network(&self, ip: IpAddr) -> Option<&CidrBlock> {
        let ip = canonical_ip(ip);
        self.blocked_networks.iter().find(|block| block.contains(ip))
    }

    fn blocking_host(&self, host: &str) -> Option<&HostPattern> {
        self.blocked_hosts.iter().find(|pattern| pattern.matches(host))
    }
}

/// Maps IPv4-mapped (`::ffff:a.b.c.d`) and IPv4-compatible (`::a.b.c.d`)
/// addresses to IPv4. `::` and `::1` stay IPv6 so their own blocks apply.
fn canonical_ip(ip: IpAddr) -> IpAddr {
    match ip {
        IpAddr::V6(v6) if !v6.is_unspecified() && !v6.is_loopback() => {
            v6.to_ipv4().map_or(ip, IpAddr::V4)
        },
        _ => ip,
    }
}

/// Outcome of a guard check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verdict {
    /// Target is safe; connect only to these addresses.
    Allow {
        /// Vetted socket addresses.
        addrs: Vec<SocketAddr>,
    },
    /// Target is unsafe.
    Deny(String),
    /// Hostname produced no addresses.
    Unresolvable(String),
}

impl Verdict {
    /// Returns true for `Allow`.
    pub fn is_allowed(&self) -> bool {
        matches!(self, Self::Allow { .. })
    }
}

/// Hostname resolution seam.
#[async_trait]
pub trait Resolver: Send + Sync + fmt::Debug {
    /// Resolves `host` to socket addresses on `port`.
    async fn resolve(&self, host: &str, port: u16) -> std::io::Result<Vec<SocketAddr>>;
}

/// Resolver backed by the operating system.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemResolver;

#[async_trait]
impl Resolver for SystemResolver {
    async fn resolve(&self, host: &str, port: u16) -> std::io::Result<Vec<SocketAddr>> {
        Ok(tokio::net::lookup_host((host, port)).await?.collect())
    }
}

/// Resolver answering from a mutable in-memory table.
///
/// Clones share the table, so a test can change what a host resolves to
/// between two delivery attempts.
#[derive(Debug, Clone, Default)]
pub struct StaticResolver {
    hosts: Arc<RwLock<HashMap<String, Vec<IpAddr>>>>,
}

impl StaticResolver {
    /// Creates an empty resolver.
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the addresses `host` resolves to.
    pub fn set(&self, host: impl Into<String>, ips: Vec<IpAddr>) {
        if let Ok(mut hosts) = self.hosts.write() {
            hosts.insert(host.into().to_ascii_lowercase(), ips);
        }
    }

    /// Makes `host` unresolvable.
    pub fn remove(&self, host: &str) {
        if let Ok(mut hosts) = self.hosts.write() {
            hosts.remove(&host.to_ascii_lowercase());
        }
    }
}

#[async_trait]
impl Resolver for StaticResolver {
    async fn resolve(&self, host: &str, port: u16) -> std::io::Result<Vec<SocketAddr>> {
        let hosts = self
            .hosts
            .read()
            .map_err(|_| std::io::Error::other("resolver table poisoned"))?;
        hosts
            .get(host)
            .map(|ips| ips.iter().map(|ip| SocketAddr::new(*ip, port)).collect())
            .ok_or_else(|| {
                std::io::Error::new(std::io::ErrorKind::NotFound, format!("no such host: {host}"))
            })
    }
}

/// Validates callback URLs against an `SsrfPolicy`.
#[derive(Debug, Clone)]
pub struct CallbackGuard {
    policy: Arc<SsrfPolicy>,
    resolver: Arc<dyn Resolver>,
}

impl Default for CallbackGuard {
    fn default() -> Self {
        Self::new(SsrfPolicy::default(), Arc::new(SystemResolver))
    }
}

impl CallbackGuard {
    /// Creates a guard with the given policy and resolver.
    pub fn new(policy: SsrfPolicy, resolver: Arc<dyn Resolver>) -> Self {
        Self { policy: Arc::new(policy), resolver }
    }

    /// Active policy.
    pub fn policy(&self) -> &SsrfPolicy {
        &self.policy
    }

    /// Checks `url` and resolves its host.
    pub async fn check(&self, url: &str) -> Verdict {
        let parsed = match Url::parse(url) {
            Ok(parsed) => parsed,
            Err(e) => return Verdict::Deny(format!("invalid URL: {e}")),
        };

        if !self.policy.schemes.iter().any(|s| s == parsed.scheme()) {
            return Verdict::Deny(format!("scheme {:?} is not allowed", parsed.scheme()));
        }

        let Some(raw_host) = parsed.host_str().filter(|h| !h.is_empty()) else {
            return Verdict::Deny("URL has no host".to_string());
        };
        let port = parsed.port_or_known_default().unwrap_or(80);
        let host = raw_host.trim_start_matches('[').trim_end_matches(']').trim_end_matches('.');
        let host = host.to_ascii_lowercase();

        if let Ok(ip) = host.parse::<IpAddr>() {
            return match self.policy.blocking_network(ip) {
                Some(block) => {
                    Verdict::Deny(format!("address {ip} is in blocked network {block}"))
                },
                None => Verdict::Allow { addrs: vec![SocketAddr::new(ip, port)] },
            };
        }

        if let Some(pattern) = self.policy.blocking_host(&host) {
            return Verdict::Deny(format!("host {host} matches blocked pattern {pattern}"));
        }

        let addrs = match self.resolver.resolve(&host, port).await {
            Ok(addrs) if addrs.is_empty() => {
                return Verdict::Unresolvable(format!("{host} resolved to no addresses"));
            },
            Ok(addrs) => addrs,
            Err(e) => return Verdict::Unresolvable(format!("failed to resolve {host}: {e}")),
        };

        for addr in &addrs {
            if let Some(block) = self.policy.blocking_network(addr.ip()) {
                return Verdict::Deny(format!(
                    "{host} resolves to {} in blocked network {block}",
                    canonical_ip(addr.ip())
                ));
            }
        }

        debug!(host = %host, addresses = addrs.len(), "callback target allowed");
        Verdict::Allow { addrs }
    }
}
