//! DNS resolver module.
//!
//! Provides the `Resolver` interface, a raw wire-format client over UDP, TCP,
//! DNS-over-TLS and DNS-over-HTTPS, and a time-boxed cache wrapper.

use std::collections::HashMap;
use std::future::Future;
use std::net::IpAddr;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::debug;

use crate::config::{DnsConfig, DnsKind};
use crate::error::{BypassError, Result};
use crate::outbound::{Direct, Outbound};

pub mod cache;
#[cfg(feature = "doh")]
pub mod doh;
#[cfg(feature = "dot")]
pub mod dot;
pub mod edns;
pub mod message;
mod stream;
#[cfg(any(feature = "doh", feature = "dot"))]
mod tls;
pub mod udp;

pub use cache::{CachedResolver, DEFAULT_CACHE_TTL};
#[cfg(feature = "doh")]
pub use doh::{DohFormat, DohResolver};
#[cfg(feature = "dot")]
pub use dot::DotResolver;
pub use edns::ClientSubnet;
pub use message::{RecordType, Response};
pub use stream::TcpResolver;
pub use udp::UdpResolver;

/// DNS resolver interface.
#[async_trait]
pub trait Resolver: Send + Sync {
    /// Resolve the hostname to its addresses, IPv4 first.
    ///
    /// Returns an error if the resolution fails completely. An empty list is
    /// a valid answer.
    async fn resolve(&self, host: &str) -> Result<Vec<IpAddr>>;
}

#[async_trait]
impl<R: Resolver + ?Sized> Resolver for Arc<R> {
    async fn resolve(&self, host: &str) -> Result<Vec<IpAddr>> {
        (**self).resolve(host).await
    }
}

/// System DNS resolver using the OS resolver.
#[derive(Debug, Default)]
pub struct SystemResolver;

impl SystemResolver {
    /// Create a new system resolver.
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Resolver for SystemResolver {
    async fn resolve(&self, host: &str) -> Result<Vec<IpAddr>> {
        if let Ok(ip) = host.parse::<IpAddr>() {
            return Ok(vec![ip]);
        }

        let addrs = tokio::net::lookup_host((host, 0u16))
            .await
            .map_err(|e| BypassError::ResolveError(format!("Failed to resolve {}: {}", host, e)))?;

        let mut ips: Vec<IpAddr> = addrs.map(|a| a.ip()).collect();
        ips.sort_by_key(|ip| ip.is_ipv6());
        ips.dedup();
        Ok(ips)
    }
}

/// Nil resolver that always returns no addresses.
#[derive(Debug, Default)]
pub struct NilResolver;

impl NilResolver {
    /// Create a new nil resolver.
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Resolver for NilResolver {
    async fn resolve(&self, _host: &str) -> Result<Vec<IpAddr>> {
        Ok(Vec::new())
    }
}

/// Static resolver with predefined mappings.
#[derive(Debug, Default)]
pub struct StaticResolver {
    mappings: HashMap<String, Vec<IpAddr>>,
}

impl StaticResolver {
    /// Create a new empty static resolver.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a mapping for a hostname.
    pub fn add(&mut self, host: impl Into<String>, ips: Vec<IpAddr>) {
        self.mappings.insert(host.into().to_ascii_lowercase(), ips);
    }

    /// Add a mapping and return self for chaining.
    pub fn with_mapping(mut self, host: impl Into<String>, ips: Vec<IpAddr>) -> Self {
        self.add(host, ips);
        self
    }
}

#[async_trait]
impl Resolver for StaticResolver {
    async fn resolve(&self, host: &str) -> Result<Vec<IpAddr>> {
        if let Ok(ip) = host.parse::<IpAddr>() {
            return Ok(vec![ip]);
        }

        self.mappings
            .get(&host.to_ascii_lowercase())
            .cloned()
            .ok_or_else(|| BypassError::ResolveError(format!("Host not found: {}", host)))
    }
}

/// Build a cached resolver from configuration.
///
/// `dialer` carries the TCP connections of the stream transports (TCP, DoT,
/// DoH); pass the upstream outbound to route DNS through it. `None` dials
/// directly.
pub fn build_resolver(
    config: &DnsConfig,
    dialer: Option<Arc<dyn Outbound>>,
) -> Result<Arc<dyn Resolver>> {
    let subnet = config
        .subnet
        .as_deref()
        .filter(|s| !s.is_empty())
        .map(ClientSubnet::parse)
        .transpose()?;
    let dialer = dialer.unwrap_or_else(|| Arc::new(Direct::new()));
    let server = config.server.trim();

    debug!(kind = ?config.kind, server, "building resolver");

    let inner: Arc<dyn Resolver> = match config.kind {
        DnsKind::Udp => Arc::new(
            UdpResolver::new(server, subnet)?
                .with_ipv6(config.ipv6)
                .with_timeout(config.timeout()),
        ),
        DnsKind::Tcp => Arc::new(
            TcpResolver::new(server, subnet, dialer)?
                .with_ipv6(config.ipv6)
                .with_timeout(config.timeout()),
        ),
        #[cfg(feature = "doh")]
        DnsKind::Doh | DnsKind::DohJson => {
            let format = if config.kind == DnsKind::DohJson {
                DohFormat::Json
            } else if config.doh_post {
                DohFormat::WirePost
            } else {
                DohFormat::WireGet
            };
            Arc::new(
                DohResolver::new(server, format, subnet, dialer)?
                    .with_ipv6(config.ipv6)
                    .with_timeout(config.timeout()),
            )
        }
        #[cfg(feature = "dot")]
        DnsKind::Dot => Arc::new(
            DotResolver::new(server, subnet, dialer)?
                .with_ipv6(config.ipv6)
                .with_timeout(config.timeout()),
        ),
        #[allow(unreachable_patterns)]
        other => {
            return Err(BypassError::ConfigError(format!(
                "DNS transport {:?} is not enabled in this build",
                other
            )))
        }
    };

    Ok(Arc::new(
        CachedResolver::new(inner)
            .with_ttl(config.cache_ttl())
            .with_capacity(config.cache_size),
    ))
}

/// Run the A lookup, then AAAA when `ipv6` is set.
///
/// A failed A lookup fails the whole resolution. A failed AAAA lookup is
/// logged and the A answers are kept.
pub(crate) async fn lookup_all<F, Fut>(host: &str, ipv6: bool, lookup: F) -> Result<Vec<IpAddr>>
where
    F: Fn(RecordType) -> Fut,
    Fut: Future<Output = Result<Vec<IpAddr>>>,
{
    let mut ips = lookup(RecordType::A).await?;
    if ipv6 {
        match lookup(RecordType::Aaaa).await {
            Ok(found) => ips.extend(found),
            Err(e) => debug!(host, error = %e, "AAAA lookup failed, keeping A answers"),
        }
    }
    Ok(ips)
}
