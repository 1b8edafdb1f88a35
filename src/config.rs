//! Configuration types.
//!
//! Every option struct derives `serde` so a host application can keep it in
//! its own JSON settings, and offers `with_*` builders for code.

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::outbound::DirectOptions;
use crate::resolver::cache::{DEFAULT_CACHE_CAPACITY, DEFAULT_CACHE_TTL};

/// Default LRU size of the rule decision cache
pub const DEFAULT_DECISION_CACHE_SIZE: usize = 1024;

/// Default server used for rule matching lookups
pub const DEFAULT_REMOTE_DNS: &str = "8.8.8.8:53";

/// Default server used to resolve direct connections
pub const DEFAULT_DIRECT_DNS: &str = "223.5.5.5:53";

/// Longest lifetime accepted for cached DNS answers
pub const MAX_CACHE_TTL: Duration = Duration::from_secs(7 * 24 * 60 * 60);

/// DNS transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DnsKind {
    #[default]
    Udp,
    Tcp,
    /// RFC 8484 wire format
    Doh,
    /// JSON API (`application/dns-json`)
    DohJson,
    Dot,
}

impl DnsKind {
    fn default_timeout(&self) -> Duration {
        match self {
            DnsKind::Doh | DnsKind::DohJson => Duration::from_secs(10),
            DnsKind::Udp | DnsKind::Tcp | DnsKind::Dot => Duration::from_secs(5),
        }
    }
}

/// Settings of one DNS resolver.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DnsConfig {
    pub kind: DnsKind,
    /// `host[:port]` for UDP/TCP/DoT, a URL or bare host for DoH
    pub server: String,
    /// EDNS client subnet in CIDR notation
    pub subnet: Option<String>,
    /// Also query AAAA records
    pub ipv6: bool,
    pub timeout_secs: Option<u64>,
    /// Send DoH wire queries with POST instead of GET
    pub doh_post: bool,
    pub cache_ttl_secs: Option<u64>,
    pub cache_size: usize,
}

impl Default for DnsConfig {
    fn default() -> Self {
        Self::udp(DEFAULT_REMOTE_DNS)
    }
}

impl DnsConfig {
    fn with_kind(kind: DnsKind, server: impl Into<String>) -> Self {
        Self {
            kind,
            server: server.into(),
            subnet: None,
            ipv6: false,
            timeout_secs: None,
            doh_post: false,
            cache_ttl_secs: None,
            cache_size: DEFAULT_CACHE_CAPACITY,
        }
    }

    pub fn udp(server: impl Into<String>) -> Self {
        Self::with_kind(DnsKind::Udp, server)
    }

    pub fn tcp(server: impl Into<String>) -> Self {
        Self::with_kind(DnsKind::Tcp, server)
    }

    pub fn doh(server: impl Into<String>) -> Self {
        Self::with_kind(DnsKind::Doh, server)
    }

    pub fn doh_json(server: impl Into<String>) -> Self {
        Self::with_kind(DnsKind::DohJson, server)
    }

    pub fn dot(server: impl Into<String>) -> Self {
        Self::with_kind(DnsKind::Dot, server)
    }

    /// Set the EDNS client subnet.
    pub fn with_subnet(mut self, subnet: impl Into<String>) -> Self {
        self.subnet = Some(subnet.into());
        self
    }

    pub fn with_ipv6(mut self, ipv6: bool) -> Self {
        self.ipv6 = ipv6;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout_secs = Some(timeout.as_secs().max(1));
        self
    }

    pub fn with_doh_post(mut self, post: bool) -> Self {
        self.doh_post = post;
        self
    }

    pub fn with_cache_ttl(mut self, ttl: Duration) -> Self {
        self.cache_ttl_secs = Some(ttl.as_secs());
        self
    }

    pub fn with_cache_size(mut self, size: usize) -> Self {
        self.cache_size = size;
        self
    }

    /// Query timeout, the transport default when unset.
    pub fn timeout(&self) -> Duration {
        self.timeout_secs
            .map(Duration::from_secs)
            .unwrap_or_else(|| self.kind.default_timeout())
    }

    /// Lifetime of cached answers, capped at [`MAX_CACHE_TTL`].
    pub fn cache_ttl(&self) -> Duration {
        self.cache_ttl_secs
            .map(Duration::from_secs)
            .unwrap_or(DEFAULT_CACHE_TTL)
            .min(MAX_CACHE_TTL)
    }
}

/// Dispatcher builder options.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DispatcherOptions {
    /// LRU size of the rule decision cache
    pub cache_size: usize,
    /// Bypass rule file. No rules are loaded when unset.
    pub rules_path: Option<PathBuf>,
    /// Where to fetch the rule file from when it is missing
    pub rules_url: Option<String>,
    /// Consult the rules at all
    pub bypass_enabled: bool,
    /// Resolver used for rule matching
    pub dns: DnsConfig,
    /// Resolver used for direct connections
    pub direct_dns: DnsConfig,
    /// Dial the rule matching resolver through the upstream proxy
    pub dns_proxy: bool,
    pub direct: DirectOptions,
}

impl Default for DispatcherOptions {
    fn default() -> Self {
        Self {
            cache_size: DEFAULT_DECISION_CACHE_SIZE,
            rules_path: None,
            rules_url: None,
            bypass_enabled: true,
            dns: DnsConfig::default(),
            direct_dns: DnsConfig::udp(DEFAULT_DIRECT_DNS),
            dns_proxy: false,
            direct: DirectOptions::default(),
        }
    }
}

impl DispatcherOptions {
    /// Create new dispatcher options.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set decision cache size.
    pub fn with_cache_size(mut self, size: usize) -> Self {
        self.cache_size = size;
        self
    }

    pub fn with_rules_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.rules_path = Some(path.into());
        self
    }

    pub fn with_rules_url(mut self, url: impl Into<String>) -> Self {
        self.rules_url = Some(url.into());
        self
    }

    pub fn with_bypass_enabled(mut self, enabled: bool) -> Self {
        self.bypass_enabled = enabled;
        self
    }

    pub fn with_dns(mut self, dns: DnsConfig) -> Self {
        self.dns = dns;
        self
    }

    pub fn with_direct_dns(mut self, dns: DnsConfig) -> Self {
        self.direct_dns = dns;
        self
    }

    pub fn with_dns_proxy(mut self, enabled: bool) -> Self {
        self.dns_proxy = enabled;
        self
    }

    pub fn with_direct(mut self, direct: DirectOptions) -> Self {
        self.direct = direct;
        self
    }
}
