//! Bypass dispatcher.
//!
//! Turns a `host:port` request into a connection: direct, blocked, or through
//! the upstream proxy, according to the bypass rules.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use tracing::{debug, info};

use crate::config::{DispatcherOptions, DnsConfig};
use crate::error::{BypassError, Result};
use crate::mapper::RuleMapper;
use crate::outbound::{Addr, Direct, DirectOptions, Outbound, Reject, TcpConn, UdpConn};
use crate::parser::ensure_rules_file;
use crate::resolver::{build_resolver, Resolver};
use crate::stats::{Statistics, TrackedConn, TrackedUdpConn};
use crate::types::Mark;

/// Port used when the request carries none
pub const DEFAULT_PORT: u16 = 80;

/// Installed upstream dialer and the identity it was installed under.
struct Upstream {
    outbound: Arc<dyn Outbound>,
    hash: String,
}

/// Settings that can change at runtime.
struct Settings {
    dns: DnsConfig,
    direct_dns: DnsConfig,
    dns_proxy: bool,
    rules_path: Option<PathBuf>,
    rules_url: Option<String>,
}

/// Where a request goes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Route {
    Direct,
    Block,
    Upstream,
}

impl Route {
    fn of(mark: Option<Mark>) -> Self {
        match mark {
            Some(Mark::Block) => Route::Block,
            Some(mark) if mark.is_direct() => Route::Direct,
            _ => Route::Upstream,
        }
    }
}

/// Bypass dispatcher.
///
/// Owns the rule mapper and the traffic statistics. It implements
/// [`Outbound`] so it can be handed to anything that takes a dialer.
pub struct Dispatcher {
    mapper: RuleMapper,
    stats: Statistics,
    direct: RwLock<Arc<Direct>>,
    upstream: RwLock<Upstream>,
    bypass_enabled: AtomicBool,
    direct_options: DirectOptions,
    settings: Mutex<Settings>,
}

impl Dispatcher {
    /// Create a dispatcher.
    ///
    /// When `rules_path` is set the rule file is loaded, and created first if
    /// missing, which may download it. Until [`set_proxy`](Self::set_proxy)
    /// is called the upstream is a plain direct dialer.
    pub fn new(options: DispatcherOptions) -> Result<Self> {
        let remote = build_resolver(&options.dns, None)?;
        let direct = build_direct(&options.direct, &options.direct_dns)?;
        let mapper = RuleMapper::new(options.cache_size).with_resolver(remote);

        let dispatcher = Self {
            mapper,
            stats: Statistics::new(),
            direct: RwLock::new(Arc::new(direct)),
            upstream: RwLock::new(Upstream {
                outbound: Arc::new(Direct::new()),
                hash: String::new(),
            }),
            bypass_enabled: AtomicBool::new(options.bypass_enabled),
            direct_options: options.direct,
            settings: Mutex::new(Settings {
                dns: options.dns,
                direct_dns: options.direct_dns,
                dns_proxy: options.dns_proxy,
                rules_path: options.rules_path,
                rules_url: options.rules_url,
            }),
        };

        let rules = {
            let settings = dispatcher.settings.lock();
            settings.rules_path.clone().map(|p| (p, settings.rules_url.clone()))
        };
        if let Some((path, url)) = rules {
            dispatcher.mapper.reload_file(&path, url.as_deref())?;
        }
        if dispatcher.settings.lock().dns_proxy {
            dispatcher.rebuild_remote_resolver()?;
        }

        Ok(dispatcher)
    }

    /// The rule mapper.
    pub fn mapper(&self) -> &RuleMapper {
        &self.mapper
    }

    /// Traffic statistics of every connection handed out.
    pub fn statistics(&self) -> &Statistics {
        &self.stats
    }

    /// Routing decision for a host, `None` when nothing matched or bypass is off.
    pub async fn decide(&self, host: &str) -> Option<Mark> {
        if !self.bypass_enabled() {
            return None;
        }
        self.mapper.search(host).await.mark
    }

    async fn route(&self, addr: &Addr) -> (Option<Mark>, Route) {
        let mark = self.decide(&addr.host).await;
        let label = mark.map(|m| m.as_str()).unwrap_or("default");
        debug!("[{}] -> {}", addr, label);
        (mark, Route::of(mark))
    }

    fn direct(&self) -> Arc<Direct> {
        self.direct.read().clone()
    }

    fn upstream(&self) -> Arc<dyn Outbound> {
        self.upstream.read().outbound.clone()
    }

    /// Open a stream to `host_port` (`host`, `host:port`, `[v6]:port`).
    pub async fn forward(&self, host_port: &str) -> Result<TrackedConn> {
        let addr = Addr::parse(host_port, DEFAULT_PORT)?;
        let (mark, route) = self.route(&addr).await;

        let conn = match route {
            Route::Block => Reject.dial_tcp(&addr).await?,
            Route::Direct => self.direct().dial_tcp(&addr).await?,
            Route::Upstream => self.upstream().dial_tcp(&addr).await?,
        };
        Ok(self.stats.wrap(&addr.to_string(), mark, conn))
    }

    /// Open a packet connection for `host_port`.
    ///
    /// A direct decision yields an unconnected local UDP socket.
    pub async fn forward_packet(&self, host_port: &str) -> Result<TrackedUdpConn> {
        let addr = Addr::parse(host_port, DEFAULT_PORT)?;
        let (mark, route) = self.route(&addr).await;

        let conn = match route {
            Route::Block => Reject.dial_udp(&addr).await?,
            Route::Direct => self.direct().dial_udp(&addr).await?,
            Route::Upstream => self.upstream().dial_udp(&addr).await?,
        };
        Ok(self.stats.wrap_packet(&addr.to_string(), mark, conn))
    }

    /// Install the upstream dialer. `hash` identifies it: installing under
    /// the current hash is a no-op. `None` installs a plain direct dialer.
    pub fn set_proxy(&self, outbound: Option<Arc<dyn Outbound>>, hash: &str) -> Result<()> {
        {
            let mut upstream = self.upstream.write();
            if upstream.hash == hash {
                return Ok(());
            }
            upstream.outbound = outbound.unwrap_or_else(|| Arc::new(Direct::new()));
            upstream.hash = hash.to_string();
        }
        info!(hash, "upstream changed");

        if self.settings.lock().dns_proxy {
            self.rebuild_remote_resolver()?;
        }
        Ok(())
    }

    pub fn set_bypass_enabled(&self, enabled: bool) {
        if self.bypass_enabled.swap(enabled, Ordering::SeqCst) != enabled {
            info!(enabled, "bypass toggled");
        }
    }

    pub fn bypass_enabled(&self) -> bool {
        self.bypass_enabled.load(Ordering::SeqCst)
    }

    /// Reload the configured rule file, creating it first if missing.
    ///
    /// Returns the number of rules loaded.
    pub async fn reload_rules(&self) -> Result<usize> {
        let (path, url) = {
            let settings = self.settings.lock();
            let path = settings
                .rules_path
                .clone()
                .ok_or_else(|| BypassError::ConfigError("no rules file configured".into()))?;
            (path, settings.rules_url.clone())
        };

        let bootstrap_path = path.clone();
        tokio::task::spawn_blocking(move || ensure_rules_file(&bootstrap_path, url.as_deref()))
            .await
            .map_err(|e| BypassError::ConfigError(format!("rules bootstrap task failed: {}", e)))??;
        self.mapper.load_file(&path)
    }

    /// Switch to another rule file. The same path again is a no-op.
    pub async fn set_rules_file(&self, path: impl Into<PathBuf>) -> Result<usize> {
        let path = path.into();
        {
            let mut settings = self.settings.lock();
            if settings.rules_path.as_ref() == Some(&path) {
                return Ok(self.mapper.rule_count());
            }
            settings.rules_path = Some(path);
        }
        self.reload_rules().await
    }

    /// Change the resolver used for rule matching.
    pub fn set_dns(&self, dns: DnsConfig) -> Result<()> {
        let through_proxy = {
            let settings = self.settings.lock();
            if settings.dns == dns {
                return Ok(());
            }
            settings.dns_proxy
        };
        self.install_remote_resolver(&dns, through_proxy)?;
        self.settings.lock().dns = dns;
        Ok(())
    }

    /// Change the resolver used for direct connections.
    pub fn set_direct_dns(&self, dns: DnsConfig) -> Result<()> {
        let mut settings = self.settings.lock();
        if settings.direct_dns == dns {
            return Ok(());
        }
        let direct = build_direct(&self.direct_options, &dns)?;
        settings.direct_dns = dns;
        *self.direct.write() = Arc::new(direct);
        Ok(())
    }

    /// Replace the direct-connection resolver with a custom one.
    pub fn set_direct_resolver(&self, resolver: Arc<dyn Resolver>) -> Result<()> {
        let direct = Direct::with_options(self.direct_options.clone())?.with_resolver(resolver);
        *self.direct.write() = Arc::new(direct);
        Ok(())
    }

    /// Route rule matching DNS through the upstream dialer.
    pub fn set_dns_proxy(&self, enabled: bool) -> Result<()> {
        let dns = {
            let settings = self.settings.lock();
            if settings.dns_proxy == enabled {
                return Ok(());
            }
            settings.dns.clone()
        };
        self.install_remote_resolver(&dns, enabled)?;
        self.settings.lock().dns_proxy = enabled;
        Ok(())
    }

    fn rebuild_remote_resolver(&self) -> Result<()> {
        let (dns, through_proxy) = {
            let settings = self.settings.lock();
            (settings.dns.clone(), settings.dns_proxy)
        };
        self.install_remote_resolver(&dns, through_proxy)
    }

    fn install_remote_resolver(&self, dns: &DnsConfig, through_proxy: bool) -> Result<()> {
        let dialer = through_proxy.then(|| self.upstream());
        let resolver = build_resolver(dns, dialer)?;
        self.mapper.set_resolver(Some(resolver));
        debug!(server = %dns.server, through_proxy, "rule resolver rebuilt");
        Ok(())
    }
}

fn build_direct(options: &DirectOptions, dns: &DnsConfig) -> Result<Direct> {
    let resolver = build_resolver(dns, None)?;
    Ok(Direct::with_options(options.clone())?.with_resolver(resolver))
}

#[async_trait]
impl Outbound for Dispatcher {
    async fn dial_tcp(&self, addr: &Addr) -> Result<Box<dyn TcpConn>> {
        Ok(Box::new(self.forward(&addr.to_string()).await?))
    }

    async fn dial_udp(&self, addr: &Addr) -> Result<Box<dyn UdpConn>> {
        Ok(Box::new(self.forward_packet(&addr.to_string()).await?))
    }
}
