//! Direct outbound connection implementation.
//!
//! Connects to the target from the local network. Domains are resolved with
//! the configured resolver and every address is tried in order.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::net::{TcpStream as TokioTcpStream, UdpSocket as TokioUdpSocket};
use tracing::debug;

use crate::error::{BypassError, DialErrorKind, Result};
use crate::resolver::{Resolver, SystemResolver};

use super::{Addr, Outbound, TcpConn, TokioTcpConn, TokioUdpConn, UdpConn, DEFAULT_DIALER_TIMEOUT};

/// Options for creating a Direct outbound.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DirectOptions {
    /// Bind IPv4 address for outgoing connections
    pub bind_ip4: Option<Ipv4Addr>,
    /// Bind IPv6 address for outgoing connections
    pub bind_ip6: Option<Ipv6Addr>,
    /// Bind to a specific network device (Linux only, SO_BINDTODEVICE).
    /// Mutually exclusive with bind_ip4/bind_ip6.
    pub bind_device: Option<String>,
    /// Enable TCP Fast Open
    pub fast_open: bool,
    /// Connection timeout
    pub timeout: Option<Duration>,
}

/// Direct outbound that connects straight to the target.
#[derive(Clone)]
pub struct Direct {
    bind_ip4: Option<Ipv4Addr>,
    bind_ip6: Option<Ipv6Addr>,
    bind_device: Option<String>,
    fast_open: bool,
    timeout: Duration,
    resolver: Arc<dyn Resolver>,
}

impl Direct {
    /// Create a new Direct outbound using the system resolver.
    pub fn new() -> Self {
        Self {
            bind_ip4: None,
            bind_ip6: None,
            bind_device: None,
            fast_open: false,
            timeout: DEFAULT_DIALER_TIMEOUT,
            resolver: Arc::new(SystemResolver::new()),
        }
    }

    /// Create a new Direct outbound with the given options.
    pub fn with_options(opts: DirectOptions) -> Result<Self> {
        if opts.bind_device.is_some() && (opts.bind_ip4.is_some() || opts.bind_ip6.is_some()) {
            return Err(BypassError::ConfigError(
                "bind_device is mutually exclusive with bind_ip4/bind_ip6".to_string(),
            ));
        }
        Ok(Self {
            bind_ip4: opts.bind_ip4,
            bind_ip6: opts.bind_ip6,
            bind_device: opts.bind_device,
            fast_open: opts.fast_open,
            timeout: opts.timeout.unwrap_or(DEFAULT_DIALER_TIMEOUT),
            resolver: Arc::new(SystemResolver::new()),
        })
    }

    /// Resolve domains with `resolver` instead of the system resolver.
    pub fn with_resolver(mut self, resolver: Arc<dyn Resolver>) -> Self {
        self.resolver = resolver;
        self
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    async fn lookup(&self, addr: &Addr) -> Result<Vec<IpAddr>> {
        if let Some(ip) = addr.ip() {
            return Ok(vec![ip]);
        }
        let ips = self.resolver.resolve(&addr.host).await?;
        if ips.is_empty() {
            return Err(BypassError::dial(
                DialErrorKind::NoAddress,
                format!("no address for {}", addr.host),
            ));
        }
        Ok(ips)
    }

    fn needs_custom_socket(&self, ip: &IpAddr) -> bool {
        self.get_bind_ip(ip).is_some() || self.bind_device.is_some() || self.fast_open
    }

    fn get_bind_ip(&self, target: &IpAddr) -> Option<IpAddr> {
        match target {
            IpAddr::V4(_) => self.bind_ip4.map(IpAddr::V4),
            IpAddr::V6(_) => self.bind_ip6.map(IpAddr::V6),
        }
    }

    /// Create a TCP socket carrying the bind and fast open options.
    fn create_tcp_socket(&self, ip: &IpAddr) -> Result<socket2::Socket> {
        let domain = match ip {
            IpAddr::V4(_) => socket2::Domain::IPV4,
            IpAddr::V6(_) => socket2::Domain::IPV6,
        };
        let socket =
            socket2::Socket::new(domain, socket2::Type::STREAM, Some(socket2::Protocol::TCP))
                .map_err(|e| socket_error("Failed to create socket", e))?;

        if let Some(bind_ip) = self.get_bind_ip(ip) {
            socket
                .bind(&SocketAddr::new(bind_ip, 0).into())
                .map_err(|e| socket_error("Failed to bind", e))?;
        }

        #[cfg(target_os = "linux")]
        if let Some(ref device) = self.bind_device {
            socket
                .bind_device(Some(device.as_bytes()))
                .map_err(|e| socket_error("Failed to bind device", e))?;
        }

        if self.fast_open {
            set_tcp_fastopen(&socket)?;
        }

        Ok(socket)
    }

    async fn dial_ip(&self, ip: IpAddr, port: u16) -> Result<TokioTcpStream> {
        let target = SocketAddr::new(ip, port);

        let connect = async {
            let stream = if self.needs_custom_socket(&ip) {
                let socket = self.create_tcp_socket(&ip)?;
                socket
                    .set_nonblocking(true)
                    .map_err(|e| socket_error("Failed to set nonblocking", e))?;
                let std_stream: std::net::TcpStream = socket.into();
                tokio::net::TcpSocket::from_std_stream(std_stream)
                    .connect(target)
                    .await?
            } else {
                TokioTcpStream::connect(target).await?
            };
            Ok::<_, BypassError>(stream)
        };

        tokio::time::timeout(self.timeout, connect)
            .await
            .map_err(|_| {
                BypassError::dial(DialErrorKind::Timeout, format!("connect {} timed out", target))
            })?
            .map_err(|e| match e {
                BypassError::IoError(e) => BypassError::dial(
                    DialErrorKind::ConnectionFailed,
                    format!("connect {} failed: {}", target, e),
                ),
                other => other,
            })
    }

    /// Create an unconnected UDP socket of the requested family.
    async fn bind_udp(&self, use_ipv6: bool) -> Result<TokioUdpSocket> {
        if self.bind_device.is_some() {
            let socket = self.create_udp_socket_with_device(use_ipv6)?;
            socket
                .set_nonblocking(true)
                .map_err(|e| socket_error("Failed to set nonblocking", e))?;
            let std_socket: std::net::UdpSocket = socket.into();
            return Ok(TokioUdpSocket::from_std(std_socket)?);
        }

        let bind_addr = if use_ipv6 {
            SocketAddr::new(IpAddr::V6(self.bind_ip6.unwrap_or(Ipv6Addr::UNSPECIFIED)), 0)
        } else {
            SocketAddr::new(IpAddr::V4(self.bind_ip4.unwrap_or(Ipv4Addr::UNSPECIFIED)), 0)
        };
        TokioUdpSocket::bind(bind_addr)
            .await
            .map_err(|e| socket_error("Failed to bind UDP", e))
    }

    fn create_udp_socket_with_device(&self, use_ipv6: bool) -> Result<socket2::Socket> {
        let (domain, bind_addr) = if use_ipv6 {
            (
                socket2::Domain::IPV6,
                SocketAddr::new(IpAddr::V6(Ipv6Addr::UNSPECIFIED), 0),
            )
        } else {
            (
                socket2::Domain::IPV4,
                SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 0),
            )
        };
        let socket =
            socket2::Socket::new(domain, socket2::Type::DGRAM, Some(socket2::Protocol::UDP))
                .map_err(|e| socket_error("Failed to create UDP socket", e))?;
        socket
            .bind(&bind_addr.into())
            .map_err(|e| socket_error("Failed to bind UDP", e))?;

        #[cfg(target_os = "linux")]
        if let Some(ref device) = self.bind_device {
            socket
                .bind_device(Some(device.as_bytes()))
                .map_err(|e| socket_error("Failed to bind device", e))?;
        }

        Ok(socket)
    }
}

impl Default for Direct {
    fn default() -> Self {
        Self::new()
    }
}

fn socket_error(context: &str, e: std::io::Error) -> BypassError {
    BypassError::dial(DialErrorKind::ConnectionFailed, format!("{}: {}", context, e))
}

#[async_trait]
impl Outbound for Direct {
    async fn dial_tcp(&self, addr: &Addr) -> Result<Box<dyn TcpConn>> {
        let ips = self.lookup(addr).await?;

        let mut last_err = None;
        for ip in ips {
            match self.dial_ip(ip, addr.port).await {
                Ok(stream) => return Ok(Box::new(TokioTcpConn::new(stream))),
                Err(e) => {
                    debug!(target = %addr, %ip, error = %e, "direct dial attempt failed");
                    last_err = Some(e);
                }
            }
        }
        Err(last_err.unwrap_or_else(|| {
            BypassError::dial(DialErrorKind::NoAddress, format!("no address for {}", addr))
        }))
    }

    async fn dial_udp(&self, addr: &Addr) -> Result<Box<dyn UdpConn>> {
        let use_ipv6 = matches!(addr.ip(), Some(IpAddr::V6(_)));
        let socket = self.bind_udp(use_ipv6).await?;
        Ok(Box::new(TokioUdpConn::new(socket)))
    }
}

/// Set TCP Fast Open on a socket.
///
/// - Linux: uses `TCP_FASTOPEN_CONNECT` (enables TFO for client connect() calls)
/// - macOS: uses `TCP_FASTOPEN`
#[cfg(any(target_os = "linux", target_os = "macos"))]
fn set_tcp_fastopen(socket: &socket2::Socket) -> Result<()> {
    use std::os::unix::io::AsRawFd;

    #[cfg(target_os = "linux")]
    const TFO_OPT: libc::c_int = 30; // TCP_FASTOPEN_CONNECT

    #[cfg(target_os = "macos")]
    const TFO_OPT: libc::c_int = libc::TCP_FASTOPEN;

    let val: libc::c_int = 1;
    let ret = unsafe {
        libc::setsockopt(
            socket.as_raw_fd(),
            libc::IPPROTO_TCP,
            TFO_OPT,
            &val as *const _ as *const libc::c_void,
            std::mem::size_of::<libc::c_int>() as libc::socklen_t,
        )
    };
    if ret < 0 {
        return Err(socket_error(
            "Failed to set TCP Fast Open",
            std::io::Error::last_os_error(),
        ));
    }
    Ok(())
}

#[cfg(not(any(target_os = "linux", target_os = "macos")))]
fn set_tcp_fastopen(_socket: &socket2::Socket) -> Result<()> {
    Err(BypassError::ConfigError(
        "TCP Fast Open is not supported on this platform".to_string(),
    ))
}
