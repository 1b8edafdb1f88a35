//! Outbound connection implementations.
//!
//! This module provides the dialer seam used by the dispatcher:
//! - `Direct`: Direct connection, resolving through a configurable resolver
//! - `Reject`: Refuse every connection with a blocked error
//! - `FnOutbound`: Adapt a closure (e.g. an upstream tunnel client) to `Outbound`

use std::fmt;
use std::future::Future;
use std::io;
use std::net::{IpAddr, SocketAddr};
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

use crate::error::{BypassError, DialErrorKind, Result};

mod direct;
mod reject;

pub use direct::{Direct, DirectOptions};
pub use reject::Reject;

/// Default dialer timeout
pub const DEFAULT_DIALER_TIMEOUT: Duration = Duration::from_secs(15);

/// Destination address.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Addr {
    /// Hostname or IP address, without brackets
    pub host: String,
    /// Port number
    pub port: u16,
}

impl Addr {
    /// Create a new Addr
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    /// Parse `host:port`, `[v6]:port`, a bare host or a bare IPv6 literal.
    /// A missing port becomes `default_port`.
    pub fn parse(s: &str, default_port: u16) -> Result<Self> {
        let s = s.trim();
        if s.is_empty() {
            return Err(BypassError::InvalidAddress("empty address".into()));
        }

        if let Some(rest) = s.strip_prefix('[') {
            let (host, tail) = rest
                .split_once(']')
                .ok_or_else(|| BypassError::InvalidAddress(s.to_string()))?;
            let port = match tail.strip_prefix(':') {
                Some(p) => parse_port(s, p)?,
                None if tail.is_empty() => default_port,
                None => return Err(BypassError::InvalidAddress(s.to_string())),
            };
            return Ok(Self::new(host, port));
        }

        // A bare IPv6 literal has more than one colon.
        if s.parse::<IpAddr>().is_ok() {
            return Ok(Self::new(s, default_port));
        }

        match s.rsplit_once(':') {
            Some((host, port)) if !host.is_empty() && !host.contains(':') => {
                Ok(Self::new(host, parse_port(s, port)?))
            }
            Some(_) => Err(BypassError::InvalidAddress(s.to_string())),
            None => Ok(Self::new(s, default_port)),
        }
    }

    /// Build from a socket address.
    pub fn from_socket_addr(addr: SocketAddr) -> Self {
        Self::new(addr.ip().to_string(), addr.port())
    }

    /// The host as an IP address, if it is one.
    pub fn ip(&self) -> Option<IpAddr> {
        self.host.parse().ok()
    }

    /// The socket address when the host is an IP literal.
    pub fn socket_addr(&self) -> Option<SocketAddr> {
        self.ip().map(|ip| SocketAddr::new(ip, self.port))
    }
}

fn parse_port(full: &str, port: &str) -> Result<u16> {
    port.parse()
        .map_err(|_| BypassError::InvalidAddress(format!("invalid port in {}", full)))
}

impl fmt::Display for Addr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.host.contains(':') {
            write!(f, "[{}]:{}", self.host, self.port)
        } else {
            write!(f, "{}:{}", self.host, self.port)
        }
    }
}

/// Outbound connection interface.
#[async_trait]
pub trait Outbound: Send + Sync {
    /// Establish a TCP connection to the given address.
    async fn dial_tcp(&self, addr: &Addr) -> Result<Box<dyn TcpConn>>;

    /// Create a UDP connection for the given address.
    async fn dial_udp(&self, addr: &Addr) -> Result<Box<dyn UdpConn>>;
}

/// Byte stream returned by an outbound.
pub trait TcpConn: AsyncRead + AsyncWrite + Send + Sync + Unpin {
    /// Get the local address
    fn local_addr(&self) -> io::Result<SocketAddr> {
        Err(io::Error::new(io::ErrorKind::Unsupported, "no local address"))
    }

    /// Get the peer address
    fn peer_addr(&self) -> io::Result<SocketAddr> {
        Err(io::Error::new(io::ErrorKind::Unsupported, "no peer address"))
    }
}

/// Packet connection returned by an outbound.
#[async_trait]
pub trait UdpConn: Send + Sync {
    /// Read from the UDP connection
    async fn read_from(&self, buf: &mut [u8]) -> Result<(usize, Addr)>;

    /// Write to the UDP connection
    async fn write_to(&self, buf: &[u8], addr: &Addr) -> Result<usize>;

    /// Get the local address
    fn local_addr(&self) -> io::Result<SocketAddr>;
}

/// Tokio TcpStream wrapper implementing TcpConn
pub struct TokioTcpConn {
    inner: tokio::net::TcpStream,
}

impl TokioTcpConn {
    pub fn new(stream: tokio::net::TcpStream) -> Self {
        Self { inner: stream }
    }

    pub fn into_inner(self) -> tokio::net::TcpStream {
        self.inner
    }
}

impl AsyncRead for TokioTcpConn {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_read(cx, buf)
    }
}

impl AsyncWrite for TokioTcpConn {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.inner).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_shutdown(cx)
    }
}

impl TcpConn for TokioTcpConn {
    fn local_addr(&self) -> io::Result<SocketAddr> {
        self.inner.local_addr()
    }

    fn peer_addr(&self) -> io::Result<SocketAddr> {
        self.inner.peer_addr()
    }
}

/// In-memory pipes can stand in for network streams.
impl TcpConn for tokio::io::DuplexStream {}

/// Tokio UdpSocket wrapper implementing UdpConn
pub struct TokioUdpConn {
    inner: tokio::net::UdpSocket,
}

impl TokioUdpConn {
    pub fn new(socket: tokio::net::UdpSocket) -> Self {
        Self { inner: socket }
    }

    pub fn into_inner(self) -> tokio::net::UdpSocket {
        self.inner
    }
}

#[async_trait]
impl UdpConn for TokioUdpConn {
    async fn read_from(&self, buf: &mut [u8]) -> Result<(usize, Addr)> {
        let (n, addr) = self.inner.recv_from(buf).await.map_err(|e| {
            BypassError::dial(DialErrorKind::ConnectionFailed, format!("UDP recv error: {}", e))
        })?;
        Ok((n, Addr::from_socket_addr(addr)))
    }

    async fn write_to(&self, buf: &[u8], addr: &Addr) -> Result<usize> {
        let target = match addr.socket_addr() {
            Some(sa) => sa,
            None => tokio::net::lookup_host(addr.to_string())
                .await?
                .next()
                .ok_or_else(|| {
                    BypassError::dial(DialErrorKind::NoAddress, format!("no address for {}", addr))
                })?,
        };
        self.inner.send_to(buf, target).await.map_err(|e| {
            BypassError::dial(DialErrorKind::ConnectionFailed, format!("UDP send error: {}", e))
        })
    }

    fn local_addr(&self) -> io::Result<SocketAddr> {
        self.inner.local_addr()
    }
}

/// Future returned by a `FnOutbound` dial closure.
pub type DialFuture = Pin<Box<dyn Future<Output = Result<Box<dyn TcpConn>>> + Send>>;

/// Adapts a TCP dial closure to `Outbound`. UDP is reported as unsupported.
pub struct FnOutbound<F> {
    dial: F,
}

impl<F> FnOutbound<F>
where
    F: Fn(Addr) -> DialFuture + Send + Sync,
{
    pub fn new(dial: F) -> Self {
        Self { dial }
    }
}

#[async_trait]
impl<F> Outbound for FnOutbound<F>
where
    F: Fn(Addr) -> DialFuture + Send + Sync,
{
    async fn dial_tcp(&self, addr: &Addr) -> Result<Box<dyn TcpConn>> {
        (self.dial)(addr.clone()).await
    }

    async fn dial_udp(&self, addr: &Addr) -> Result<Box<dyn UdpConn>> {
        Err(BypassError::dial(
            DialErrorKind::Unsupported,
            format!("UDP not supported for {}", addr),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{Ipv4Addr, Ipv6Addr};

    #[test]
    fn test_addr_parse_host_port() {
        let addr = Addr::parse("example.com:443", 80).unwrap();
        assert_eq!(addr, Addr::new("example.com", 443));
    }

    #[test]
    fn test_addr_parse_default_port() {
        let addr = Addr::parse("example.com", 80).unwrap();
        assert_eq!(addr.port, 80);
        let addr = Addr::parse("10.0.0.1", 80).unwrap();
        assert_eq!(addr.ip(), Some(IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1))));
    }

    #[test]
    fn test_addr_parse_ipv6() {
        let addr = Addr::parse("[::1]:8080", 80).unwrap();
        assert_eq!(addr.ip(), Some(IpAddr::V6(Ipv6Addr::LOCALHOST)));
        assert_eq!(addr.port, 8080);
        assert_eq!(addr.to_string(), "[::1]:8080");

        let addr = Addr::parse("2001:db8::1", 80).unwrap();
        assert_eq!(addr.port, 80);
        let addr = Addr::parse("[2001:db8::1]", 53).unwrap();
        assert_eq!(addr.port, 53);
    }

    #[test]
    fn test_addr_parse_invalid() {
        assert!(Addr::parse("", 80).is_err());
        assert!(Addr::parse("example.com:http", 80).is_err());
        assert!(Addr::parse("example.com:70000", 80).is_err());
        assert!(Addr::parse("[::1", 80).is_err());
    }

    #[test]
    fn test_addr_from_socket_addr_v4() {
        let sock_addr = SocketAddr::new(IpAddr::V4(Ipv4Addr::new(192, 168, 1, 1)), 8080);
        let addr = Addr::from_socket_addr(sock_addr);

        assert_eq!(addr.host, "192.168.1.1");
        assert_eq!(addr.port, 8080);
        assert_eq!(addr.socket_addr(), Some(sock_addr));
    }

    #[test]
    fn test_addr_display() {
        let addr = Addr::new("example.com", 443);
        assert_eq!(format!("{}", addr), "example.com:443");
    }

    #[tokio::test]
    async fn test_fn_outbound_delegates() {
        let outbound = FnOutbound::new(|addr: Addr| -> DialFuture {
            Box::pin(async move {
                assert_eq!(addr.port, 9);
                let (a, _b) = tokio::io::duplex(64);
                Ok(Box::new(a) as Box<dyn TcpConn>)
            })
        });
        assert!(outbound.dial_tcp(&Addr::new("x", 9)).await.is_ok());
        let err = outbound.dial_udp(&Addr::new("x", 9)).await.err().unwrap();
        assert!(matches!(
            err,
            BypassError::Dial {
                kind: DialErrorKind::Unsupported,
                ..
            }
        ));
    }
}
