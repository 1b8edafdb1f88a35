use std::net::{IpAddr, SocketAddr};
use std::time::Duration;

use async_trait::async_trait;
use tokio::net::UdpSocket;
use tracing::debug;

use super::edns::ClientSubnet;
use super::message::{build_query, parse_response, RecordType};
use super::{lookup_all, Resolver};
use crate::error::{BypassError, Result};
use crate::outbound::Addr;

/// Default timeout for a UDP exchange.
pub const DEFAULT_UDP_TIMEOUT: Duration = Duration::from_secs(5);
const DEFAULT_PORT: u16 = 53;
const MAX_UDP_MESSAGE: usize = 4096;

/// Plain DNS over UDP.
#[derive(Debug, Clone)]
pub struct UdpResolver {
    server: Addr,
    subnet: Option<ClientSubnet>,
    ipv6: bool,
    timeout: Duration,
}

impl UdpResolver {
    /// `server` is `host[:port]`; the port defaults to 53.
    pub fn new(server: &str, subnet: Option<ClientSubnet>) -> Result<Self> {
        Ok(Self {
            server: Addr::parse(server, DEFAULT_PORT)?,
            subnet,
            ipv6: false,
            timeout: DEFAULT_UDP_TIMEOUT,
        })
    }

    /// Also query AAAA records.
    pub fn with_ipv6(mut self, ipv6: bool) -> Self {
        self.ipv6 = ipv6;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    async fn server_addr(&self) -> Result<SocketAddr> {
        if let Some(sa) = self.server.socket_addr() {
            return Ok(sa);
        }
        tokio::net::lookup_host(self.server.to_string())
            .await?
            .next()
            .ok_or_else(|| {
                BypassError::ResolveError(format!("cannot resolve DNS server {}", self.server))
            })
    }

    async fn exchange(&self, server: SocketAddr, query: &[u8]) -> Result<Vec<u8>> {
        let bind: SocketAddr = if server.is_ipv4() {
            ([0u8; 4], 0).into()
        } else {
            ([0u16; 8], 0).into()
        };
        let socket = UdpSocket::bind(bind).await?;
        socket.connect(server).await?;
        socket.send(query).await?;

        let mut buf = vec![0u8; MAX_UDP_MESSAGE];
        let n = tokio::time::timeout(self.timeout, socket.recv(&mut buf))
            .await
            .map_err(|_| {
                BypassError::ResolveError(format!("UDP query to {} timed out", server))
            })??;
        buf.truncate(n);
        Ok(buf)
    }

    async fn lookup(&self, host: &str, record_type: RecordType) -> Result<Vec<IpAddr>> {
        let server = self.server_addr().await?;
        let query = build_query(host, record_type, self.subnet.as_ref())?;
        let reply = self.exchange(server, query.as_bytes()).await?;
        Ok(parse_response(&query, &reply)?.addresses)
    }
}

#[async_trait]
impl Resolver for UdpResolver {
    async fn resolve(&self, host: &str) -> Result<Vec<IpAddr>> {
        if let Ok(ip) = host.parse::<IpAddr>() {
            return Ok(vec![ip]);
        }

        let ips = lookup_all(host, self.ipv6, |record_type| self.lookup(host, record_type)).await?;
        debug!(host, server = %self.server, count = ips.len(), "udp lookup");
        Ok(ips)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resolver::message::encode_response;

    async fn fake_server(answer: Vec<IpAddr>) -> SocketAddr {
        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let addr = socket.local_addr().unwrap();
        tokio::spawn(async move {
            let mut buf = [0u8; 1024];
            while let Ok((n, peer)) = socket.recv_from(&mut buf).await {
                let reply = encode_response(&buf[..n], &answer, 60);
                let _ = socket.send_to(&reply, peer).await;
            }
        });
        addr
    }

    #[tokio::test]
    async fn test_udp_lookup_against_local_server() {
        let ip: IpAddr = "10.9.8.7".parse().unwrap();
        let server = fake_server(vec![ip]).await;

        let resolver = UdpResolver::new(&server.to_string(), None).unwrap();
        assert_eq!(resolver.resolve("example.com").await.unwrap(), vec![ip]);
    }

    #[tokio::test]
    async fn test_udp_with_subnet_still_parses() {
        let ip: IpAddr = "10.9.8.7".parse().unwrap();
        let server = fake_server(vec![ip]).await;

        let subnet = ClientSubnet::parse("1.2.3.0/24").unwrap();
        let resolver = UdpResolver::new(&server.to_string(), Some(subnet)).unwrap();
        assert_eq!(resolver.resolve("example.com").await.unwrap(), vec![ip]);
    }

    #[tokio::test]
    async fn test_udp_timeout() {
        // Bound but never answers.
        let silent = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let server = silent.local_addr().unwrap();

        let resolver = UdpResolver::new(&server.to_string(), None)
            .unwrap()
            .with_timeout(Duration::from_millis(100));
        let err = resolver.resolve("example.com").await.unwrap_err();
        assert!(matches!(err, BypassError::ResolveError(_)), "got {:?}", err);
    }

    #[tokio::test]
    async fn test_ip_literal_short_circuits() {
        let resolver = UdpResolver::new("127.0.0.1:1", None).unwrap();
        let ips = resolver.resolve("1.1.1.1").await.unwrap();
        assert_eq!(ips, vec!["1.1.1.1".parse::<IpAddr>().unwrap()]);
    }

    #[test]
    fn test_default_port() {
        let resolver = UdpResolver::new("8.8.8.8", None).unwrap();
        assert_eq!(resolver.server.port, 53);
    }
}
