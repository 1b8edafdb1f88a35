//! Length-prefixed DNS over a byte stream (RFC 1035 §4.2.2), shared by TCP and DoT.

use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::debug;

use super::edns::ClientSubnet;
use super::message::{build_query, parse_response, RecordType};
use super::{lookup_all, Resolver};
use crate::error::{BypassError, Result};
use crate::outbound::{Addr, Outbound};

/// Default timeout for a stream exchange.
pub const DEFAULT_STREAM_TIMEOUT: Duration = Duration::from_secs(5);
const DEFAULT_PORT: u16 = 53;

/// Write one framed message and read one framed reply.
pub(crate) async fn exchange<S>(stream: &mut S, query: &[u8]) -> Result<Vec<u8>>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let len = u16::try_from(query.len())
        .map_err(|_| BypassError::ResolveError("DNS query too large".into()))?;

    let mut frame = Vec::with_capacity(2 + query.len());
    frame.extend_from_slice(&len.to_be_bytes());
    frame.extend_from_slice(query);
    stream.write_all(&frame).await?;
    stream.flush().await?;

    let mut len_buf = [0u8; 2];
    stream.read_exact(&mut len_buf).await?;
    let mut reply = vec![0u8; u16::from_be_bytes(len_buf) as usize];
    stream.read_exact(&mut reply).await?;
    Ok(reply)
}

/// DNS over plain TCP, one connection per query.
pub struct TcpResolver {
    server: Addr,
    subnet: Option<ClientSubnet>,
    dialer: Arc<dyn Outbound>,
    ipv6: bool,
    timeout: Duration,
}

impl TcpResolver {
    /// `server` is `host[:port]`; the port defaults to 53.
    pub fn new(
        server: &str,
        subnet: Option<ClientSubnet>,
        dialer: Arc<dyn Outbound>,
    ) -> Result<Self> {
        Ok(Self {
            server: Addr::parse(server, DEFAULT_PORT)?,
            subnet,
            dialer,
            ipv6: false,
            timeout: DEFAULT_STREAM_TIMEOUT,
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

    async fn lookup(&self, host: &str, record_type: RecordType) -> Result<Vec<IpAddr>> {
        let query = build_query(host, record_type, self.subnet.as_ref())?;
        let reply = tokio::time::timeout(self.timeout, async {
            let mut conn = self.dialer.dial_tcp(&self.server).await?;
            exchange(&mut conn, query.as_bytes()).await
        })
        .await
        .map_err(|_| {
            BypassError::ResolveError(format!("TCP query to {} timed out", self.server))
        })??;
        Ok(parse_response(&query, &reply)?.addresses)
    }
}

#[async_trait]
impl Resolver for TcpResolver {
    async fn resolve(&self, host: &str) -> Result<Vec<IpAddr>> {
        if let Ok(ip) = host.parse::<IpAddr>() {
            return Ok(vec![ip]);
        }

        let ips = lookup_all(host, self.ipv6, |record_type| self.lookup(host, record_type)).await?;
        debug!(host, server = %self.server, count = ips.len(), "tcp lookup");
        Ok(ips)
    }
}
