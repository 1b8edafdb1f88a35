use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Mutex;
use tokio_rustls::client::TlsStream;
use tracing::{debug, warn};

use super::edns::ClientSubnet;
use super::message::{build_query, parse_response, RecordType};
use super::stream::{exchange, DEFAULT_STREAM_TIMEOUT};
use super::{lookup_all, tls, Resolver};
use crate::error::{BypassError, Result};
use crate::outbound::{Addr, Outbound, TcpConn};

const DEFAULT_PORT: u16 = 853;

/// DNS over TLS with one persistent connection.
///
/// Queries are serialized over the shared stream. A failed exchange drops
/// the stream and is retried once on a fresh connection.
pub struct DotResolver {
    server: Addr,
    server_name: String,
    subnet: Option<ClientSubnet>,
    dialer: Arc<dyn Outbound>,
    ipv6: bool,
    timeout: Duration,
    conn: Mutex<Option<TlsStream<Box<dyn TcpConn>>>>,
}

impl DotResolver {
    /// `server` is `host[:port]`; the port defaults to 853. The host is also
    /// the TLS server name.
    pub fn new(
        server: &str,
        subnet: Option<ClientSubnet>,
        dialer: Arc<dyn Outbound>,
    ) -> Result<Self> {
        let server = Addr::parse(server, DEFAULT_PORT)?;
        Ok(Self {
            server_name: server.host.clone(),
            server,
            subnet,
            dialer,
            ipv6: false,
            timeout: DEFAULT_STREAM_TIMEOUT,
            conn: Mutex::new(None),
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

    /// Override the TLS server name when dialing by IP.
    pub fn with_server_name(mut self, name: impl Into<String>) -> Self {
        self.server_name = name.into();
        self
    }

    async fn connect(&self) -> Result<TlsStream<Box<dyn TcpConn>>> {
        let tcp = self.dialer.dial_tcp(&self.server).await?;
        tls::connect(&self.server_name, tcp, &[&b"dot"[..]]).await
    }

    async fn round_trip(&self, query: &[u8]) -> Result<Vec<u8>> {
        let mut guard = self.conn.lock().await;

        for attempt in 0..2 {
            let mut stream = match guard.take() {
                Some(stream) => stream,
                None => self.connect().await?,
            };
            match exchange(&mut stream, query).await {
                Ok(reply) => {
                    *guard = Some(stream);
                    return Ok(reply);
                }
                Err(e) if attempt == 0 => {
                    warn!(server = %self.server, error = %e, "DoT exchange failed, reconnecting");
                }
                Err(e) => return Err(e),
            }
        }
        Err(BypassError::ResolveError(format!(
            "DoT exchange with {} failed",
            self.server
        )))
    }

    async fn lookup(&self, host: &str, record_type: RecordType) -> Result<Vec<IpAddr>> {
        let query = build_query(host, record_type, self.subnet.as_ref())?;
        let reply = tokio::time::timeout(self.timeout, self.round_trip(query.as_bytes()))
            .await
            .map_err(|_| {
                BypassError::ResolveError(format!("DoT query to {} timed out", self.server))
            })??;
        Ok(parse_response(&query, &reply)?.addresses)
    }
}

#[async_trait]
impl Resolver for DotResolver {
    async fn resolve(&self, host: &str) -> Result<Vec<IpAddr>> {
        if let Ok(ip) = host.parse::<IpAddr>() {
            return Ok(vec![ip]);
        }

        let ips = lookup_all(host, self.ipv6, |record_type| self.lookup(host, record_type)).await?;
        debug!(host, server = %self.server, count = ips.len(), "dot lookup");
        Ok(ips)
    }
}
