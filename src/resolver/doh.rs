//! DNS over HTTPS (RFC 8484 wire format, and the JSON API).

use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use http_body_util::{BodyExt, Full};
use hyper::body::Bytes;
use hyper::header::{ACCEPT, CONTENT_TYPE, HOST};
use hyper::{Method, Request, StatusCode};
use hyper_util::rt::TokioIo;
use serde::Deserialize;
use tokio::io::{AsyncRead, AsyncWrite};
use tracing::debug;

use super::edns::ClientSubnet;
use super::message::{build_query, parse_response, RecordType};
use super::{lookup_all, tls, Resolver};
use crate::error::{BypassError, ProtocolErrorKind, Result};
use crate::outbound::{Addr, Outbound};

/// Default timeout for a DoH request.
pub const DEFAULT_DOH_TIMEOUT: Duration = Duration::from_secs(10);
const DEFAULT_PATH: &str = "/dns-query";
const DNS_MESSAGE: &str = "application/dns-message";
const DNS_JSON: &str = "application/dns-json";

/// Request encoding.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DohFormat {
    /// `GET ?dns=<base64url>`
    WireGet,
    /// `POST` with an `application/dns-message` body
    WirePost,
    /// `GET ?name=..&type=..` returning JSON
    Json,
}

/// DNS over HTTPS client. Each query opens its own connection through the dialer.
pub struct DohResolver {
    server: Addr,
    path: String,
    tls: bool,
    format: DohFormat,
    subnet: Option<ClientSubnet>,
    dialer: Arc<dyn Outbound>,
    ipv6: bool,
    timeout: Duration,
}

#[derive(Debug, Deserialize)]
struct JsonResponse {
    #[serde(rename = "Status")]
    status: u8,
    #[serde(rename = "Answer", default)]
    answer: Vec<JsonAnswer>,
}

#[derive(Debug, Deserialize)]
struct JsonAnswer {
    #[serde(rename = "type")]
    record_type: u16,
    data: String,
}

impl DohResolver {
    /// `server` is a URL such as `https://dns.google/dns-query`, or a bare
    /// `host[:port][/path]` which implies https. The path defaults to `/dns-query`.
    pub fn new(
        server: &str,
        format: DohFormat,
        subnet: Option<ClientSubnet>,
        dialer: Arc<dyn Outbound>,
    ) -> Result<Self> {
        let server = server.trim();
        let (tls, rest) = if let Some(rest) = server.strip_prefix("https://") {
            (true, rest)
        } else if let Some(rest) = server.strip_prefix("http://") {
            (false, rest)
        } else {
            (true, server)
        };
        let (authority, path) = match rest.find('/') {
            Some(i) => (&rest[..i], &rest[i..]),
            None => (rest, DEFAULT_PATH),
        };
        let path = if path == "/" { DEFAULT_PATH } else { path };

        Ok(Self {
            server: Addr::parse(authority, if tls { 443 } else { 80 })?,
            path: path.to_string(),
            tls,
            format,
            subnet,
            dialer,
            ipv6: false,
            timeout: DEFAULT_DOH_TIMEOUT,
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

    fn authority(&self) -> String {
        let default_port = if self.tls { 443 } else { 80 };
        if self.server.port != default_port {
            self.server.to_string()
        } else if self.server.host.contains(':') {
            format!("[{}]", self.server.host)
        } else {
            self.server.host.clone()
        }
    }

    fn request(
        &self,
        method: Method,
        uri: String,
        accept: &str,
        body: Vec<u8>,
    ) -> Result<Request<Full<Bytes>>> {
        let mut builder = Request::builder()
            .method(method)
            .uri(uri)
            .header(HOST, self.authority())
            .header(ACCEPT, accept);
        if !body.is_empty() {
            builder = builder.header(CONTENT_TYPE, DNS_MESSAGE);
        }
        builder
            .body(Full::new(Bytes::from(body)))
            .map_err(|e| http_error(format!("invalid request: {}", e)))
    }

    async fn send(&self, req: Request<Full<Bytes>>) -> Result<Bytes> {
        let tcp = self.dialer.dial_tcp(&self.server).await?;
        if self.tls {
            let stream = tls::connect(&self.server.host, tcp, &[&b"http/1.1"[..]]).await?;
            send_over(stream, req).await
        } else {
            send_over(tcp, req).await
        }
    }

    async fn lookup(&self, host: &str, record_type: RecordType) -> Result<Vec<IpAddr>> {
        match self.format {
            DohFormat::WireGet | DohFormat::WirePost => {
                let query = build_query(host, record_type, self.subnet.as_ref())?;
                let req = if self.format == DohFormat::WireGet {
                    let encoded = URL_SAFE_NO_PAD.encode(query.as_bytes());
                    let uri = format!("{}?dns={}", self.path, encoded);
                    self.request(Method::GET, uri, DNS_MESSAGE, Vec::new())?
                } else {
                    self.request(
                        Method::POST,
                        self.path.clone(),
                        DNS_MESSAGE,
                        query.as_bytes().to_vec(),
                    )?
                };
                let body = self.send(req).await?;
                Ok(parse_response(&query, &body)?.addresses)
            }
            DohFormat::Json => {
                let mut uri = format!(
                    "{}?name={}&type={}",
                    self.path,
                    host,
                    record_type.as_str()
                );
                if let Some(subnet) = &self.subnet {
                    uri.push_str(&format!("&edns_client_subnet={}", subnet.net()));
                }
                let req = self.request(Method::GET, uri, DNS_JSON, Vec::new())?;
                let body = self.send(req).await?;
                parse_json(&body, record_type)
            }
        }
    }
}

async fn send_over<IO>(io: IO, req: Request<Full<Bytes>>) -> Result<Bytes>
where
    IO: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let (mut sender, conn) = hyper::client::conn::http1::handshake(TokioIo::new(io))
        .await
        .map_err(|e| http_error(format!("handshake failed: {}", e)))?;
    tokio::spawn(async move {
        if let Err(e) = conn.await {
            debug!(error = %e, "DoH connection closed");
        }
    });

    let resp = sender
        .send_request(req)
        .await
        .map_err(|e| http_error(format!("request failed: {}", e)))?;
    if resp.status() != StatusCode::OK {
        return Err(http_error(format!("unexpected status {}", resp.status())));
    }
    let body = resp
        .into_body()
        .collect()
        .await
        .map_err(|e| http_error(format!("reading body failed: {}", e)))?;
    Ok(body.to_bytes())
}

fn parse_json(body: &[u8], record_type: RecordType) -> Result<Vec<IpAddr>> {
    let resp: JsonResponse = serde_json::from_slice(body)
        .map_err(|e| http_error(format!("invalid JSON answer: {}", e)))?;
    if resp.status != 0 {
        let kind = ProtocolErrorKind::from_rcode(resp.status);
        return Err(BypassError::protocol(
            kind,
            format!("DoH status {}", resp.status),
        ));
    }
    Ok(resp
        .answer
        .iter()
        .filter(|a| a.record_type == record_type.code())
        .filter_map(|a| a.data.parse().ok())
        .collect())
}

fn http_error(message: String) -> BypassError {
    BypassError::protocol(ProtocolErrorKind::Http, message)
}

#[async_trait]
impl Resolver for DohResolver {
    async fn resolve(&self, host: &str) -> Result<Vec<IpAddr>> {
        if let Ok(ip) = host.parse::<IpAddr>() {
            return Ok(vec![ip]);
        }

        let ips = lookup_all(host, self.ipv6, |record_type| async move {
            tokio::time::timeout(self.timeout, self.lookup(host, record_type))
                .await
                .map_err(|_| {
                    BypassError::ResolveError(format!("DoH query to {} timed out", self.server))
                })?
        })
        .await?;
        debug!(host, server = %self.server, count = ips.len(), "doh lookup");
        Ok(ips)
    }
}
