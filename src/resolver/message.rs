//! DNS wire format (RFC 1035): query building and answer extraction.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use super::edns::ClientSubnet;
use crate::error::{BypassError, ProtocolErrorKind, Result};

const HEADER_LEN: usize = 12;
const CLASS_IN: u16 = 1;
const FLAG_QR: u8 = 0x80;
const FLAG_RD: u8 = 0x01;
const MAX_POINTER_JUMPS: usize = 32;
const MAX_LABEL_LEN: usize = 63;

/// Record types this resolver asks for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RecordType {
    A,
    Aaaa,
}

impl RecordType {
    pub fn code(self) -> u16 {
        match self {
            RecordType::A => 1,
            RecordType::Aaaa => 28,
        }
    }

    /// Name used by the DoH JSON API `type` parameter.
    pub fn as_str(self) -> &'static str {
        match self {
            RecordType::A => "A",
            RecordType::Aaaa => "AAAA",
        }
    }
}

/// An encoded query together with what is needed to validate its answer.
#[derive(Debug, Clone)]
pub struct Query {
    id: u16,
    domain: String,
    record_type: RecordType,
    bytes: Vec<u8>,
}

impl Query {
    pub fn id(&self) -> u16 {
        self.id
    }

    pub fn domain(&self) -> &str {
        &self.domain
    }

    pub fn record_type(&self) -> RecordType {
        self.record_type
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }
}

/// Addresses extracted from a response.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Response {
    pub addresses: Vec<IpAddr>,
    /// Smallest TTL among the returned address records.
    pub min_ttl: Option<u32>,
}

/// Build a recursive query with a random id.
pub fn build_query(
    domain: &str,
    record_type: RecordType,
    subnet: Option<&ClientSubnet>,
) -> Result<Query> {
    build_query_with_id(rand::random(), domain, record_type, subnet)
}

pub(crate) fn build_query_with_id(
    id: u16,
    domain: &str,
    record_type: RecordType,
    subnet: Option<&ClientSubnet>,
) -> Result<Query> {
    let domain = domain.trim_end_matches('.');
    if domain.is_empty() {
        return Err(BypassError::InvalidAddress("empty domain".into()));
    }

    let mut bytes = Vec::with_capacity(HEADER_LEN + domain.len() + 2 + 4 + 23);
    bytes.extend_from_slice(&id.to_be_bytes());
    bytes.push(FLAG_RD);
    bytes.push(0);
    bytes.extend_from_slice(&1u16.to_be_bytes()); // QDCOUNT
    bytes.extend_from_slice(&0u16.to_be_bytes()); // ANCOUNT
    bytes.extend_from_slice(&0u16.to_be_bytes()); // NSCOUNT
    bytes.extend_from_slice(&u16::from(subnet.is_some()).to_be_bytes());

    write_name(&mut bytes, domain)?;
    bytes.extend_from_slice(&record_type.code().to_be_bytes());
    bytes.extend_from_slice(&CLASS_IN.to_be_bytes());

    if let Some(subnet) = subnet {
        bytes.extend_from_slice(&subnet.opt_record());
    }

    Ok(Query {
        id,
        domain: domain.to_ascii_lowercase(),
        record_type,
        bytes,
    })
}

fn write_name(out: &mut Vec<u8>, domain: &str) -> Result<()> {
    for label in domain.split('.') {
        if label.is_empty() || label.len() > MAX_LABEL_LEN {
            return Err(BypassError::InvalidAddress(format!(
                "invalid label in domain: {}",
                domain
            )));
        }
        out.push(label.len() as u8);
        out.extend_from_slice(label.as_bytes());
    }
    out.push(0);
    Ok(())
}

/// Validate a response against its query and collect A/AAAA answers.
pub fn parse_response(query: &Query, buf: &[u8]) -> Result<Response> {
    let mut r = Reader::new(buf);

    let id = r.u16()?;
    if id != query.id {
        return Err(BypassError::protocol(
            ProtocolErrorKind::IdMismatch,
            format!("id mismatch: sent {}, got {}", query.id, id),
        ));
    }

    let flags_hi = r.u8()?;
    let flags_lo = r.u8()?;
    if flags_hi & FLAG_QR == 0 {
        return Err(BypassError::protocol(
            ProtocolErrorKind::NotResponse,
            "message is not a response",
        ));
    }
    let rcode = flags_lo & 0x0f;
    if rcode != 0 {
        let kind = ProtocolErrorKind::from_rcode(rcode);
        return Err(BypassError::protocol(kind, rcode_message(kind)));
    }

    let qdcount = r.u16()?;
    let ancount = r.u16()?;
    r.skip(4)?; // NSCOUNT, ARCOUNT

    for _ in 0..qdcount {
        r.name()?;
        r.skip(4)?;
    }

    let mut response = Response::default();
    for _ in 0..ancount {
        r.name()?;
        let rtype = r.u16()?;
        let _class = r.u16()?;
        let ttl = r.u32()?;
        let rdlen = r.u16()? as usize;
        let rdata = r.bytes(rdlen)?;

        let addr = match (rtype, rdlen) {
            (1, 4) => Some(IpAddr::V4(Ipv4Addr::new(
                rdata[0], rdata[1], rdata[2], rdata[3],
            ))),
            (28, 16) => {
                let mut octets = [0u8; 16];
                octets.copy_from_slice(rdata);
                Some(IpAddr::V6(Ipv6Addr::from(octets)))
            }
            _ => None,
        };
        if let Some(addr) = addr {
            response.addresses.push(addr);
            response.min_ttl = Some(response.min_ttl.map_or(ttl, |t| t.min(ttl)));
        }
    }

    Ok(response)
}

fn rcode_message(kind: ProtocolErrorKind) -> &'static str {
    match kind {
        ProtocolErrorKind::FormatError => "request format error",
        ProtocolErrorKind::ServerFailure => "dns server failure",
        ProtocolErrorKind::NameError => "no such name",
        ProtocolErrorKind::NotImplemented => "dns server does not support this request",
        ProtocolErrorKind::Refused => "dns server refused",
        _ => "reserved response code",
    }
}

struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    fn bytes(&mut self, n: usize) -> Result<&'a [u8]> {
        let end = self.pos.checked_add(n).filter(|&end| end <= self.buf.len());
        match end {
            Some(end) => {
                let out = &self.buf[self.pos..end];
                self.pos = end;
                Ok(out)
            }
            None => Err(truncated(self.pos)),
        }
    }

    fn skip(&mut self, n: usize) -> Result<()> {
        self.bytes(n).map(|_| ())
    }

    fn u8(&mut self) -> Result<u8> {
        Ok(self.bytes(1)?[0])
    }

    fn u16(&mut self) -> Result<u16> {
        let b = self.bytes(2)?;
        Ok(u16::from_be_bytes([b[0], b[1]]))
    }

    fn u32(&mut self) -> Result<u32> {
        let b = self.bytes(4)?;
        Ok(u32::from_be_bytes([b[0], b[1], b[2], b[3]]))
    }

    /// Read a possibly compressed name, leaving the cursor after it.
    fn name(&mut self) -> Result<String> {
        let mut labels: Vec<&str> = Vec::new();
        let mut pos = self.pos;
        let mut resume = None;
        let mut jumps = 0;

        loop {
            let len = *self.buf.get(pos).ok_or_else(|| truncated(pos))? as usize;
            match len & 0xc0 {
                0x00 => {
                    pos += 1;
                    if len == 0 {
                        break;
                    }
                    let label = self
                        .buf
                        .get(pos..pos + len)
                        .ok_or_else(|| truncated(pos))?;
                    labels.push(std::str::from_utf8(label).map_err(|_| {
                        BypassError::protocol(ProtocolErrorKind::Malformed, "non-utf8 label")
                    })?);
                    pos += len;
                }
                0xc0 => {
                    let lo = *self.buf.get(pos + 1).ok_or_else(|| truncated(pos + 1))? as usize;
                    jumps += 1;
                    if jumps > MAX_POINTER_JUMPS {
                        return Err(BypassError::protocol(
                            ProtocolErrorKind::Malformed,
                            "compression pointer loop",
                        ));
                    }
                    resume.get_or_insert(pos + 2);
                    pos = ((len & 0x3f) << 8) | lo;
                }
                _ => {
                    return Err(BypassError::protocol(
                        ProtocolErrorKind::Malformed,
                        format!("unsupported label type at offset {}", pos),
                    ));
                }
            }
        }

        self.pos = resume.unwrap_or(pos);
        Ok(labels.join("."))
    }
}

fn truncated(offset: usize) -> BypassError {
    BypassError::protocol(
        ProtocolErrorKind::Truncated,
        format!("message truncated at offset {}", offset),
    )
}

/// Encode a response for a query. Used by loopback test servers.
#[cfg(test)]
pub(crate) fn encode_response(query: &[u8], addresses: &[IpAddr], ttl: u32) -> Vec<u8> {
    // Header + question as sent, without additional records.
    let mut qend = HEADER_LEN;
    while query[qend] != 0 {
        qend += query[qend] as usize + 1;
    }
    qend += 5;

    let mut out = Vec::new();
    out.extend_from_slice(&query[..2]);
    out.push(FLAG_QR | FLAG_RD);
    out.push(0x80);
    out.extend_from_slice(&1u16.to_be_bytes());
    out.extend_from_slice(&(addresses.len() as u16).to_be_bytes());
    out.extend_from_slice(&[0, 0, 0, 0]);
    out.extend_from_slice(&query[HEADER_LEN..qend]);
    for addr in addresses {
        out.extend_from_slice(&[0xc0, HEADER_LEN as u8]);
        let (rtype, data) = match addr {
            IpAddr::V4(v4) => (1u16, v4.octets().to_vec()),
            IpAddr::V6(v6) => (28u16, v6.octets().to_vec()),
        };
        out.extend_from_slice(&rtype.to_be_bytes());
        out.extend_from_slice(&CLASS_IN.to_be_bytes());
        out.extend_from_slice(&ttl.to_be_bytes());
        out.extend_from_slice(&(data.len() as u16).to_be_bytes());
        out.extend_from_slice(&data);
    }
    out
}
