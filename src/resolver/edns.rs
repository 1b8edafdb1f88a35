//! EDNS0 client subnet option (RFC 7871) carried in an OPT pseudo-record (RFC 6891).

use std::net::IpAddr;

use ipnet::IpNet;

use crate::error::Result;
use crate::matcher::parse_net;

const OPT_TYPE: u16 = 41;
const OPT_UDP_PAYLOAD: u16 = 4096;
const OPTION_CLIENT_SUBNET: u16 = 8;
const FAMILY_V4: u16 = 1;
const FAMILY_V6: u16 = 2;

/// Subnet announced to the upstream resolver.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClientSubnet {
    net: IpNet,
}

impl ClientSubnet {
    pub fn new(net: IpNet) -> Self {
        Self { net: net.trunc() }
    }

    /// Parse `1.2.3.0/24`, or a bare address as a full-length prefix.
    pub fn parse(s: &str) -> Result<Self> {
        parse_net(s).map(Self::new)
    }

    pub fn net(&self) -> IpNet {
        self.net
    }

    /// Raw option bytes: code, length, family, source prefix, scope prefix, address.
    pub fn option_bytes(&self) -> Vec<u8> {
        let prefix = self.net.prefix_len();
        let (family, octets) = match self.net.network() {
            IpAddr::V4(v4) => (FAMILY_V4, v4.octets().to_vec()),
            IpAddr::V6(v6) => (FAMILY_V6, v6.octets().to_vec()),
        };
        let addr_len = (prefix as usize).div_ceil(8);
        let data_len = 4 + addr_len;

        let mut out = Vec::with_capacity(4 + data_len);
        out.extend_from_slice(&OPTION_CLIENT_SUBNET.to_be_bytes());
        out.extend_from_slice(&(data_len as u16).to_be_bytes());
        out.extend_from_slice(&family.to_be_bytes());
        out.push(prefix);
        out.push(0);
        out.extend_from_slice(&octets[..addr_len]);
        out
    }

    /// Full OPT resource record, ready to append to the additional section.
    pub fn opt_record(&self) -> Vec<u8> {
        let option = self.option_bytes();
        let mut out = Vec::with_capacity(11 + option.len());
        out.push(0); // root name
        out.extend_from_slice(&OPT_TYPE.to_be_bytes());
        out.extend_from_slice(&OPT_UDP_PAYLOAD.to_be_bytes());
        out.extend_from_slice(&[0, 0, 0, 0]); // extended rcode, version, flags
        out.extend_from_slice(&(option.len() as u16).to_be_bytes());
        out.extend_from_slice(&option);
        out
    }
}
