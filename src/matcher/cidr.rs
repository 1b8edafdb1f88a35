use std::net::IpAddr;

use ipnet::IpNet;

use crate::error::{BypassError, Result};
use crate::types::Mark;

#[derive(Debug, Clone, Default)]
struct Node {
    terminal: bool,
    mark: Option<Mark>,
    children: [Option<Box<Node>>; 2],
}

impl Node {
    fn child_mut(&mut self, bit: usize) -> &mut Node {
        self.children[bit].get_or_insert_with(Box::default)
    }

    fn child(&self, bit: usize) -> Option<&Node> {
        self.children[bit].as_deref()
    }

    fn terminate(&mut self, mark: Mark) {
        self.terminal = true;
        self.mark = Some(mark);
        self.children = [Some(Box::default()), Some(Box::default())];
    }
}

/// Bit at position `index` (0 = most significant) of a big-endian address.
#[inline]
fn bit_at(octets: &[u8], index: usize) -> usize {
    ((octets[index / 8] >> (7 - index % 8)) & 1) as usize
}

/// Binary trie over network prefixes.
///
/// Descent stops at the first terminal node, both when inserting and when
/// searching. Inserting a prefix that covers an existing, longer one
/// therefore resets the longer one's subtree, and inserting a longer prefix
/// under an existing terminal node overwrites that node's mark.
#[derive(Debug, Clone, Default)]
struct Trie {
    root: Node,
}

impl Trie {
    fn insert(&mut self, octets: &[u8], prefix_len: usize, mark: Mark) {
        if prefix_len == 0 {
            self.root.terminate(mark);
            return;
        }

        let mut node = &mut self.root;
        for i in 0..prefix_len.min(octets.len() * 8) {
            node = node.child_mut(bit_at(octets, i));
            if node.terminal || i + 1 == prefix_len {
                node.terminate(mark);
                return;
            }
        }
    }

    fn search(&self, octets: &[u8]) -> Option<Mark> {
        if self.root.terminal {
            return self.root.mark;
        }

        let mut node = &self.root;
        for i in 0..octets.len() * 8 {
            node = node.child(bit_at(octets, i))?;
            if node.terminal {
                return node.mark;
            }
        }
        None
    }
}

/// CIDR matcher with separate IPv4 and IPv6 tries.
#[derive(Debug, Clone, Default)]
pub struct CidrMatcher {
    v4: Trie,
    v6: Trie,
    len: usize,
}

impl CidrMatcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a CIDR literal. A bare IP address is treated as a host route.
    pub fn insert(&mut self, cidr: &str, mark: Mark) -> Result<()> {
        let net = parse_net(cidr)?;
        self.insert_net(net, mark);
        Ok(())
    }

    /// Insert a parsed network.
    pub fn insert_net(&mut self, net: IpNet, mark: Mark) {
        let prefix = net.prefix_len() as usize;
        match net.network() {
            IpAddr::V4(v4) => self.v4.insert(&v4.octets(), prefix, mark),
            IpAddr::V6(v6) => self.v6.insert(&v6.octets(), prefix, mark),
        }
        self.len += 1;
    }

    /// Search an IP string. Unparseable input never matches.
    pub fn search(&self, ip: &str) -> Option<Mark> {
        let ip: IpAddr = ip.trim().parse().ok()?;
        self.search_ip(ip)
    }

    /// Search an address. IPv4-mapped IPv6 addresses are looked up in the IPv4 trie.
    pub fn search_ip(&self, ip: IpAddr) -> Option<Mark> {
        match ip {
            IpAddr::V4(v4) => self.v4.search(&v4.octets()),
            IpAddr::V6(v6) => match v6.to_ipv4_mapped() {
                Some(v4) => self.v4.search(&v4.octets()),
                None => self.v6.search(&v6.octets()),
            },
        }
    }

    /// Number of accepted insertions.
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

/// Parse a CIDR literal or a bare IP address.
pub(crate) fn parse_net(s: &str) -> Result<IpNet> {
    let s = s.trim();
    if let Ok(net) = s.parse::<IpNet>() {
        return Ok(net.trunc());
    }
    s.parse::<IpAddr>()
        .map(IpNet::from)
        .map_err(|_| BypassError::InvalidCidr(s.to_string()))
}
