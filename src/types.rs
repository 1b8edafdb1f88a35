use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{BypassError, Result};

/// Routing decision attached to a rule.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Mark {
    Direct,
    Proxy,
    Block,
    /// Resolve the domain before matching. Dispatched through the upstream.
    #[serde(rename = "ip")]
    IpOnly,
    /// Resolve the domain and dial the resolved address directly.
    #[serde(rename = "ipdirect")]
    IpDirect,
    Unknown,
}

impl Mark {
    /// Rule-file keyword for this mark.
    pub fn as_str(&self) -> &'static str {
        match self {
            Mark::Direct => "direct",
            Mark::Proxy => "proxy",
            Mark::Block => "block",
            Mark::IpOnly => "ip",
            Mark::IpDirect => "ipdirect",
            Mark::Unknown => "unknown",
        }
    }

    /// True for marks that bypass the upstream dialer.
    pub fn is_direct(&self) -> bool {
        matches!(self, Mark::Direct | Mark::IpDirect)
    }
}

impl fmt::Display for Mark {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Mark {
    type Err = BypassError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "direct" => Ok(Mark::Direct),
            "proxy" => Ok(Mark::Proxy),
            "block" => Ok(Mark::Block),
            "ip" => Ok(Mark::IpOnly),
            "ipdirect" => Ok(Mark::IpDirect),
            other => Err(BypassError::ParseError(format!("unknown mode: {}", other))),
        }
    }
}

/// Whether a lookup key was an IP literal or a domain name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Category {
    Ip,
    Domain,
}

/// Result of a rule mapper lookup. `mark` is `None` when nothing matched.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Decision {
    pub mark: Option<Mark>,
    pub category: Category,
}

impl Decision {
    pub fn new(mark: Option<Mark>, category: Category) -> Self {
        Self { mark, category }
    }

    pub fn is_match(&self) -> bool {
        self.mark.is_some()
    }
}

/// Parsed bypass rule line
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TextRule {
    /// CIDR, IP or domain pattern
    pub pattern: String,
    pub mark: Mark,
    /// Line number in the original text (for error reporting)
    pub line_num: usize,
}
