//! Bypass Engine - rule-driven routing core for a local proxy client
//!
//! This library decides, per outbound request, whether to connect directly,
//! refuse, or tunnel through an upstream proxy dialer:
//! - CIDR matching (bitwise trie, IPv4 and IPv6)
//! - Domain matching (exact and leading wildcard)
//! - DNS fallback for domains without a rule (UDP, TCP, DoH, DoT, EDNS client subnet)
//! - LRU caching of decisions and DNS answers
//! - Traffic accounting and bidirectional relaying
//!
//! # Example
//!
//! ```rust
//! use bypass_engine_r::{Category, Mark, RuleMapper};
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() {
//! let mapper = RuleMapper::new(1024);
//! mapper.load_rules(
//!     "
//! # private networks
//! 10.0.0.0/8 direct
//! *.google.com proxy
//! ads.example.com block
//! ",
//! );
//!
//! let decision = mapper.search("10.1.2.3").await;
//! assert_eq!(decision.mark, Some(Mark::Direct));
//! assert_eq!(decision.category, Category::Ip);
//!
//! let decision = mapper.search("www.google.com").await;
//! assert_eq!(decision.mark, Some(Mark::Proxy));
//! # }
//! ```
//!
//! # Rule Syntax
//!
//! One rule per line:
//! ```text
//! <pattern> <mode>
//! ```
//!
//! | Pattern | Example | Description |
//! |---------|---------|-------------|
//! | IP | `1.2.3.4` | Single IP address |
//! | CIDR | `192.168.0.0/16` | CIDR range |
//! | Domain | `example.com` | Exact domain match |
//! | Wildcard | `*.example.com` | Any subdomain, not the domain itself |
//!
//! | Mode | Effect |
//! |------|--------|
//! | `direct` | Connect from the local network |
//! | `proxy` | Tunnel through the upstream |
//! | `block` | Refuse the connection |
//! | `ip` | Tunnel through the upstream |
//! | `ipdirect` | Connect from the local network |
//!
//! Lines starting with `#` are comments.

pub mod config;
pub mod error;
pub mod mapper;
pub mod matcher;
pub mod outbound;
pub mod parser;
pub mod relay;
pub mod resolver;
pub mod router;
pub mod stats;
pub mod types;

// Re-export commonly used items
pub use config::{DispatcherOptions, DnsConfig, DnsKind, DEFAULT_DECISION_CACHE_SIZE};
pub use error::{BypassError, DialErrorKind, ProtocolErrorKind, Result};
pub use mapper::RuleMapper;
pub use matcher::{CidrMatcher, DomainMatcher};
pub use parser::{parse_rules, parse_rules_from_file, DEFAULT_RULES};
pub use types::{Category, Decision, Mark, TextRule};

// Re-export outbound types
pub use outbound::{
    Addr, DialFuture, Direct, DirectOptions, FnOutbound, Outbound, Reject, TcpConn, UdpConn,
    DEFAULT_DIALER_TIMEOUT,
};

// Re-export resolver types
pub use resolver::{
    build_resolver, CachedResolver, NilResolver, Resolver, StaticResolver, SystemResolver,
};

// Re-export dispatcher and accounting types
pub use relay::{relay, BufferPool, RelayStats};
pub use router::Dispatcher;
pub use stats::{ConnectionSnapshot, Network, Statistics, TrackedConn, TrackedUdpConn};

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_full_workflow() {
        let rules_text = r#"
# Direct connection for private networks
192.168.0.0/16 direct
10.0.0.0/8 direct

# Proxy for specific domains
*.google.com proxy
youtube.com proxy

# Block trackers
tracker.example.com block
"#;

        let rules = parse_rules(rules_text);
        assert_eq!(rules.len(), 5);

        let mapper = RuleMapper::new(1024);
        assert_eq!(mapper.load_rules(rules_text), 5);

        // Private IP -> direct
        let decision = mapper.search("192.168.1.1").await;
        assert_eq!(decision, Decision::new(Some(Mark::Direct), Category::Ip));

        // Google -> proxy
        assert_eq!(mapper.search("www.google.com").await.mark, Some(Mark::Proxy));

        // The wildcard does not cover the bare domain
        assert!(!mapper.search("google.com").await.is_match());

        // Tracker -> block
        assert_eq!(
            mapper.search("tracker.example.com").await.mark,
            Some(Mark::Block)
        );

        // Unknown -> no decision, left to the dispatcher's upstream
        let decision = mapper.search("unknown.com").await;
        assert_eq!(decision, Decision::new(None, Category::Domain));
    }
}
