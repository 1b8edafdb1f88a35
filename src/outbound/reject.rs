//! Reject outbound implementation.
//!
//! Refuses every connection with a blocked error.

use async_trait::async_trait;

use crate::error::{BypassError, Result};

use super::{Addr, Outbound, TcpConn, UdpConn};

/// Reject outbound that blocks all connections.
pub struct Reject;

impl Reject {
    /// Create a new Reject outbound.
    pub fn new() -> Self {
        Self
    }
}

impl Default for Reject {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Outbound for Reject {
    async fn dial_tcp(&self, addr: &Addr) -> Result<Box<dyn TcpConn>> {
        Err(BypassError::Blocked {
            host: addr.to_string(),
        })
    }

    async fn dial_udp(&self, addr: &Addr) -> Result<Box<dyn UdpConn>> {
        Err(BypassError::Blocked {
            host: addr.to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_reject_tcp() {
        let reject = Reject::new();
        let result = reject.dial_tcp(&Addr::new("example.com", 80)).await;
        match result {
            Err(e) => {
                assert!(e.is_blocked());
                assert!(e.to_string().contains("example.com:80"));
            }
            Ok(_) => panic!("Expected error"),
        }
    }

    #[tokio::test]
    async fn test_reject_udp() {
        let reject = Reject::new();
        let result = reject.dial_udp(&Addr::new("example.com", 53)).await;
        assert!(matches!(result, Err(BypassError::Blocked { .. })));
    }
}
