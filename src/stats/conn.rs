use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

use super::{ConnInfo, Hub};
use crate::error::Result;
use crate::outbound::{Addr, TcpConn, UdpConn};
use crate::types::Mark;

/// Stream connection counted by [`Statistics`](super::Statistics).
///
/// Reads count as download, writes as upload. Dropping it removes the
/// registry entry.
pub struct TrackedConn {
    inner: Box<dyn TcpConn>,
    info: Arc<ConnInfo>,
    hub: Arc<Hub>,
}

impl TrackedConn {
    pub(super) fn new(inner: Box<dyn TcpConn>, info: Arc<ConnInfo>, hub: Arc<Hub>) -> Self {
        Self { inner, info, hub }
    }

    pub fn id(&self) -> u64 {
        self.info.id
    }

    pub fn destination(&self) -> &str {
        &self.info.destination
    }

    pub fn mark(&self) -> Option<Mark> {
        self.info.mark
    }
}

impl AsyncRead for TrackedConn {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let before = buf.filled().len();
        let poll = Pin::new(&mut self.inner).poll_read(cx, buf);
        if let Poll::Ready(Ok(())) = poll {
            let n = buf.filled().len() - before;
            self.hub.on_read(&self.info, n);
        }
        poll
    }
}

impl AsyncWrite for TrackedConn {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let poll = Pin::new(&mut self.inner).poll_write(cx, buf);
        if let Poll::Ready(Ok(n)) = poll {
            self.hub.on_write(&self.info, n);
        }
        poll
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_shutdown(cx)
    }
}

impl TcpConn for TrackedConn {
    fn local_addr(&self) -> io::Result<SocketAddr> {
        self.inner.local_addr()
    }

    fn peer_addr(&self) -> io::Result<SocketAddr> {
        self.inner.peer_addr()
    }
}

impl Drop for TrackedConn {
    fn drop(&mut self) {
        self.hub.remove(self.info.id);
    }
}

impl std::fmt::Debug for TrackedConn {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TrackedConn")
            .field("id", &self.info.id)
            .field("destination", &self.info.destination)
            .field("mark", &self.info.mark)
            .finish()
    }
}

/// Packet connection counted by [`Statistics`](super::Statistics).
pub struct TrackedUdpConn {
    inner: Box<dyn UdpConn>,
    info: Arc<ConnInfo>,
    hub: Arc<Hub>,
}

impl TrackedUdpConn {
    pub(super) fn new(inner: Box<dyn UdpConn>, info: Arc<ConnInfo>, hub: Arc<Hub>) -> Self {
        Self { inner, info, hub }
    }

    pub fn id(&self) -> u64 {
        self.info.id
    }

    pub fn destination(&self) -> &str {
        &self.info.destination
    }

    pub fn mark(&self) -> Option<Mark> {
        self.info.mark
    }
}

#[async_trait]
impl UdpConn for TrackedUdpConn {
    async fn read_from(&self, buf: &mut [u8]) -> Result<(usize, Addr)> {
        let (n, addr) = self.inner.read_from(buf).await?;
        self.hub.on_read(&self.info, n);
        Ok((n, addr))
    }

    async fn write_to(&self, buf: &[u8], addr: &Addr) -> Result<usize> {
        let n = self.inner.write_to(buf, addr).await?;
        self.hub.on_write(&self.info, n);
        Ok(n)
    }

    fn local_addr(&self) -> io::Result<SocketAddr> {
        self.inner.local_addr()
    }
}

impl Drop for TrackedUdpConn {
    fn drop(&mut self) {
        self.hub.remove(self.info.id);
    }
}

impl std::fmt::Debug for TrackedUdpConn {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TrackedUdpConn")
            .field("id", &self.info.id)
            .field("destination", &self.info.destination)
            .finish()
    }
}
