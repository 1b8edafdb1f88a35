//! Connection accounting.
//!
//! [`Statistics`] hands out [`TrackedConn`]/[`TrackedUdpConn`] wrappers that
//! count bytes per connection and feed the global download/upload totals.
//! Increments travel through one bounded queue per counter to an aggregator
//! task; when a queue is full the increment is added to the total in place.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::{mpsc, oneshot};
use tracing::trace;

use crate::types::Mark;

mod conn;

pub use conn::{TrackedConn, TrackedUdpConn};

/// Default depth of each counter queue
pub const DEFAULT_QUEUE_SIZE: usize = 1024;

enum Increment {
    Add(u64),
    Flush(oneshot::Sender<()>),
}

/// One global byte counter with its queue.
struct Counter {
    total: Arc<AtomicU64>,
    tx: Option<mpsc::Sender<Increment>>,
}

impl Counter {
    /// Spawns the aggregator on the current runtime, if there is one.
    /// Without a runtime every increment goes straight to the total.
    fn new(queue_size: usize) -> Self {
        let total = Arc::new(AtomicU64::new(0));
        let tx = tokio::runtime::Handle::try_current().ok().map(|handle| {
            let (tx, mut rx) = mpsc::channel(queue_size.max(1));
            let sink = total.clone();
            handle.spawn(async move {
                while let Some(increment) = rx.recv().await {
                    match increment {
                        Increment::Add(n) => {
                            sink.fetch_add(n, Ordering::Relaxed);
                        }
                        Increment::Flush(done) => {
                            let _ = done.send(());
                        }
                    }
                }
            });
            tx
        });
        Self { total, tx }
    }

    fn add(&self, n: u64) {
        if n == 0 {
            return;
        }
        let queued = match &self.tx {
            Some(tx) => tx.try_send(Increment::Add(n)).is_ok(),
            None => false,
        };
        if !queued {
            trace!(n, "counter queue unavailable, adding in place");
            self.total.fetch_add(n, Ordering::Relaxed);
        }
    }

    fn load(&self) -> u64 {
        self.total.load(Ordering::Relaxed)
    }

    async fn settle(&self) {
        let Some(tx) = &self.tx else {
            return;
        };
        let (done, wait) = oneshot::channel();
        if tx.send(Increment::Flush(done)).await.is_ok() {
            let _ = wait.await;
        }
    }
}

/// Transport of a tracked connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Network {
    Tcp,
    Udp,
}

/// Per-connection record kept in the registry.
#[derive(Debug)]
pub(crate) struct ConnInfo {
    id: u64,
    destination: String,
    mark: Option<Mark>,
    network: Network,
    read: AtomicU64,
    written: AtomicU64,
}

/// Point-in-time view of a live connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionSnapshot {
    pub id: u64,
    pub destination: String,
    /// Rule decision, `None` when no rule matched
    pub mark: Option<Mark>,
    pub network: Network,
    /// Bytes received from the remote
    pub read: u64,
    /// Bytes sent to the remote
    pub written: u64,
}

impl From<&ConnInfo> for ConnectionSnapshot {
    fn from(info: &ConnInfo) -> Self {
        Self {
            id: info.id,
            destination: info.destination.clone(),
            mark: info.mark,
            network: info.network,
            read: info.read.load(Ordering::Relaxed),
            written: info.written.load(Ordering::Relaxed),
        }
    }
}

pub(crate) struct Hub {
    download: Counter,
    upload: Counter,
    next_id: AtomicU64,
    conns: DashMap<u64, Arc<ConnInfo>>,
}

impl Hub {
    pub(crate) fn on_read(&self, info: &ConnInfo, n: usize) {
        info.read.fetch_add(n as u64, Ordering::Relaxed);
        self.download.add(n as u64);
    }

    pub(crate) fn on_write(&self, info: &ConnInfo, n: usize) {
        info.written.fetch_add(n as u64, Ordering::Relaxed);
        self.upload.add(n as u64);
    }

    pub(crate) fn remove(&self, id: u64) {
        if self.conns.remove(&id).is_some() {
            trace!(id, "connection unregistered");
        }
    }
}

/// Traffic statistics and live connection registry.
///
/// Cloning is cheap; clones share the same counters and registry.
#[derive(Clone)]
pub struct Statistics {
    hub: Arc<Hub>,
}

impl Statistics {
    /// Create a hub with the default queue depth.
    ///
    /// Call from within a Tokio runtime to get the queued counters; outside
    /// one the counters are updated in place.
    pub fn new() -> Self {
        Self::with_queue_size(DEFAULT_QUEUE_SIZE)
    }

    pub fn with_queue_size(queue_size: usize) -> Self {
        Self {
            hub: Arc::new(Hub {
                download: Counter::new(queue_size),
                upload: Counter::new(queue_size),
                next_id: AtomicU64::new(1),
                conns: DashMap::new(),
            }),
        }
    }

    fn register(&self, destination: &str, mark: Option<Mark>, network: Network) -> Arc<ConnInfo> {
        let id = self.hub.next_id.fetch_add(1, Ordering::Relaxed);
        let info = Arc::new(ConnInfo {
            id,
            destination: destination.to_string(),
            mark,
            network,
            read: AtomicU64::new(0),
            written: AtomicU64::new(0),
        });
        self.hub.conns.insert(id, info.clone());
        trace!(id, destination, "connection registered");
        info
    }

    /// Track a stream connection.
    pub fn wrap(
        &self,
        destination: &str,
        mark: Option<Mark>,
        conn: Box<dyn crate::outbound::TcpConn>,
    ) -> TrackedConn {
        let info = self.register(destination, mark, Network::Tcp);
        TrackedConn::new(conn, info, self.hub.clone())
    }

    /// Track a packet connection.
    pub fn wrap_packet(
        &self,
        destination: &str,
        mark: Option<Mark>,
        conn: Box<dyn crate::outbound::UdpConn>,
    ) -> TrackedUdpConn {
        let info = self.register(destination, mark, Network::Udp);
        TrackedUdpConn::new(conn, info, self.hub.clone())
    }

    /// Total bytes received from remotes.
    pub fn download(&self) -> u64 {
        self.hub.download.load()
    }

    /// Total bytes sent to remotes.
    pub fn upload(&self) -> u64 {
        self.hub.upload.load()
    }

    /// Wait until every increment queued before this call is in the totals.
    pub async fn settle(&self) {
        self.hub.download.settle().await;
        self.hub.upload.settle().await;
    }

    /// Live connections, ordered by id.
    pub fn connections(&self) -> Vec<ConnectionSnapshot> {
        let mut conns: Vec<ConnectionSnapshot> = self
            .hub
            .conns
            .iter()
            .map(|entry| ConnectionSnapshot::from(entry.value().as_ref()))
            .collect();
        conns.sort_by_key(|c| c.id);
        conns
    }

    /// Number of live connections.
    pub fn connection_count(&self) -> usize {
        self.hub.conns.len()
    }

    /// Forget a connection. Returns false when the id is unknown.
    ///
    /// The stream itself stays open until its owner drops it.
    pub fn close(&self, id: u64) -> bool {
        self.hub.conns.remove(&id).is_some()
    }
}

impl Default for Statistics {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for Statistics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Statistics")
            .field("download", &self.download())
            .field("upload", &self.upload())
            .field("connections", &self.connection_count())
            .finish()
    }
}
