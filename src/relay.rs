//! Bidirectional forwarding with pooled buffers.

use std::io;
use std::ops::{Deref, DerefMut};

use parking_lot::Mutex;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::Notify;
use tracing::debug;

/// Size of each relay buffer
pub const DEFAULT_BUFFER_SIZE: usize = 32 * 1024;

/// Number of idle buffers kept by default
pub const DEFAULT_POOL_CAPACITY: usize = 256;

/// Pool of fixed-size byte buffers.
///
/// Buffers are handed out as [`PooledBuffer`] guards and come back on drop.
/// Idle buffers beyond the pool capacity are freed.
#[derive(Debug)]
pub struct BufferPool {
    buffers: Mutex<Vec<Box<[u8]>>>,
    buffer_size: usize,
    capacity: usize,
}

impl BufferPool {
    pub fn new(buffer_size: usize, capacity: usize) -> Self {
        Self {
            buffers: Mutex::new(Vec::with_capacity(capacity)),
            buffer_size: buffer_size.max(1),
            capacity,
        }
    }

    /// Take a buffer, allocating when the pool is empty.
    pub fn get(&self) -> PooledBuffer<'_> {
        let buf = self
            .buffers
            .lock()
            .pop()
            .unwrap_or_else(|| vec![0u8; self.buffer_size].into_boxed_slice());
        PooledBuffer {
            buf: Some(buf),
            pool: self,
        }
    }

    /// Number of idle buffers.
    pub fn available(&self) -> usize {
        self.buffers.lock().len()
    }

    pub fn buffer_size(&self) -> usize {
        self.buffer_size
    }

    fn put(&self, buf: Box<[u8]>) {
        let mut buffers = self.buffers.lock();
        if buffers.len() < self.capacity {
            buffers.push(buf);
        }
    }
}

impl Default for BufferPool {
    fn default() -> Self {
        Self::new(DEFAULT_BUFFER_SIZE, DEFAULT_POOL_CAPACITY)
    }
}

/// Buffer borrowed from a [`BufferPool`].
pub struct PooledBuffer<'a> {
    buf: Option<Box<[u8]>>,
    pool: &'a BufferPool,
}

impl Deref for PooledBuffer<'_> {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        self.buf.as_deref().unwrap_or_default()
    }
}

impl DerefMut for PooledBuffer<'_> {
    fn deref_mut(&mut self) -> &mut [u8] {
        self.buf.as_deref_mut().unwrap_or_default()
    }
}

impl Drop for PooledBuffer<'_> {
    fn drop(&mut self) {
        if let Some(buf) = self.buf.take() {
            self.pool.put(buf);
        }
    }
}

/// Bytes moved by [`relay`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RelayStats {
    /// Bytes read from `a` and written to `b`
    pub a_to_b: u64,
    /// Bytes read from `b` and written to `a`
    pub b_to_a: u64,
}

/// Copy bytes between `a` and `b` in both directions until both sides end.
///
/// EOF on one side shuts down the write side of the other. An error in one
/// direction stops the opposite direction as well.
pub async fn relay<A, B>(a: A, b: B, pool: &BufferPool) -> RelayStats
where
    A: AsyncRead + AsyncWrite,
    B: AsyncRead + AsyncWrite,
{
    let (mut a_read, mut a_write) = tokio::io::split(a);
    let (mut b_read, mut b_write) = tokio::io::split(b);
    let stop_a_to_b = Notify::new();
    let stop_b_to_a = Notify::new();

    let (a_to_b, b_to_a) = tokio::join!(
        pipe(&mut a_read, &mut b_write, pool, &stop_a_to_b, &stop_b_to_a),
        pipe(&mut b_read, &mut a_write, pool, &stop_b_to_a, &stop_a_to_b),
    );

    RelayStats {
        a_to_b: settle("a -> b", a_to_b),
        b_to_a: settle("b -> a", b_to_a),
    }
}

fn settle(direction: &str, result: (u64, io::Result<()>)) -> u64 {
    let (n, outcome) = result;
    if let Err(e) = outcome {
        debug!(direction, bytes = n, error = %e, "relay direction failed");
    }
    n
}

/// One copy loop. Returns the byte count and how the loop ended.
async fn pipe<R, W>(
    reader: &mut R,
    writer: &mut W,
    pool: &BufferPool,
    stop: &Notify,
    peer_stop: &Notify,
) -> (u64, io::Result<()>)
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buf = pool.get();
    let mut total = 0u64;

    loop {
        let read = tokio::select! {
            read = reader.read(&mut buf[..]) => read,
            _ = stop.notified() => return (total, Ok(())),
        };
        let n = match read {
            Ok(0) => {
                let _ = writer.shutdown().await;
                return (total, Ok(()));
            }
            Ok(n) => n,
            Err(e) => {
                peer_stop.notify_one();
                return (total, Err(e));
            }
        };

        let written = tokio::select! {
            written = writer.write_all(&buf[..n]) => written,
            _ = stop.notified() => return (total, Ok(())),
        };
        if let Err(e) = written {
            peer_stop.notify_one();
            return (total, Err(e));
        }
        total += n as u64;
    }
}
