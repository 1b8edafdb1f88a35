use std::net::IpAddr;
use std::num::NonZeroUsize;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use lru::LruCache;
use parking_lot::Mutex;
use tracing::trace;

use super::Resolver;
use crate::error::Result;

/// Default lifetime of a cached answer.
pub const DEFAULT_CACHE_TTL: Duration = Duration::from_secs(10 * 60);
/// Default number of cached domains.
pub const DEFAULT_CACHE_CAPACITY: usize = 1024;

#[derive(Debug, Clone)]
struct Entry {
    ips: Vec<IpAddr>,
    /// `None` when the TTL reaches past the clock's range
    expires: Option<Instant>,
}

impl Entry {
    fn is_fresh(&self, now: Instant) -> bool {
        self.expires.map_or(true, |at| at > now)
    }
}

/// Wraps a resolver with a per-domain answer cache.
///
/// Entries live for a fixed TTL and are dropped lazily: an expired entry is
/// removed by the lookup that finds it. Empty answers are not cached.
pub struct CachedResolver {
    inner: Arc<dyn Resolver>,
    cache: Mutex<LruCache<String, Entry>>,
    ttl: Duration,
}

impl CachedResolver {
    pub fn new(inner: Arc<dyn Resolver>) -> Self {
        Self {
            inner,
            cache: Mutex::new(LruCache::new(capacity(DEFAULT_CACHE_CAPACITY))),
            ttl: DEFAULT_CACHE_TTL,
        }
    }

    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = ttl;
        self
    }

    pub fn with_capacity(self, cap: usize) -> Self {
        self.cache.lock().resize(capacity(cap));
        self
    }

    /// Cached answer for `host`, if present and fresh.
    pub fn get(&self, host: &str) -> Option<Vec<IpAddr>> {
        let key = host.to_ascii_lowercase();
        let mut cache = self.cache.lock();
        match cache.get(&key) {
            Some(entry) if entry.is_fresh(Instant::now()) => Some(entry.ips.clone()),
            Some(_) => {
                trace!(host, "dns cache entry expired");
                cache.pop(&key);
                None
            }
            None => None,
        }
    }

    /// Number of stored entries, expired ones included.
    pub fn len(&self) -> usize {
        self.cache.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        self.cache.lock().clear();
    }
}

fn capacity(cap: usize) -> NonZeroUsize {
    NonZeroUsize::new(cap).unwrap_or(NonZeroUsize::MIN)
}

#[async_trait]
impl Resolver for CachedResolver {
    async fn resolve(&self, host: &str) -> Result<Vec<IpAddr>> {
        if let Some(ips) = self.get(host) {
            return Ok(ips);
        }

        let ips = self.inner.resolve(host).await?;
        if !ips.is_empty() {
            self.cache.lock().put(
                host.to_ascii_lowercase(),
                Entry {
                    ips: ips.clone(),
                    expires: Instant::now().checked_add(self.ttl),
                },
            );
        }
        Ok(ips)
    }
}
