//! In-memory LRU result cache with TTL and byte budget.
//! Key: request fingerprint. Bounded by entry count and total image bytes.

use crate::CacheSettings;
use lru::LruCache;
use parking_lot::Mutex;
use std::num::NonZeroUsize;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, warn};

struct CacheEntry {
    bytes: Vec<u8>,
    inserted_at: Instant,
}

struct CacheInner {
    entries: LruCache<String, CacheEntry>,
    current_bytes: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PutOutcome {
    Accepted,
    /// Storing would exceed the byte budget; the cache is left as it was.
    Rejected,
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct CacheStats {
    pub entries: usize,
    pub bytes: usize,
    pub max_entries: usize,
    pub max_bytes: usize,
}

pub struct ResultCache {
    inner: Mutex<CacheInner>,
    max_entries: usize,
    max_bytes: usize,
    ttl: Duration,
}

impl ResultCache {
    pub fn new(settings: &CacheSettings) -> Self {
        let capacity = NonZeroUsize::new(settings.max_entries).unwrap_or(NonZeroUsize::MIN);
        Self {
            inner: Mutex::new(CacheInner {
                entries: LruCache::new(capacity),
                current_bytes: 0,
            }),
            max_entries: capacity.get(),
            max_bytes: settings.max_bytes,
            ttl: settings.ttl,
        }
    }

    /// Look up a cached image. Expired entries are dropped and read as absent.
    pub fn get(&self, key: &str) -> Option<Vec<u8>> {
        let mut guard = self.inner.lock();
        let inner = &mut *guard;

        let expired = match inner.entries.get(key) {
            Some(entry) => entry.inserted_at.elapsed() >= self.ttl,
            None => return None,
        };

        if expired {
            if let Some(entry) = inner.entries.pop(key) {
                inner.current_bytes -= entry.bytes.len();
            }
            debug!("Cache entry expired");
            return None;
        }

        inner.entries.peek(key).map(|entry| entry.bytes.clone())
    }

    /// Store an image unless it would push the cache over its byte budget.
    pub fn put(&self, key: String, bytes: Vec<u8>) -> PutOutcome {
        let mut guard = self.inner.lock();
        let inner = &mut *guard;
        self.purge_expired_locked(inner);

        let replaced = inner.entries.peek(&key).map_or(0, |e| e.bytes.len());
        if inner.current_bytes - replaced + bytes.len() > self.max_bytes {
            warn!(
                "Cache full ({} of {} bytes used), not caching {} byte result",
                inner.current_bytes,
                self.max_bytes,
                bytes.len()
            );
            return PutOutcome::Rejected;
        }

        inner.current_bytes += bytes.len();
        let entry = CacheEntry {
            bytes,
            inserted_at: Instant::now(),
        };
        // push hands back either the replaced value or the evicted LRU entry
        if let Some((_, old)) = inner.entries.push(key, entry) {
            inner.current_bytes -= old.bytes.len();
        }

        PutOutcome::Accepted
    }

    pub fn purge_expired(&self) {
        let mut guard = self.inner.lock();
        self.purge_expired_locked(&mut guard);
    }

    fn purge_expired_locked(&self, inner: &mut CacheInner) {
        let expired: Vec<String> = inner
            .entries
            .iter()
            .filter(|(_, entry)| entry.inserted_at.elapsed() >= self.ttl)
            .map(|(key, _)| key.clone())
            .collect();

        for key in expired {
            if let Some(entry) = inner.entries.pop(&key) {
                inner.current_bytes -= entry.bytes.len();
            }
        }
    }

    pub fn len(&self) -> usize {
        self.inner.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn stats(&self) -> CacheStats {
        let inner = self.inner.lock();
        CacheStats {
            entries: inner.entries.len(),
            bytes: inner.current_bytes,
            max_entries: self.max_entries,
            max_bytes: self.max_bytes,
        }
    }
}
