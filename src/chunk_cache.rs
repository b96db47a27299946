//! In-memory cache of fetched payloads

use crate::models::CacheKey;
use bytes::Bytes;
use moka::sync::Cache;
use std::time::Duration;

/// Bounded, TTL-driven payload cache keyed by [`CacheKey`]
///
/// Entries are only inserted after a fetch or disk read fully succeeded.
#[derive(Clone)]
pub struct ChunkCache {
    inner: Cache<String, Bytes>,
}

impl ChunkCache {
    pub fn new(max_entries: u64, ttl: Duration) -> Self {
        ChunkCache {
            inner: Cache::builder()
                .max_capacity(max_entries)
                .time_to_live(ttl)
                .build(),
        }
    }

    pub fn get(&self, key: &CacheKey) -> Option<Bytes> {
        self.inner.get(key.as_str())
    }

    pub fn insert(&self, key: &CacheKey, data: Bytes) {
        self.inner.insert(key.as_str().to_string(), data);
    }

    pub fn contains(&self, key: &CacheKey) -> bool {
        self.inner.contains_key(key.as_str())
    }

    pub fn entry_count(&self) -> u64 {
        self.inner.run_pending_tasks();
        self.inner.entry_count()
    }
}
