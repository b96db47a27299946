//! Two-tier read-through caches for object stats and file records
//!
//! Lookups go through three levels:
//! - L1: a bounded in-process cache (moka) with a TTL
//! - L2: the shared cache tier, JSON-encoded values with their own TTL
//! - Origin: the remote store stat call or the metadata store lookup
//!
//! A hit at any level back-fills every faster level above it. L2 problems
//! (connection down, undecodable value) are logged and count as an L2 miss.

use crate::config::{MetadataConfig, StatCacheConfig};
use crate::error::{DownloadError, Result};
use crate::metadata_store::SharedFileRepository;
use crate::models::{FileRecord, ObjectStat};
use crate::origin::SharedObjectStore;
use crate::shared_cache::SharedCacheHandle;
use moka::sync::Cache;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tracing::{debug, warn};

/// Cache statistics
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TieredCacheStats {
    pub l1_entries: u64,
    pub l1_hits: u64,
    pub l2_hits: u64,
    pub misses: u64,
    pub l2_errors: u64,
}

#[derive(Default)]
struct StatCounters {
    l1_hits: AtomicU64,
    l2_hits: AtomicU64,
    misses: AtomicU64,
    l2_errors: AtomicU64,
}

/// Sizing of one two-tier cache
#[derive(Debug, Clone)]
pub struct TierSettings {
    /// Prefix of L2 keys, e.g. `stat:`
    pub l2_prefix: &'static str,
    pub l1_max_entries: u64,
    pub l1_ttl: Duration,
    pub l2_ttl: Duration,
}

/// Generic two-tier read-through cache
pub struct TwoTierCache<V> {
    name: &'static str,
    l1: Cache<String, V>,
    l2: SharedCacheHandle,
    settings: TierSettings,
    stats: StatCounters,
}

impl<V> TwoTierCache<V>
where
    V: Clone + Serialize + DeserializeOwned + Send + Sync + 'static,
{
    pub fn new(name: &'static str, l2: SharedCacheHandle, settings: TierSettings) -> Self {
        let l1 = Cache::builder()
            .max_capacity(settings.l1_max_entries)
            .time_to_live(settings.l1_ttl)
            .build();

        TwoTierCache {
            name,
            l1,
            l2,
            settings,
            stats: StatCounters::default(),
        }
    }

    fn l2_key(&self, key: &str) -> String {
        format!("{}{}", self.settings.l2_prefix, key)
    }

    /// Look `key` up, calling `load` only when both tiers miss
    ///
    /// A loaded value populates both tiers; a load error is returned as is
    /// and nothing is cached.
    pub async fn get_with<F, Fut>(&self, key: &str, load: F) -> Result<V>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<V>>,
    {
        if let Some(value) = self.l1.get(key) {
            self.stats.l1_hits.fetch_add(1, Ordering::Relaxed);
            debug!("{} L1 hit: {}", self.name, key);
            return Ok(value);
        }

        let l2_key = self.l2_key(key);
        if let Some(value) = self.lookup_l2(&l2_key).await {
            self.stats.l2_hits.fetch_add(1, Ordering::Relaxed);
            debug!("{} L2 hit (promoted to L1): {}", self.name, key);
            self.l1.insert(key.to_string(), value.clone());
            return Ok(value);
        }

        self.stats.misses.fetch_add(1, Ordering::Relaxed);
        debug!("{} miss, loading from origin: {}", self.name, key);
        let value = load().await?;

        self.l1.insert(key.to_string(), value.clone());
        self.store_l2(&l2_key, &value).await;
        Ok(value)
    }

    async fn lookup_l2(&self, l2_key: &str) -> Option<V> {
        let raw = match self.l2.get(l2_key).await {
            Ok(Some(raw)) => raw,
            Ok(None) => return None,
            Err(e) => {
                self.stats.l2_errors.fetch_add(1, Ordering::Relaxed);
                warn!("{} L2 read failed for {}: {}", self.name, l2_key, e);
                return None;
            }
        };

        match serde_json::from_slice(&raw) {
            Ok(value) => Some(value),
            Err(e) => {
                self.stats.l2_errors.fetch_add(1, Ordering::Relaxed);
                warn!("{} L2 value for {} is undecodable: {}", self.name, l2_key, e);
                None
            }
        }
    }

    async fn store_l2(&self, l2_key: &str, value: &V) {
        let encoded = match serde_json::to_vec(value) {
            Ok(encoded) => encoded,
            Err(e) => {
                warn!("{} failed to encode {}: {}", self.name, l2_key, e);
                return;
            }
        };
        if let Err(e) = self.l2.set(l2_key, encoded, self.settings.l2_ttl).await {
            self.stats.l2_errors.fetch_add(1, Ordering::Relaxed);
            warn!("{} L2 write failed for {}: {}", self.name, l2_key, e);
        }
    }

    pub fn get_stats(&self) -> TieredCacheStats {
        self.l1.run_pending_tasks();
        TieredCacheStats {
            l1_entries: self.l1.entry_count(),
            l1_hits: self.stats.l1_hits.load(Ordering::Relaxed),
            l2_hits: self.stats.l2_hits.load(Ordering::Relaxed),
            misses: self.stats.misses.load(Ordering::Relaxed),
            l2_errors: self.stats.l2_errors.load(Ordering::Relaxed),
        }
    }
}

/// Object stats by object key, backed by the remote store
pub struct ObjectStatCache {
    cache: TwoTierCache<ObjectStat>,
    store: SharedObjectStore,
}

impl ObjectStatCache {
    pub fn new(store: SharedObjectStore, l2: SharedCacheHandle, config: &StatCacheConfig) -> Self {
        let settings = TierSettings {
            l2_prefix: "stat:",
            l1_max_entries: config.max_entries,
            l1_ttl: Duration::from_secs(config.local_ttl_secs),
            l2_ttl: Duration::from_secs(config.shared_ttl_secs),
        };
        ObjectStatCache {
            cache: TwoTierCache::new("stat-cache", l2, settings),
            store,
        }
    }

    /// Stat of `object_key`; `NotFound` if the store has no such object
    pub async fn get(&self, object_key: &str) -> Result<ObjectStat> {
        let store = &self.store;
        self.cache
            .get_with(object_key, || async move {
                store.stat_object(object_key).await.map_err(|e| match e {
                    DownloadError::NotFound(msg) => DownloadError::NotFound(msg),
                    other => DownloadError::UpstreamError(format!(
                        "stat of {} failed: {}",
                        object_key, other
                    )),
                })
            })
            .await
    }

    pub fn get_stats(&self) -> TieredCacheStats {
        self.cache.get_stats()
    }
}

/// File records by id, backed by the metadata store
pub struct FileMetadataCache {
    cache: TwoTierCache<FileRecord>,
    repository: SharedFileRepository,
}

impl FileMetadataCache {
    pub fn new(repository: SharedFileRepository, l2: SharedCacheHandle, config: &MetadataConfig) -> Self {
        let settings = TierSettings {
            l2_prefix: "file:",
            l1_max_entries: config.max_entries,
            l1_ttl: Duration::from_secs(config.local_ttl_secs),
            l2_ttl: Duration::from_secs(config.shared_ttl_secs),
        };
        FileMetadataCache {
            cache: TwoTierCache::new("file-cache", l2, settings),
            repository,
        }
    }

    /// Record with this id; `NotFound` if the metadata store has none
    pub async fn get(&self, id: i64) -> Result<FileRecord> {
        let repository = &self.repository;
        self.cache
            .get_with(&id.to_string(), || async move {
                repository
                    .select_by_id(id)
                    .await?
                    .ok_or_else(|| DownloadError::NotFound(format!("file {}", id)))
            })
            .await
    }

    pub fn get_stats(&self) -> TieredCacheStats {
        self.cache.get_stats()
    }
}
