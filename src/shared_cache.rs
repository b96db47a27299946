//! Shared (out-of-process) cache tier
//!
//! Values are opaque bytes; the typed caches above this layer decide the
//! encoding. The tier is eventually consistent and allowed to be unavailable:
//! callers treat any failure here as a miss.

use crate::config::RedisConfig;
use crate::connection::{ConnectionEvent, ConnectionTracker};
use crate::error::{DownloadError, Result};
use async_trait::async_trait;
use moka::sync::Cache;
use moka::Expiry;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
const MEMORY_TIER_MAX_ENTRIES: u64 = 100_000;

/// Shared cache interface
#[async_trait]
pub trait SharedCache: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>>;
    async fn set(&self, key: &str, value: Vec<u8>, ttl: Duration) -> Result<()>;
}

/// Shared tier kept in this process
///
/// Used when no Redis is configured, and in tests. Each entry expires after
/// the TTL it was written with.
pub struct MemorySharedCache {
    entries: Cache<String, SharedEntry>,
    gets: AtomicUsize,
    sets: AtomicUsize,
}

#[derive(Clone)]
struct SharedEntry {
    value: Vec<u8>,
    ttl: Duration,
}

struct PerEntryTtl;

impl Expiry<String, SharedEntry> for PerEntryTtl {
    fn expire_after_create(&self, _key: &String, entry: &SharedEntry, _created_at: Instant) -> Option<Duration> {
        Some(entry.ttl)
    }

    fn expire_after_update(
        &self,
        _key: &String,
        entry: &SharedEntry,
        _updated_at: Instant,
        _duration_until_expiry: Option<Duration>,
    ) -> Option<Duration> {
        Some(entry.ttl)
    }
}

impl MemorySharedCache {
    pub fn new() -> Self {
        Self::with_capacity(MEMORY_TIER_MAX_ENTRIES)
    }

    pub fn with_capacity(max_entries: u64) -> Self {
        MemorySharedCache {
            entries: Cache::builder()
                .max_capacity(max_entries)
                .expire_after(PerEntryTtl)
                .build(),
            gets: AtomicUsize::new(0),
            sets: AtomicUsize::new(0),
        }
    }

    pub fn get_count(&self) -> usize {
        self.gets.load(Ordering::SeqCst)
    }

    pub fn set_count(&self) -> usize {
        self.sets.load(Ordering::SeqCst)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.entries.contains_key(key)
    }

    /// Live entries, after pending evictions are applied
    pub fn entry_count(&self) -> u64 {
        self.entries.run_pending_tasks();
        self.entries.entry_count()
    }
}

impl Default for MemorySharedCache {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl SharedCache for MemorySharedCache {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        self.gets.fetch_add(1, Ordering::SeqCst);
        Ok(self.entries.get(key).map(|entry| entry.value))
    }

    async fn set(&self, key: &str, value: Vec<u8>, ttl: Duration) -> Result<()> {
        self.sets.fetch_add(1, Ordering::SeqCst);
        self.entries
            .insert(key.to_string(), SharedEntry { value, ttl });
        Ok(())
    }
}

/// Redis-backed shared tier
///
/// A background task owns the connection lifecycle: it connects, pings on an
/// interval and reconnects after failures. While the tracker is not
/// `Connected`, reads report a miss and writes are dropped.
pub struct RedisSharedCache {
    manager: Arc<RwLock<Option<ConnectionManager>>>,
    tracker: Arc<ConnectionTracker>,
}

impl RedisSharedCache {
    /// Start the connection task; returns immediately even if Redis is down
    pub fn start(config: &RedisConfig, shutdown: CancellationToken) -> Result<Self> {
        let client = redis::Client::open(config.url.as_str())
            .map_err(|e| DownloadError::ConfigError(format!("Invalid redis url: {}", e)))?;

        let manager = Arc::new(RwLock::new(None));
        let tracker = Arc::new(ConnectionTracker::new("redis"));
        let interval = Duration::from_secs(config.health_check_interval_secs.max(1));

        tokio::spawn(Self::lifecycle_task(
            client,
            Arc::clone(&manager),
            Arc::clone(&tracker),
            interval,
            shutdown,
        ));

        Ok(RedisSharedCache { manager, tracker })
    }

    pub fn tracker(&self) -> &ConnectionTracker {
        &self.tracker
    }

    async fn lifecycle_task(
        client: redis::Client,
        manager: Arc<RwLock<Option<ConnectionManager>>>,
        tracker: Arc<ConnectionTracker>,
        interval: Duration,
        shutdown: CancellationToken,
    ) {
        loop {
            let existing = manager.read().await.clone();
            match existing {
                None => {
                    tracker.apply(ConnectionEvent::ConnectStarted);
                    match tokio::time::timeout(CONNECT_TIMEOUT, client.get_connection_manager()).await {
                        Ok(Ok(conn)) => {
                            *manager.write().await = Some(conn);
                            tracker.apply(ConnectionEvent::ConnectSucceeded);
                        }
                        Ok(Err(e)) => {
                            warn!("Redis connect failed: {}", e);
                            tracker.apply(ConnectionEvent::ConnectFailed);
                        }
                        Err(_) => {
                            warn!("Redis connect timed out after {:?}", CONNECT_TIMEOUT);
                            tracker.apply(ConnectionEvent::ConnectFailed);
                        }
                    }
                }
                Some(mut conn) => {
                    let ping: redis::RedisResult<String> =
                        redis::cmd("PING").query_async(&mut conn).await;
                    match ping {
                        Ok(_) => {
                            tracker.apply(ConnectionEvent::HealthCheckPassed);
                        }
                        Err(e) => {
                            warn!("Redis health check failed: {}", e);
                            tracker.apply(ConnectionEvent::HealthCheckFailed);
                        }
                    }
                }
            }

            tokio::select! {
                _ = shutdown.cancelled() => {
                    debug!("Redis lifecycle task stopping");
                    break;
                }
                _ = tokio::time::sleep(interval) => {}
            }
        }
    }

    async fn connection(&self) -> Option<ConnectionManager> {
        if !self.tracker.is_connected() {
            return None;
        }
        self.manager.read().await.clone()
    }
}

#[async_trait]
impl SharedCache for RedisSharedCache {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let mut conn = match self.connection().await {
            Some(conn) => conn,
            None => return Ok(None),
        };
        let value: Option<Vec<u8>> = conn.get(key).await.map_err(|e| {
            self.tracker.apply(ConnectionEvent::HealthCheckFailed);
            DownloadError::CacheError(format!("redis GET {} failed: {}", key, e))
        })?;
        Ok(value)
    }

    async fn set(&self, key: &str, value: Vec<u8>, ttl: Duration) -> Result<()> {
        let mut conn = match self.connection().await {
            Some(conn) => conn,
            None => return Ok(()),
        };
        let _: () = conn
            .set_ex(key, value, ttl.as_secs().max(1))
            .await
            .map_err(|e| {
                self.tracker.apply(ConnectionEvent::HealthCheckFailed);
                DownloadError::CacheError(format!("redis SETEX {} failed: {}", key, e))
            })?;
        Ok(())
    }
}

/// Shared handle to any shared cache tier
pub type SharedCacheHandle = Arc<dyn SharedCache>;
