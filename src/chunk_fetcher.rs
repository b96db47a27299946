//! Chunk fetcher for pulling byte ranges from the remote store into the caches

use crate::chunk_cache::ChunkCache;
use crate::config::RetryConfig;
use crate::disk_cache::DiskCacheStore;
use crate::error::{DownloadError, Result};
use crate::inflight::FetchOutcome;
use crate::metrics::DownloadMetrics;
use crate::models::{ByteRange, CacheKey};
use crate::origin::SharedObjectStore;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Retry policy for failed fetch attempts
///
/// Attempts are numbered from 1. Attempt `n` that fails waits
/// `n * backoff_unit` before attempt `n + 1`.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Total attempts, the first one included
    pub max_attempts: usize,
    pub backoff_unit: Duration,
}

impl RetryPolicy {
    pub fn new(max_attempts: usize, backoff_unit: Duration) -> Self {
        RetryPolicy {
            max_attempts: max_attempts.max(1),
            backoff_unit,
        }
    }

    pub fn from_config(config: &RetryConfig) -> Self {
        Self::new(config.max_attempts, Duration::from_millis(config.backoff_ms))
    }

    /// Check if another attempt should follow failed attempt `attempt`
    pub fn should_retry(&self, attempt: usize, error: &DownloadError) -> bool {
        attempt < self.max_attempts && error.should_retry()
    }

    /// Get the backoff duration after failed attempt `attempt`
    pub fn backoff_duration(&self, attempt: usize) -> Duration {
        self.backoff_unit * attempt as u32
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_config(&RetryConfig::default())
    }
}

/// One unit of work for the fetcher
#[derive(Debug, Clone)]
pub struct FetchRequest {
    pub object_key: String,
    pub range: ByteRange,
    pub cache_key: CacheKey,
    /// Final disk cache path of the payload
    pub path: PathBuf,
    /// Payloads up to this many bytes are read back and handed out in memory
    pub buffer_limit: u64,
}

/// Fetches payloads from the store, publishes them on disk and promotes
/// small ones to the chunk cache
pub struct ChunkFetcher {
    store: SharedObjectStore,
    disk: Arc<DiskCacheStore>,
    chunks: ChunkCache,
    policy: RetryPolicy,
    memory_promote_threshold: u64,
    metrics: Arc<DownloadMetrics>,
    shutdown: CancellationToken,
}

impl ChunkFetcher {
    pub fn new(
        store: SharedObjectStore,
        disk: Arc<DiskCacheStore>,
        chunks: ChunkCache,
        policy: RetryPolicy,
        memory_promote_threshold: u64,
        metrics: Arc<DownloadMetrics>,
        shutdown: CancellationToken,
    ) -> Self {
        ChunkFetcher {
            store,
            disk,
            chunks,
            policy,
            memory_promote_threshold,
            metrics,
            shutdown,
        }
    }

    /// Fetch with retries
    ///
    /// # Returns
    /// * `Ok(FetchOutcome::Memory)` if the payload fits `buffer_limit`
    /// * `Ok(FetchOutcome::OnDisk)` if it stays disk-resident
    /// * `Err(DownloadError::FetchFailed)` once attempts are exhausted, a
    ///   non-retryable error occurs or shutdown interrupts the backoff
    pub async fn fetch(&self, request: &FetchRequest) -> Result<FetchOutcome> {
        let started = Instant::now();
        let mut attempt = 1;

        let len = loop {
            match self.try_fetch_to_disk(request).await {
                Ok(len) => {
                    self.metrics.record_origin_fetch(true);
                    break len;
                }
                Err(e) => {
                    self.metrics.record_origin_fetch(false);
                    if !self.policy.should_retry(attempt, &e) {
                        warn!(
                            cache_key = %request.cache_key,
                            object = %request.object_key,
                            attempt,
                            "Fetch failed, giving up: {}",
                            e
                        );
                        return Err(DownloadError::fetch_failed(request.cache_key.as_str(), attempt, &e));
                    }

                    let backoff = self.policy.backoff_duration(attempt);
                    warn!(
                        cache_key = %request.cache_key,
                        object = %request.object_key,
                        attempt,
                        "Fetch failed, retrying after {:?}: {}",
                        backoff,
                        e
                    );
                    self.metrics.record_fetch_retry();

                    tokio::select! {
                        _ = self.shutdown.cancelled() => {
                            let cause = DownloadError::Interrupted(request.cache_key.to_string());
                            return Err(DownloadError::fetch_failed(request.cache_key.as_str(), attempt, &cause));
                        }
                        _ = tokio::time::sleep(backoff) => {}
                    }
                    attempt += 1;
                }
            }
        };

        self.metrics.record_fetch_duration(started.elapsed());
        info!(
            cache_key = %request.cache_key,
            attempts = attempt,
            "Fetched {} bytes in {:?}",
            len,
            started.elapsed()
        );

        if len > request.buffer_limit {
            return Ok(FetchOutcome::OnDisk {
                path: request.path.clone(),
                len,
            });
        }

        let data = self.disk.read(&request.path, len).await?.ok_or_else(|| {
            DownloadError::CacheError(format!(
                "committed file {} vanished",
                request.path.display()
            ))
        })?;
        if len <= self.memory_promote_threshold {
            self.chunks.insert(&request.cache_key, data.clone());
        }
        Ok(FetchOutcome::Memory(data))
    }

    /// Like [`fetch`](Self::fetch), but first reuses a valid disk file
    ///
    /// A flight can start right after an earlier one for the same key
    /// published its file, so the owner checks the disk again before going
    /// to the origin.
    pub async fn fetch_unless_cached(&self, request: &FetchRequest) -> Result<FetchOutcome> {
        let len = request.range.size();
        if self.disk.is_valid(&request.path, len).await {
            debug!(cache_key = %request.cache_key, "Published by an earlier flight");
            if len > request.buffer_limit {
                return Ok(FetchOutcome::OnDisk {
                    path: request.path.clone(),
                    len,
                });
            }
            if let Some(data) = self.disk.read(&request.path, len).await? {
                if len <= self.memory_promote_threshold {
                    self.chunks.insert(&request.cache_key, data.clone());
                }
                return Ok(FetchOutcome::Memory(data));
            }
        }
        self.fetch(request).await
    }

    /// One attempt: stream the range into a temp file and publish it
    async fn try_fetch_to_disk(&self, request: &FetchRequest) -> Result<u64> {
        let expected = request.range.size();
        let mut temp = self.disk.begin_write(&request.path).await?;
        let mut body = self
            .store
            .get_object(&request.object_key, request.range.start, expected)
            .await?;

        while let Some(chunk) = body.next_chunk().await? {
            if temp.written() + chunk.len() as u64 > expected {
                return Err(DownloadError::UpstreamError(format!(
                    "origin sent more than {} bytes for {}",
                    expected, request.cache_key
                )));
            }
            temp.write_chunk(&chunk).await?;
            self.metrics.record_bytes_from_origin(chunk.len() as u64);
        }

        let written = temp.written();
        if written != expected {
            return Err(DownloadError::ShortRead {
                expected,
                actual: written,
            });
        }

        self.disk.commit(temp).await?;
        debug!(cache_key = %request.cache_key, "Published {}", request.path.display());
        Ok(written)
    }
}
