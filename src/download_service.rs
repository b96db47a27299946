//! Download service: the range and full-object request handlers
//!
//! Every request resolves the file record and the object stat through the
//! two-tier caches, then looks for the payload in memory, on disk, and
//! finally joins or starts an in-flight fetch on the worker pool. Request
//! tasks never talk to the origin for payload bytes themselves; they only
//! wait, with a timeout, for the flight's shared outcome.

use crate::chunk_cache::ChunkCache;
use crate::chunk_fetcher::{ChunkFetcher, FetchRequest, RetryPolicy};
use crate::config::DownloadConfig;
use crate::disk_cache::DiskCacheStore;
use crate::error::{DownloadError, Result};
use crate::inflight::{FetchOutcome, InFlightTracker};
use crate::metadata_store::SharedFileRepository;
use crate::metrics::{DownloadMetrics, RequestKind};
use crate::models::{ByteRange, CacheKey, FileRecord, ObjectStat, RangeRequest};
use crate::origin::SharedObjectStore;
use crate::response::{payload_headers, DownloadResponse, FileBody, ResponseBody};
use crate::shared_cache::SharedCacheHandle;
use crate::tiered_cache::{FileMetadataCache, ObjectStatCache};
use crate::worker_pool::WorkerPool;
use bytes::Bytes;
use http::StatusCode;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

const SHUTDOWN_GRACE: Duration = Duration::from_secs(10);

/// A payload ready to be written to the client
enum Payload {
    Memory(Bytes),
    File { file: tokio::fs::File, len: u64 },
}

/// How to obtain one payload
struct PayloadPlan {
    object_key: String,
    range: ByteRange,
    cache_key: CacheKey,
    path: PathBuf,
    /// Fetched payloads up to this size come back in memory
    buffer_limit: u64,
    /// Disk hits up to the promote threshold are loaded and promoted
    promote_disk_hit: bool,
    wait: Duration,
}

/// The download subsystem, built once at startup and shared by all requests
pub struct DownloadService {
    config: Arc<DownloadConfig>,
    files: FileMetadataCache,
    stats: ObjectStatCache,
    chunks: ChunkCache,
    disk: Arc<DiskCacheStore>,
    inflight: InFlightTracker,
    pool: WorkerPool,
    fetcher: Arc<ChunkFetcher>,
    metrics: Arc<DownloadMetrics>,
}

impl DownloadService {
    /// Build the service over its three collaborators
    ///
    /// # Arguments
    /// * `config` - Validated service configuration
    /// * `store` - Remote object store holding the payloads
    /// * `repository` - Metadata store holding file records
    /// * `shared` - Shared cache tier for records and stats
    pub async fn new(
        config: DownloadConfig,
        store: SharedObjectStore,
        repository: SharedFileRepository,
        shared: SharedCacheHandle,
    ) -> Result<Self> {
        config.validate()?;
        let config = Arc::new(config);

        let disk = Arc::new(DiskCacheStore::new(&config.cache_dir).await?);
        let chunks = ChunkCache::new(
            config.chunk_cache_max_entries,
            Duration::from_secs(config.chunk_cache_ttl_secs),
        );
        let metrics = Arc::new(DownloadMetrics::new());
        let pool = WorkerPool::new(config.effective_pool_size());

        let fetcher = Arc::new(ChunkFetcher::new(
            Arc::clone(&store),
            Arc::clone(&disk),
            chunks.clone(),
            RetryPolicy::from_config(&config.retry),
            config.memory_promote_threshold,
            Arc::clone(&metrics),
            pool.cancellation_token(),
        ));

        let files = FileMetadataCache::new(repository, Arc::clone(&shared), &config.metadata);
        let stats = ObjectStatCache::new(store, shared, &config.stat);

        info!(
            "Download service ready: workers={}, cache_dir={}",
            pool.size(),
            config.cache_dir.display()
        );

        Ok(DownloadService {
            config,
            files,
            stats,
            chunks,
            disk,
            inflight: InFlightTracker::new(),
            pool,
            fetcher,
            metrics,
        })
    }

    pub fn config(&self) -> &DownloadConfig {
        &self.config
    }

    pub fn metrics(&self) -> &Arc<DownloadMetrics> {
        &self.metrics
    }

    pub fn chunk_cache(&self) -> &ChunkCache {
        &self.chunks
    }

    pub fn disk_cache(&self) -> &DiskCacheStore {
        &self.disk
    }

    pub fn inflight(&self) -> &InFlightTracker {
        &self.inflight
    }

    pub fn file_cache(&self) -> &FileMetadataCache {
        &self.files
    }

    pub fn stat_cache(&self) -> &ObjectStatCache {
        &self.stats
    }

    /// Serve part of a file
    ///
    /// `range_header` is the raw Range header; without one the whole object
    /// is served as `bytes=0-`, still with 206.
    pub async fn handle_range(&self, id: i64, range_header: Option<&str>) -> DownloadResponse {
        self.metrics.record_request(RequestKind::Range);
        let started = Instant::now();
        let result = self.serve_range(id, range_header).await;
        self.finish(id, result, started)
    }

    /// Serve a whole file with 200
    pub async fn handle_full(&self, id: i64) -> DownloadResponse {
        self.metrics.record_request(RequestKind::Full);
        let started = Instant::now();
        let result = self.serve_full(id).await;
        self.finish(id, result, started)
    }

    /// Stop the worker pool; waiting requests see their flights interrupted
    pub async fn shutdown(&self) {
        info!("Shutting down download service");
        self.pool.shutdown(SHUTDOWN_GRACE).await;
    }

    fn finish(&self, id: i64, result: Result<DownloadResponse>, started: Instant) -> DownloadResponse {
        let response = match result {
            Ok(response) => response,
            Err(e) => {
                match &e {
                    DownloadError::NotFound(_) | DownloadError::RangeNotSatisfiable { .. } => {
                        debug!(file_id = id, "Rejected download: {}", e)
                    }
                    DownloadError::Timeout(_) => warn!(file_id = id, "Download timed out: {}", e),
                    _ => error!(file_id = id, "Download failed: {}", e),
                }
                DownloadResponse::from_error(&e)
            }
        };
        self.metrics.record_status(response.status.as_u16());
        self.metrics.record_request_duration(started.elapsed());
        response
    }

    async fn resolve(&self, id: i64) -> Result<(FileRecord, ObjectStat)> {
        let record = self.files.get(id).await?;
        let stat = self.stats.get(&record.object_key).await?;
        Ok((record, stat))
    }

    async fn serve_range(&self, id: i64, range_header: Option<&str>) -> Result<DownloadResponse> {
        let (record, stat) = self.resolve(id).await?;

        let request = range_header
            .map(RangeRequest::parse)
            .unwrap_or_else(RangeRequest::all);
        let range = request.clamp(stat.size)?;
        let cache_key = CacheKey::range(&record.object_key, &range);
        debug!(cache_key = %cache_key, "Serving range request for file {}", id);

        let plan = PayloadPlan {
            object_key: record.object_key.clone(),
            range,
            path: self.disk.range_path(&record.object_key, &range),
            cache_key,
            buffer_limit: self.config.memory_promote_threshold,
            promote_disk_hit: true,
            wait: self.config.range_wait_timeout(),
        };
        let payload = self.obtain(plan).await?;

        self.respond(
            StatusCode::PARTIAL_CONTENT,
            &record,
            &stat,
            range.size(),
            Some(range.content_range(stat.size)),
            payload,
        )
    }

    async fn serve_full(&self, id: i64) -> Result<DownloadResponse> {
        let (record, stat) = self.resolve(id).await?;

        let range = match ByteRange::full(stat.size) {
            Some(range) => range,
            None => {
                debug!("File {} is empty", id);
                let headers = payload_headers(&record, &stat, 0, None)?;
                return Ok(DownloadResponse::new(StatusCode::OK, headers, ResponseBody::Empty));
            }
        };

        let cache_key = CacheKey::full(&record.object_key);
        let buffer_limit = if stat.size <= self.config.stream_direct_threshold {
            self.config.stream_direct_threshold
        } else {
            0
        };
        debug!(cache_key = %cache_key, "Serving full request for file {}", id);

        let plan = PayloadPlan {
            object_key: record.object_key.clone(),
            range,
            path: self.disk.full_path(&record.object_key),
            cache_key,
            buffer_limit,
            promote_disk_hit: false,
            wait: self.config.full_wait_timeout(),
        };
        let payload = self.obtain(plan).await?;

        self.respond(StatusCode::OK, &record, &stat, stat.size, None, payload)
    }

    /// Memory, then disk, then an in-flight fetch
    async fn obtain(&self, plan: PayloadPlan) -> Result<Payload> {
        let len = plan.range.size();

        if let Some(data) = self.chunks.get(&plan.cache_key) {
            debug!(cache_key = %plan.cache_key, "Memory cache hit");
            self.metrics.record_memory_hit();
            self.metrics.record_bytes_from_cache(len);
            return Ok(Payload::Memory(data));
        }

        if let Some(payload) = self.from_disk(&plan).await? {
            debug!(cache_key = %plan.cache_key, "Disk cache hit");
            self.metrics.record_disk_hit();
            self.metrics.record_bytes_from_cache(len);
            return Ok(payload);
        }

        self.metrics.record_cache_miss();
        let request = FetchRequest {
            object_key: plan.object_key.clone(),
            range: plan.range,
            cache_key: plan.cache_key.clone(),
            path: plan.path.clone(),
            buffer_limit: plan.buffer_limit,
        };
        let fetcher = Arc::clone(&self.fetcher);
        let registration = self
            .inflight
            .join_or_start(plan.cache_key.as_str(), &self.pool, move || async move {
                fetcher.fetch_unless_cached(&request).await
            });
        if registration.is_joined() {
            self.metrics.record_dedup_join();
        } else {
            info!(
                cache_key = %plan.cache_key,
                object = %plan.object_key,
                "Cache miss, fetching {} bytes from origin",
                len
            );
        }

        match registration.into_handle().wait(plan.wait).await? {
            FetchOutcome::Memory(data) => Ok(Payload::Memory(data)),
            FetchOutcome::OnDisk { path, len } => match self.disk.open(&path, len).await? {
                Some(file) => Ok(Payload::File { file, len }),
                None => Err(DownloadError::CacheError(format!(
                    "fetched file {} is gone or was replaced",
                    path.display()
                ))),
            },
        }
    }

    async fn from_disk(&self, plan: &PayloadPlan) -> Result<Option<Payload>> {
        let len = plan.range.size();

        if plan.promote_disk_hit && len <= self.config.memory_promote_threshold {
            return Ok(match self.disk.read(&plan.path, len).await? {
                Some(data) => {
                    self.chunks.insert(&plan.cache_key, data.clone());
                    Some(Payload::Memory(data))
                }
                None => None,
            });
        }

        Ok(self
            .disk
            .open(&plan.path, len)
            .await?
            .map(|file| Payload::File { file, len }))
    }

    fn respond(
        &self,
        status: StatusCode,
        record: &FileRecord,
        stat: &ObjectStat,
        len: u64,
        content_range: Option<String>,
        payload: Payload,
    ) -> Result<DownloadResponse> {
        let headers = payload_headers(record, stat, len, content_range)?;
        let body = match payload {
            Payload::Memory(data) => {
                if data.len() as u64 != len {
                    return Err(DownloadError::InternalError(format!(
                        "payload for {} has {} bytes, expected {}",
                        record.object_key,
                        data.len(),
                        len
                    )));
                }
                self.metrics.record_bytes_to_client(len);
                ResponseBody::full(data)
            }
            Payload::File { file, len } => ResponseBody::File(FileBody::new(
                file,
                len,
                format!("file {} ({})", record.id, record.object_key),
                Arc::clone(&self.metrics),
            )),
        };
        Ok(DownloadResponse::new(status, headers, body))
    }
}
