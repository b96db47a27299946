//! Remote object store access
//!
//! The store is an external collaborator. [`ObjectStore`] is the boundary the
//! rest of the crate talks to; [`HttpObjectStore`] speaks to any path-style
//! S3-compatible endpoint (MinIO, Ceph RGW, ...) with plain `HEAD` and ranged
//! `GET` requests, and [`MemoryObjectStore`] keeps objects in process.

use crate::config::OriginConfig;
use crate::error::{DownloadError, Result};
use crate::models::ObjectStat;
use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use reqwest::{Client, StatusCode, Url};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// A body being received from the store, consumed chunk by chunk
#[async_trait]
pub trait ObjectBody: Send {
    /// Next chunk of the body, `None` once the body is exhausted
    async fn next_chunk(&mut self) -> Result<Option<Bytes>>;
}

/// Remote object store interface
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Size and validators of an object
    ///
    /// Fails with `NotFound` when the object does not exist.
    async fn stat_object(&self, object_key: &str) -> Result<ObjectStat>;

    /// Open `length` bytes of an object starting at `offset`
    async fn get_object(
        &self,
        object_key: &str,
        offset: u64,
        length: u64,
    ) -> Result<Box<dyn ObjectBody>>;
}

/// Object store client for S3-compatible HTTP endpoints
pub struct HttpObjectStore {
    client: Client,
    endpoint: Url,
    bucket: String,
}

impl HttpObjectStore {
    /// Create a new HttpObjectStore from origin settings
    pub fn new(config: &OriginConfig) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .connect_timeout(Duration::from_secs(config.connect_timeout_secs))
            .pool_max_idle_per_host(16)
            .pool_idle_timeout(Duration::from_secs(90))
            .tcp_nodelay(true)
            .build()
            .map_err(|e| DownloadError::HttpError(format!("Failed to create HTTP client: {}", e)))?;

        let endpoint = Url::parse(&config.endpoint).map_err(|e| {
            DownloadError::ConfigError(format!("Invalid origin endpoint {}: {}", config.endpoint, e))
        })?;

        info!(
            "Object store client ready: endpoint={}, bucket={}",
            endpoint, config.bucket
        );

        Ok(HttpObjectStore {
            client,
            endpoint,
            bucket: config.bucket.clone(),
        })
    }

    /// Build `<endpoint>/<bucket>/<key>` with every key segment percent-encoded
    fn object_url(&self, object_key: &str) -> Result<Url> {
        let mut url = self.endpoint.clone();
        url.path_segments_mut()
            .map_err(|_| {
                DownloadError::ConfigError(format!("Origin endpoint cannot be a base: {}", self.endpoint))
            })?
            .pop_if_empty()
            .push(&self.bucket)
            .extend(object_key.split('/'));
        Ok(url)
    }

    fn header_str(headers: &http::HeaderMap, name: &str) -> Option<String> {
        headers
            .get(name)
            .and_then(|v| v.to_str().ok())
            .map(|v| v.to_string())
    }
}

#[async_trait]
impl ObjectStore for HttpObjectStore {
    async fn stat_object(&self, object_key: &str) -> Result<ObjectStat> {
        let url = self.object_url(object_key)?;
        debug!("Stat object={} url={}", object_key, url);

        let response = self.client.head(url).send().await.map_err(|e| {
            warn!("HEAD request failed for object={}: {}", object_key, e);
            DownloadError::UpstreamError(format!("HEAD request failed: {}", e))
        })?;

        let status = response.status();
        if status == StatusCode::NOT_FOUND {
            return Err(DownloadError::NotFound(format!("object {}", object_key)));
        }
        if !status.is_success() {
            warn!("Stat of object={} returned status={}", object_key, status);
            return Err(DownloadError::UpstreamError(format!(
                "stat of {} returned {}",
                object_key, status
            )));
        }

        let headers = response.headers();
        let size = headers
            .get("content-length")
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse::<u64>().ok())
            .ok_or_else(|| {
                DownloadError::UpstreamError(format!(
                    "Content-Length missing or invalid for {}",
                    object_key
                ))
            })?;

        let etag = Self::header_str(headers, "etag")
            .map(|v| v.trim_matches('"').to_string())
            .unwrap_or_default();
        let last_modified = Self::header_str(headers, "last-modified").unwrap_or_default();

        Ok(ObjectStat {
            object_key: object_key.to_string(),
            size,
            etag,
            last_modified,
        })
    }

    async fn get_object(
        &self,
        object_key: &str,
        offset: u64,
        length: u64,
    ) -> Result<Box<dyn ObjectBody>> {
        if length == 0 {
            return Err(DownloadError::InternalError(format!(
                "zero-length read of {}",
                object_key
            )));
        }
        let url = self.object_url(object_key)?;
        let range = format!("bytes={}-{}", offset, offset + length - 1);

        let response = self
            .client
            .get(url)
            .header("Range", &range)
            .send()
            .await
            .map_err(|e| DownloadError::HttpError(format!("GET {} failed: {}", range, e)))?;

        let status = response.status();
        match status {
            StatusCode::PARTIAL_CONTENT => {}
            // Some stores ignore Range when it covers the whole object
            StatusCode::OK if offset == 0 => {}
            StatusCode::NOT_FOUND => {
                return Err(DownloadError::NotFound(format!("object {}", object_key)));
            }
            other => {
                return Err(DownloadError::HttpError(format!(
                    "GET {} {} returned {}",
                    object_key, range, other
                )));
            }
        }

        Ok(Box::new(HttpObjectBody { response }))
    }
}

struct HttpObjectBody {
    response: reqwest::Response,
}

#[async_trait]
impl ObjectBody for HttpObjectBody {
    async fn next_chunk(&mut self) -> Result<Option<Bytes>> {
        self.response
            .chunk()
            .await
            .map_err(|e| DownloadError::HttpError(format!("Failed to read body: {}", e)))
    }
}

/// Stored object for [`MemoryObjectStore`]
#[derive(Clone)]
struct MemoryObject {
    data: Bytes,
    etag: String,
    last_modified: String,
}

/// In-process object store
///
/// Counts stat and get calls, and can be told to slow down or fail reads,
/// which makes it the store of choice for exercising the cache layers.
pub struct MemoryObjectStore {
    objects: DashMap<String, MemoryObject>,
    chunk_size: usize,
    stat_calls: AtomicUsize,
    get_calls: AtomicUsize,
    get_delay_ms: AtomicU64,
    failing_gets: AtomicUsize,
    truncating_gets: AtomicUsize,
}

impl MemoryObjectStore {
    pub fn new() -> Self {
        Self::with_chunk_size(8 * 1024)
    }

    /// Bodies are handed out in chunks of `chunk_size` bytes
    pub fn with_chunk_size(chunk_size: usize) -> Self {
        MemoryObjectStore {
            objects: DashMap::new(),
            chunk_size: chunk_size.max(1),
            stat_calls: AtomicUsize::new(0),
            get_calls: AtomicUsize::new(0),
            get_delay_ms: AtomicU64::new(0),
            failing_gets: AtomicUsize::new(0),
            truncating_gets: AtomicUsize::new(0),
        }
    }

    pub fn put(&self, object_key: &str, data: impl Into<Bytes>) {
        let data = data.into();
        let etag = format!("{:016x}", xxhash_rust::xxh3::xxh3_64(&data));
        self.objects.insert(
            object_key.to_string(),
            MemoryObject {
                data,
                etag,
                last_modified: "Mon, 06 Jan 2025 08:00:00 GMT".to_string(),
            },
        );
    }

    pub fn stat_calls(&self) -> usize {
        self.stat_calls.load(Ordering::SeqCst)
    }

    pub fn get_calls(&self) -> usize {
        self.get_calls.load(Ordering::SeqCst)
    }

    /// Delay every subsequent `get_object` call
    pub fn set_get_delay(&self, delay: Duration) {
        self.get_delay_ms
            .store(delay.as_millis() as u64, Ordering::SeqCst);
    }

    /// Make the next `n` `get_object` calls fail outright
    pub fn fail_next_gets(&self, n: usize) {
        self.failing_gets.store(n, Ordering::SeqCst);
    }

    /// Make the next `n` bodies fail after their first chunk
    pub fn truncate_next_gets(&self, n: usize) {
        self.truncating_gets.store(n, Ordering::SeqCst);
    }

    fn take_one(counter: &AtomicUsize) -> bool {
        counter
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

impl Default for MemoryObjectStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ObjectStore for MemoryObjectStore {
    async fn stat_object(&self, object_key: &str) -> Result<ObjectStat> {
        self.stat_calls.fetch_add(1, Ordering::SeqCst);
        let object = self
            .objects
            .get(object_key)
            .ok_or_else(|| DownloadError::NotFound(format!("object {}", object_key)))?;
        Ok(ObjectStat {
            object_key: object_key.to_string(),
            size: object.data.len() as u64,
            etag: object.etag.clone(),
            last_modified: object.last_modified.clone(),
        })
    }

    async fn get_object(
        &self,
        object_key: &str,
        offset: u64,
        length: u64,
    ) -> Result<Box<dyn ObjectBody>> {
        self.get_calls.fetch_add(1, Ordering::SeqCst);

        let delay = self.get_delay_ms.load(Ordering::SeqCst);
        if delay > 0 {
            tokio::time::sleep(Duration::from_millis(delay)).await;
        }

        if Self::take_one(&self.failing_gets) {
            return Err(DownloadError::HttpError(format!(
                "injected failure reading {}",
                object_key
            )));
        }

        let data = self
            .objects
            .get(object_key)
            .map(|o| o.data.clone())
            .ok_or_else(|| DownloadError::NotFound(format!("object {}", object_key)))?;

        let start = (offset as usize).min(data.len());
        let end = (offset.saturating_add(length) as usize).min(data.len());

        Ok(Box::new(MemoryObjectBody {
            data: data.slice(start..end),
            chunk_size: self.chunk_size,
            fail_after_first: Self::take_one(&self.truncating_gets),
            sent_any: false,
        }))
    }
}

struct MemoryObjectBody {
    data: Bytes,
    chunk_size: usize,
    fail_after_first: bool,
    sent_any: bool,
}

#[async_trait]
impl ObjectBody for MemoryObjectBody {
    async fn next_chunk(&mut self) -> Result<Option<Bytes>> {
        if self.fail_after_first && self.sent_any {
            return Err(DownloadError::IoError("connection reset by origin".to_string()));
        }
        if self.data.is_empty() {
            return Ok(None);
        }
        let n = self.chunk_size.min(self.data.len());
        self.sent_any = true;
        Ok(Some(self.data.split_to(n)))
    }
}

/// Shared handle to any object store
pub type SharedObjectStore = Arc<dyn ObjectStore>;
