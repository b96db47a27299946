//! # Slice Download
//!
//! A download service for large objects held in an object store. It answers
//! ranged and whole-file downloads while keeping origin traffic to a minimum.
//!
//! # Overview
//!
//! Every request resolves a numeric file id into a file record and an object
//! stat, then looks for the payload in three places before going to origin:
//!
//! 1. **Memory** - a bounded, time-limited cache of small payloads
//! 2. **Disk** - published part files under the cache directory
//! 3. **Origin** - a fetch run on the worker pool, shared by every concurrent
//!    request for the same bytes
//!
//! ## Features
//!
//! - **Range downloads**: `bytes=a-b`, `bytes=a-` and `bytes=-n`, with 206 and
//!   416 semantics
//! - **Full downloads**: small objects buffered, large objects streamed from disk
//! - **Fetch deduplication**: one origin fetch per cache key at a time
//! - **Atomic publish**: readers never observe a partially written file
//! - **Retry logic**: bounded attempts with linear backoff
//! - **Two-tier metadata caches**: in-process moka caches backed by an
//!   optional redis tier
//! - **Metrics**: Prometheus text on `/metrics`
//!
//! # Architecture
//!
//! ```text
//! ┌────────┐    ┌─────────────────┐    ┌──────────────────┐
//! │ server │───>│ DownloadService │───>│ FileMetadataCache│──> sqlite
//! └────────┘    └─────────────────┘    │ ObjectStatCache  │──> origin HEAD
//!                 │      │             └──────────────────┘
//!                 │      │                  (L1 moka, L2 redis)
//!                 v      v
//!          ChunkCache  DiskCacheStore
//!                 ^      ^
//!                 │      │
//!            ┌──────────────┐    ┌────────────┐    ┌──────────────┐
//!            │ ChunkFetcher │<───│ WorkerPool │<───│InFlightTracker│
//!            └──────────────┘    └────────────┘    └──────────────┘
//!                   │
//!                   v
//!              ObjectStore (origin)
//! ```
//!
//! # Quick Start
//!
//! ```rust,no_run
//! use slice_download::{
//!     DownloadConfig, DownloadService, HttpObjectStore, MemorySharedCache, SqliteFileRepository,
//! };
//! use std::sync::Arc;
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let config = DownloadConfig::from_file("slice_download.yaml")?;
//! let store = Arc::new(HttpObjectStore::new(&config.origin)?);
//! let repository = Arc::new(SqliteFileRepository::connect(&config.metadata.database_url).await?);
//! let shared = Arc::new(MemorySharedCache::new());
//!
//! let service = DownloadService::new(config, store, repository, shared).await?;
//! let response = service.handle_range(42, Some("bytes=0-1023")).await;
//! println!("status: {}", response.status);
//! # Ok(())
//! # }
//! ```
//!
//! # Configuration
//!
//! ```yaml
//! listen_address: "0.0.0.0:8080"
//! cache_dir: "/var/cache/slice_download"
//! range_wait_timeout_secs: 30
//! full_wait_timeout_secs: 300
//! origin:
//!   endpoint: "http://minio:9000"
//!   bucket: "files"
//! metadata:
//!   database_url: "sqlite:///var/lib/slice_download/files.db"
//! redis:
//!   url: "redis://127.0.0.1:6379"
//! ```
//!
//! # Error Handling
//!
//! All fallible operations return [`DownloadError`], which maps onto an HTTP
//! status through [`DownloadError::to_http_status`]:
//!
//! ```rust,no_run
//! use slice_download::{DownloadConfig, DownloadError};
//!
//! # fn main() {
//! match DownloadConfig::from_file("config.yaml") {
//!     Ok(_) => println!("Config loaded successfully"),
//!     Err(DownloadError::ConfigError(msg)) => eprintln!("Config error: {}", msg),
//!     Err(e) => eprintln!("Other error: {}", e),
//! }
//! # }
//! ```

pub mod chunk_cache;
pub mod chunk_fetcher;
pub mod config;
pub mod connection;
pub mod disk_cache;
pub mod download_service;
pub mod error;
pub mod inflight;
pub mod metadata_store;
pub mod metrics;
pub mod models;
pub mod origin;
pub mod response;
pub mod server;
pub mod shared_cache;
pub mod tiered_cache;
pub mod worker_pool;

// Re-export commonly used types
pub use chunk_cache::ChunkCache;
pub use chunk_fetcher::{ChunkFetcher, FetchRequest, RetryPolicy};
pub use config::{
    DownloadConfig, MetadataConfig, OriginConfig, RedisConfig, RetryConfig, StatCacheConfig,
};
pub use connection::{ConnectionEvent, ConnectionState, ConnectionTracker};
pub use disk_cache::{DiskCacheStore, TempFile};
pub use download_service::DownloadService;
pub use error::{DownloadError, Result};
pub use inflight::{FetchOutcome, FlightHandle, InFlightTracker, Registration};
pub use metadata_store::{
    FileRepository, MemoryFileRepository, SharedFileRepository, SqliteFileRepository,
};
pub use metrics::{DownloadMetrics, MetricsSnapshot, RequestKind};
pub use models::{ByteRange, CacheKey, FileRecord, ObjectStat, RangeRequest};
pub use origin::{HttpObjectStore, MemoryObjectStore, ObjectBody, ObjectStore, SharedObjectStore};
pub use response::{DownloadResponse, ResponseBody};
pub use shared_cache::{MemorySharedCache, RedisSharedCache, SharedCache, SharedCacheHandle};
pub use tiered_cache::{FileMetadataCache, ObjectStatCache, TieredCacheStats, TwoTierCache};
pub use worker_pool::WorkerPool;
