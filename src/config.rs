//! Configuration management for the download service

use crate::error::{DownloadError, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Configuration for the download service
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DownloadConfig {
    /// Address the HTTP listener binds to (default: 0.0.0.0:8080)
    #[serde(default = "default_listen_address")]
    pub listen_address: String,

    /// Root directory of the disk cache (default: ./cache)
    #[serde(default = "default_cache_dir")]
    pub cache_dir: PathBuf,

    /// Number of fetch workers; 0 means max(4, available cores)
    #[serde(default)]
    pub worker_pool_size: usize,

    /// How long a range request waits for its fetch (default: 6 minutes)
    #[serde(default = "default_range_wait_timeout")]
    pub range_wait_timeout_secs: u64,

    /// How long a full-object request waits for its fetch (default: 15 minutes)
    #[serde(default = "default_full_wait_timeout")]
    pub full_wait_timeout_secs: u64,

    /// Full objects above this size are streamed to disk, never buffered (default: 64MB)
    #[serde(default = "default_stream_direct_threshold")]
    pub stream_direct_threshold: u64,

    /// Fetched payloads up to this size are kept in memory (default: 16MB)
    #[serde(default = "default_memory_promote_threshold")]
    pub memory_promote_threshold: u64,

    /// Maximum number of payloads in the in-memory chunk cache (default: 10000)
    #[serde(default = "default_chunk_cache_max_entries")]
    pub chunk_cache_max_entries: u64,

    /// TTL of in-memory chunk cache entries in seconds (default: 600)
    #[serde(default = "default_chunk_cache_ttl")]
    pub chunk_cache_ttl_secs: u64,

    /// Remote object store settings
    #[serde(default)]
    pub origin: OriginConfig,

    /// Fetch retry settings
    #[serde(default)]
    pub retry: RetryConfig,

    /// File record cache and metadata store settings
    #[serde(default)]
    pub metadata: MetadataConfig,

    /// Object stat cache settings
    #[serde(default)]
    pub stat: StatCacheConfig,

    /// Shared cache tier; in-process when absent
    #[serde(default)]
    pub redis: Option<RedisConfig>,
}

/// Remote object store settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct OriginConfig {
    /// Base URL of the S3-compatible endpoint (default: http://127.0.0.1:9000)
    #[serde(default = "default_origin_endpoint")]
    pub endpoint: String,

    /// Bucket every object is read from; `FileRecord::bucket` is not consulted
    #[serde(default = "default_bucket")]
    pub bucket: String,

    /// Per-request timeout in seconds (default: 300)
    #[serde(default = "default_origin_request_timeout")]
    pub request_timeout_secs: u64,

    /// Connect timeout in seconds (default: 10)
    #[serde(default = "default_origin_connect_timeout")]
    pub connect_timeout_secs: u64,
}

/// Retry settings for origin fetches
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RetryConfig {
    /// Total attempts including the first one (default: 3)
    #[serde(default = "default_max_attempts")]
    pub max_attempts: usize,

    /// Backoff unit; attempt N sleeps N times this (default: 1000ms)
    #[serde(default = "default_backoff_ms")]
    pub backoff_ms: u64,
}

/// File record cache and metadata store settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MetadataConfig {
    /// Database holding the `files` table (default: sqlite://files.db)
    #[serde(default = "default_database_url")]
    pub database_url: String,

    /// Local tier TTL in seconds (default: 12 hours)
    #[serde(default = "default_file_local_ttl")]
    pub local_ttl_secs: u64,

    /// Shared tier TTL in seconds (default: 1 day)
    #[serde(default = "default_file_shared_ttl")]
    pub shared_ttl_secs: u64,

    /// Local tier capacity (default: 20000)
    #[serde(default = "default_meta_max_entries")]
    pub max_entries: u64,
}

/// Object stat cache settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StatCacheConfig {
    /// Local tier TTL in seconds (default: 6 hours)
    #[serde(default = "default_stat_ttl")]
    pub local_ttl_secs: u64,

    /// Shared tier TTL in seconds (default: 6 hours)
    #[serde(default = "default_stat_ttl")]
    pub shared_ttl_secs: u64,

    /// Local tier capacity (default: 20000)
    #[serde(default = "default_meta_max_entries")]
    pub max_entries: u64,
}

/// Redis connection for the shared cache tier
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RedisConfig {
    /// Redis URL, e.g. redis://127.0.0.1/
    pub url: String,

    /// Interval between PING health checks in seconds (default: 15)
    #[serde(default = "default_health_check_interval")]
    pub health_check_interval_secs: u64,
}

// Default value functions for serde
fn default_listen_address() -> String {
    "0.0.0.0:8080".to_string()
}

fn default_cache_dir() -> PathBuf {
    PathBuf::from("./cache")
}

fn default_range_wait_timeout() -> u64 {
    6 * 60
}

fn default_full_wait_timeout() -> u64 {
    15 * 60
}

fn default_stream_direct_threshold() -> u64 {
    64 * 1024 * 1024 // 64MB
}

fn default_memory_promote_threshold() -> u64 {
    16 * 1024 * 1024 // 16MB
}

fn default_chunk_cache_max_entries() -> u64 {
    10_000
}

fn default_chunk_cache_ttl() -> u64 {
    600 // 10 minutes
}

fn default_origin_endpoint() -> String {
    "http://127.0.0.1:9000".to_string()
}

fn default_bucket() -> String {
    "files".to_string()
}

fn default_origin_request_timeout() -> u64 {
    300
}

fn default_origin_connect_timeout() -> u64 {
    10
}

fn default_max_attempts() -> usize {
    3
}

fn default_backoff_ms() -> u64 {
    1000
}

fn default_database_url() -> String {
    "sqlite://files.db".to_string()
}

fn default_file_local_ttl() -> u64 {
    12 * 3600
}

fn default_file_shared_ttl() -> u64 {
    24 * 3600
}

fn default_stat_ttl() -> u64 {
    6 * 3600
}

fn default_meta_max_entries() -> u64 {
    20_000
}

fn default_health_check_interval() -> u64 {
    15
}

impl Default for OriginConfig {
    fn default() -> Self {
        Self {
            endpoint: default_origin_endpoint(),
            bucket: default_bucket(),
            request_timeout_secs: default_origin_request_timeout(),
            connect_timeout_secs: default_origin_connect_timeout(),
        }
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            backoff_ms: default_backoff_ms(),
        }
    }
}

impl Default for MetadataConfig {
    fn default() -> Self {
        Self {
            database_url: default_database_url(),
            local_ttl_secs: default_file_local_ttl(),
            shared_ttl_secs: default_file_shared_ttl(),
            max_entries: default_meta_max_entries(),
        }
    }
}

impl Default for StatCacheConfig {
    fn default() -> Self {
        Self {
            local_ttl_secs: default_stat_ttl(),
            shared_ttl_secs: default_stat_ttl(),
            max_entries: default_meta_max_entries(),
        }
    }
}

impl Default for DownloadConfig {
    fn default() -> Self {
        DownloadConfig {
            listen_address: default_listen_address(),
            cache_dir: default_cache_dir(),
            worker_pool_size: 0,
            range_wait_timeout_secs: default_range_wait_timeout(),
            full_wait_timeout_secs: default_full_wait_timeout(),
            stream_direct_threshold: default_stream_direct_threshold(),
            memory_promote_threshold: default_memory_promote_threshold(),
            chunk_cache_max_entries: default_chunk_cache_max_entries(),
            chunk_cache_ttl_secs: default_chunk_cache_ttl(),
            origin: OriginConfig::default(),
            retry: RetryConfig::default(),
            metadata: MetadataConfig::default(),
            stat: StatCacheConfig::default(),
            redis: None,
        }
    }
}

impl DownloadConfig {
    /// Load configuration from a YAML file
    ///
    /// # Returns
    /// * `Ok(DownloadConfig)` if loading and validation succeed
    /// * `Err(DownloadError)` if file cannot be read or config is invalid
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = fs::read_to_string(path.as_ref()).map_err(|e| {
            DownloadError::ConfigError(format!("Failed to read config file: {}", e))
        })?;
        Self::from_yaml(&content)
    }

    /// Parse and validate configuration from a YAML string
    pub fn from_yaml(content: &str) -> Result<Self> {
        let config: DownloadConfig = serde_yaml::from_str(content).map_err(|e| {
            DownloadError::ConfigError(format!("Failed to parse config file: {}", e))
        })?;

        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration
    ///
    /// # Validation Rules
    /// - wait timeouts and cache TTLs must be > 0
    /// - retry.max_attempts must be > 0
    /// - origin endpoint and bucket must not be empty
    /// - memory_promote_threshold must not exceed stream_direct_threshold
    pub fn validate(&self) -> Result<()> {
        if self.range_wait_timeout_secs == 0 || self.full_wait_timeout_secs == 0 {
            return Err(DownloadError::ConfigError(
                "wait timeouts must be greater than 0".to_string(),
            ));
        }

        if self.retry.max_attempts == 0 {
            return Err(DownloadError::ConfigError(
                "retry.max_attempts must be greater than 0".to_string(),
            ));
        }

        if self.origin.endpoint.trim().is_empty() {
            return Err(DownloadError::ConfigError(
                "origin.endpoint must not be empty".to_string(),
            ));
        }

        if self.origin.bucket.trim().is_empty() {
            return Err(DownloadError::ConfigError(
                "origin.bucket must not be empty".to_string(),
            ));
        }

        if self.chunk_cache_ttl_secs == 0
            || self.metadata.local_ttl_secs == 0
            || self.metadata.shared_ttl_secs == 0
            || self.stat.local_ttl_secs == 0
            || self.stat.shared_ttl_secs == 0
        {
            return Err(DownloadError::ConfigError(
                "cache TTLs must be greater than 0".to_string(),
            ));
        }

        if self.memory_promote_threshold > self.stream_direct_threshold {
            return Err(DownloadError::ConfigError(format!(
                "memory_promote_threshold ({}) must not exceed stream_direct_threshold ({})",
                self.memory_promote_threshold, self.stream_direct_threshold
            )));
        }

        Ok(())
    }

    /// Effective worker pool size
    pub fn effective_pool_size(&self) -> usize {
        if self.worker_pool_size > 0 {
            return self.worker_pool_size;
        }
        let cores = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1);
        cores.max(4)
    }

    pub fn range_wait_timeout(&self) -> Duration {
        Duration::from_secs(self.range_wait_timeout_secs)
    }

    pub fn full_wait_timeout(&self) -> Duration {
        Duration::from_secs(self.full_wait_timeout_secs)
    }
}
