//! Error types for the download subsystem

use thiserror::Error;

/// Result type alias for download operations
pub type Result<T> = std::result::Result<T, DownloadError>;

/// Error types that can occur while serving a download
#[derive(Error, Debug, Clone)]
pub enum DownloadError {
    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Range not satisfiable: {start}-{end} of {total}")]
    RangeNotSatisfiable { start: u64, end: u64, total: u64 },

    #[error("Upstream error: {0}")]
    UpstreamError(String),

    #[error("Fetch failed for {cache_key} after {attempts} attempts: {cause}")]
    FetchFailed {
        cache_key: String,
        attempts: usize,
        cause: String,
    },

    #[error("Timed out waiting for {0}")]
    Timeout(String),

    #[error("Fetch for {0} was abandoned before completion")]
    Interrupted(String),

    #[error("Client aborted download of {0}")]
    ClientAbort(String),

    #[error("Short read: expected {expected} bytes, got {actual}")]
    ShortRead { expected: u64, actual: u64 },

    #[error("Cache error: {0}")]
    CacheError(String),

    #[error("Metadata store error: {0}")]
    MetadataError(String),

    #[error("IO error: {0}")]
    IoError(String),

    #[error("HTTP error: {0}")]
    HttpError(String),

    #[error("Parse error: {0}")]
    ParseError(String),

    #[error("Internal error: {0}")]
    InternalError(String),
}

impl From<std::io::Error> for DownloadError {
    fn from(err: std::io::Error) -> Self {
        DownloadError::IoError(err.to_string())
    }
}

impl DownloadError {
    /// Determine if a failed fetch attempt should be retried
    ///
    /// Transient transport and disk failures are retried. A missing object
    /// or a bad range will not get better on a second attempt.
    pub fn should_retry(&self) -> bool {
        match self {
            DownloadError::IoError(_) => true,
            DownloadError::HttpError(_) => true,
            DownloadError::UpstreamError(_) => true,
            DownloadError::ShortRead { .. } => true,
            DownloadError::Timeout(_) => true,

            DownloadError::NotFound(_) => false,
            DownloadError::RangeNotSatisfiable { .. } => false,
            DownloadError::ConfigError(_) => false,
            DownloadError::ParseError(_) => false,
            DownloadError::FetchFailed { .. } => false,
            DownloadError::Interrupted(_) => false,
            DownloadError::ClientAbort(_) => false,
            DownloadError::CacheError(_) => false,
            DownloadError::MetadataError(_) => false,
            DownloadError::InternalError(_) => false,
        }
    }

    /// Convert error to the HTTP status returned to the client
    pub fn to_http_status(&self) -> u16 {
        match self {
            DownloadError::NotFound(_) => 404,
            DownloadError::RangeNotSatisfiable { .. } => 416,
            DownloadError::ParseError(_) => 400,
            DownloadError::Timeout(_) => 504,

            DownloadError::UpstreamError(_) => 500,
            DownloadError::FetchFailed { .. } => 500,
            DownloadError::Interrupted(_) => 500,
            DownloadError::ShortRead { .. } => 500,
            DownloadError::HttpError(_) => 500,
            DownloadError::IoError(_) => 500,
            DownloadError::CacheError(_) => 500,
            DownloadError::MetadataError(_) => 500,
            DownloadError::ConfigError(_) => 500,
            DownloadError::InternalError(_) => 500,
            // Nobody is left to read it, but the access log still wants a code
            DownloadError::ClientAbort(_) => 499,
        }
    }

    /// Create a FetchFailed error for an exhausted retry loop
    pub fn fetch_failed(cache_key: impl Into<String>, attempts: usize, cause: &DownloadError) -> Self {
        DownloadError::FetchFailed {
            cache_key: cache_key.into(),
            attempts,
            cause: cause.to_string(),
        }
    }
}
