//! Core data models for the download subsystem

use crate::error::{DownloadError, Result};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Logical file record owned by the metadata store
///
/// Immutable once created, so it can be cached for hours.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileRecord {
    pub id: i64,
    /// Key of the object in the remote store
    pub object_key: String,
    pub bucket: String,
    /// Display name used for Content-Disposition
    pub origin_filename: String,
    pub md5: String,
    pub size: u64,
    pub content_type: Option<String>,
    pub created_at: Option<String>,
}

/// Size and validators of a remote object, as reported by the store
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObjectStat {
    pub object_key: String,
    pub size: u64,
    pub etag: String,
    pub last_modified: String,
}

/// Represents an inclusive byte range that has been clamped to an object
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ByteRange {
    /// Starting byte position (inclusive)
    pub start: u64,
    /// Ending byte position (inclusive)
    pub end: u64,
}

impl ByteRange {
    /// Create a new ByteRange
    ///
    /// # Returns
    /// * `Err(DownloadError::ParseError)` if start > end
    pub fn new(start: u64, end: u64) -> Result<Self> {
        if start > end {
            return Err(DownloadError::ParseError(format!(
                "start ({}) must be <= end ({})",
                start, end
            )));
        }
        Ok(ByteRange { start, end })
    }

    /// Range covering a whole object of `total` bytes
    pub fn full(total: u64) -> Option<Self> {
        if total == 0 {
            None
        } else {
            Some(ByteRange { start: 0, end: total - 1 })
        }
    }

    /// Get the size of this byte range in bytes
    pub fn size(&self) -> u64 {
        self.end - self.start + 1
    }

    /// Value of the Content-Range header for an object of `total` bytes
    pub fn content_range(&self, total: u64) -> String {
        format!("bytes {}-{}/{}", self.start, self.end, total)
    }
}

/// A client Range request before it is resolved against the object size
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RangeRequest {
    /// `bytes=start-end` or `bytes=start-` (end is `None`)
    FromStart { start: u64, end: Option<u64> },
    /// `bytes=-n`, the last `n` bytes
    Suffix(u64),
}

impl RangeRequest {
    /// Request for everything, equivalent to `bytes=0-`
    pub fn all() -> Self {
        RangeRequest::FromStart { start: 0, end: None }
    }

    /// Parse a Range header value
    ///
    /// Parsing is lenient: only the first range of a list is honoured and a
    /// value that cannot be parsed degrades to `bytes=0-`. A reversed range
    /// such as `bytes=500-100` parses fine and is rejected later by `clamp`.
    pub fn parse(header: &str) -> Self {
        let header = header.trim();
        let ranges = match header.strip_prefix("bytes=") {
            Some(ranges) => ranges,
            None => return RangeRequest::all(),
        };
        let first = ranges.split(',').next().unwrap_or("").trim();
        let (start, end) = match first.split_once('-') {
            Some(parts) => parts,
            None => return RangeRequest::all(),
        };
        let (start, end) = (start.trim(), end.trim());

        if start.is_empty() {
            return match end.parse::<u64>() {
                Ok(n) => RangeRequest::Suffix(n),
                Err(_) => RangeRequest::all(),
            };
        }

        let start = match start.parse::<u64>() {
            Ok(s) => s,
            Err(_) => return RangeRequest::all(),
        };
        let end = if end.is_empty() {
            None
        } else {
            match end.parse::<u64>() {
                Ok(e) => Some(e),
                Err(_) => None,
            }
        };
        RangeRequest::FromStart { start, end }
    }

    /// Resolve against an object of `total` bytes
    ///
    /// The end is clamped to `total - 1`; the range is never expanded.
    ///
    /// # Returns
    /// * `Err(DownloadError::RangeNotSatisfiable)` if nothing is left after clamping
    pub fn clamp(&self, total: u64) -> Result<ByteRange> {
        let unsatisfiable = |start: u64, end: u64| DownloadError::RangeNotSatisfiable {
            start,
            end,
            total,
        };

        let (start, end) = match *self {
            RangeRequest::FromStart { start, end } => (start, end.unwrap_or(u64::MAX)),
            RangeRequest::Suffix(n) => {
                if n == 0 {
                    return Err(unsatisfiable(total, total));
                }
                (total.saturating_sub(n), u64::MAX)
            }
        };

        if total == 0 {
            return Err(unsatisfiable(start, end));
        }
        let end = end.min(total - 1);
        if start > end {
            return Err(unsatisfiable(start, end));
        }
        Ok(ByteRange { start, end })
    }
}

/// Identifies one cached payload: an object plus a byte range or the whole object
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey(String);

impl CacheKey {
    /// Key for a byte range, `object:start-end`
    pub fn range(object_key: &str, range: &ByteRange) -> Self {
        CacheKey(format!("{}:{}-{}", object_key, range.start, range.end))
    }

    /// Key for a whole object, `object:FULL`
    pub fn full(object_key: &str) -> Self {
        CacheKey(format!("{}:FULL", object_key))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}
