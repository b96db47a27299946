//! Persistent disk cache of fetched ranges and whole objects
//!
//! Layout: `<root>/<xxh3(object_key) hex>/part-<start>-<end>` for ranges and
//! `<root>/<xxh3(object_key) hex>/full` for whole objects. Payloads are first
//! written to a temp file next to the final path and then renamed over it.
//! A file only counts as cached when its length is exactly the expected
//! length, so a torn copy or a stale leftover is a miss and gets overwritten.

use crate::error::{DownloadError, Result};
use crate::models::ByteRange;
use bytes::Bytes;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn};

const TEMP_SUFFIX: &str = "tmp";

/// Disk cache rooted at one directory
pub struct DiskCacheStore {
    root: PathBuf,
    temp_counter: AtomicU64,
}

impl DiskCacheStore {
    /// Create the store, creating the root directory if needed
    pub async fn new(root: impl AsRef<Path>) -> Result<Self> {
        let root = root.as_ref().to_path_buf();
        fs::create_dir_all(&root).await.map_err(|e| {
            DownloadError::CacheError(format!(
                "Failed to create cache directory {}: {}",
                root.display(),
                e
            ))
        })?;
        let swept = Self::sweep_temp_files(&root).await;
        info!("Disk cache at {} ({} stale temp files removed)", root.display(), swept);

        Ok(DiskCacheStore {
            root,
            temp_counter: AtomicU64::new(0),
        })
    }

    /// Remove temp files an earlier process left behind when it stopped mid-write
    async fn sweep_temp_files(root: &Path) -> usize {
        let mut removed = 0;
        let mut dirs = match fs::read_dir(root).await {
            Ok(dirs) => dirs,
            Err(e) => {
                warn!("Failed to scan cache directory {}: {}", root.display(), e);
                return 0;
            }
        };

        while let Ok(Some(dir)) = dirs.next_entry().await {
            let is_dir = dir.file_type().await.map(|t| t.is_dir()).unwrap_or(false);
            if !is_dir {
                continue;
            }
            let mut files = match fs::read_dir(dir.path()).await {
                Ok(files) => files,
                Err(e) => {
                    warn!("Failed to scan {}: {}", dir.path().display(), e);
                    continue;
                }
            };
            while let Ok(Some(file)) = files.next_entry().await {
                let path = file.path();
                if path.extension().map(|ext| ext == TEMP_SUFFIX).unwrap_or(false) {
                    match fs::remove_file(&path).await {
                        Ok(()) => {
                            debug!("Removed stale temp file {}", path.display());
                            removed += 1;
                        }
                        Err(e) => warn!("Failed to remove stale temp file {}: {}", path.display(), e),
                    }
                }
            }
        }
        removed
    }

    /// Directory holding every cached payload of one object
    fn object_dir(&self, object_key: &str) -> PathBuf {
        let hash = xxhash_rust::xxh3::xxh3_64(object_key.as_bytes());
        self.root.join(format!("{:016x}", hash))
    }

    /// Final path of a range payload
    pub fn range_path(&self, object_key: &str, range: &ByteRange) -> PathBuf {
        self.object_dir(object_key)
            .join(format!("part-{}-{}", range.start, range.end))
    }

    /// Final path of a whole-object payload
    pub fn full_path(&self, object_key: &str) -> PathBuf {
        self.object_dir(object_key).join("full")
    }

    /// Whether `path` holds exactly `expected_len` bytes
    pub async fn is_valid(&self, path: &Path, expected_len: u64) -> bool {
        match fs::metadata(path).await {
            Ok(meta) => meta.is_file() && meta.len() == expected_len,
            Err(_) => false,
        }
    }

    /// Read a cached payload
    ///
    /// # Returns
    /// * `Ok(Some(bytes))` if the file exists with exactly `expected_len` bytes
    /// * `Ok(None)` if it is missing or has any other length
    pub async fn read(&self, path: &Path, expected_len: u64) -> Result<Option<Bytes>> {
        if !self.is_valid(path, expected_len).await {
            return Ok(None);
        }
        let data = match fs::read(path).await {
            Ok(data) => data,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => {
                return Err(DownloadError::CacheError(format!(
                    "Failed to read {}: {}",
                    path.display(),
                    e
                )))
            }
        };
        // replaced between stat and read
        if data.len() as u64 != expected_len {
            debug!("Cache file {} changed while reading", path.display());
            return Ok(None);
        }
        Ok(Some(Bytes::from(data)))
    }

    /// Open a cached payload for streaming
    ///
    /// The length is checked on the opened handle, so a later replacement of
    /// the path does not affect what the caller reads.
    pub async fn open(&self, path: &Path, expected_len: u64) -> Result<Option<fs::File>> {
        let file = match fs::File::open(path).await {
            Ok(file) => file,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => {
                return Err(DownloadError::CacheError(format!(
                    "Failed to open {}: {}",
                    path.display(),
                    e
                )))
            }
        };
        let meta = file.metadata().await?;
        if !meta.is_file() || meta.len() != expected_len {
            debug!(
                "Ignoring {}: {} bytes on disk, expected {}",
                path.display(),
                meta.len(),
                expected_len
            );
            return Ok(None);
        }
        Ok(Some(file))
    }

    /// Open a temp file that will be published at `final_path`
    pub async fn begin_write(&self, final_path: &Path) -> Result<TempFile> {
        if let Some(parent) = final_path.parent() {
            fs::create_dir_all(parent).await.map_err(|e| {
                DownloadError::CacheError(format!("Failed to create cache directory: {}", e))
            })?;
        }

        let seq = self.temp_counter.fetch_add(1, Ordering::Relaxed);
        let file_name = final_path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "payload".to_string());
        let temp_path = final_path.with_file_name(format!(
            "{}.{}-{}.{}",
            file_name,
            std::process::id(),
            seq,
            TEMP_SUFFIX
        ));

        let file = fs::File::create(&temp_path).await.map_err(|e| {
            DownloadError::CacheError(format!(
                "Failed to create temp file {}: {}",
                temp_path.display(),
                e
            ))
        })?;

        Ok(TempFile {
            file: Some(file),
            temp_path,
            final_path: final_path.to_path_buf(),
            written: 0,
            committed: false,
        })
    }

    /// Publish a temp file at its final path
    ///
    /// Any previous file at the final path is removed first. If the rename
    /// fails the temp file is copied over instead and then removed.
    pub async fn commit(&self, mut temp: TempFile) -> Result<PathBuf> {
        if let Some(mut file) = temp.file.take() {
            file.flush().await?;
            file.sync_all().await?;
        }

        match fs::remove_file(&temp.final_path).await {
            Ok(()) => debug!("Replaced stale cache file {}", temp.final_path.display()),
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) => warn!(
                "Failed to remove old cache file {}: {}",
                temp.final_path.display(),
                e
            ),
        }

        if let Err(rename_err) = fs::rename(&temp.temp_path, &temp.final_path).await {
            warn!(
                "Rename {} -> {} failed ({}), falling back to copy",
                temp.temp_path.display(),
                temp.final_path.display(),
                rename_err
            );
            fs::copy(&temp.temp_path, &temp.final_path).await.map_err(|e| {
                DownloadError::CacheError(format!(
                    "Failed to publish {}: rename: {}, copy: {}",
                    temp.final_path.display(),
                    rename_err,
                    e
                ))
            })?;
            if let Err(e) = fs::remove_file(&temp.temp_path).await {
                warn!("Failed to remove temp file {}: {}", temp.temp_path.display(), e);
            }
        }

        temp.committed = true;
        debug!(
            "Committed {} ({} bytes)",
            temp.final_path.display(),
            temp.written
        );
        Ok(temp.final_path.clone())
    }

    /// Write a complete payload and publish it
    pub async fn write(&self, final_path: &Path, data: &[u8]) -> Result<PathBuf> {
        let mut temp = self.begin_write(final_path).await?;
        temp.write_chunk(data).await?;
        self.commit(temp).await
    }
}

/// A payload being written; removed on drop unless committed
pub struct TempFile {
    file: Option<fs::File>,
    temp_path: PathBuf,
    final_path: PathBuf,
    written: u64,
    committed: bool,
}

impl TempFile {
    pub async fn write_chunk(&mut self, chunk: &[u8]) -> Result<()> {
        let file = self
            .file
            .as_mut()
            .ok_or_else(|| DownloadError::InternalError("temp file already closed".to_string()))?;
        file.write_all(chunk).await?;
        self.written += chunk.len() as u64;
        Ok(())
    }

    /// Bytes written so far
    pub fn written(&self) -> u64 {
        self.written
    }

    pub fn temp_path(&self) -> &Path {
        &self.temp_path
    }
}

impl Drop for TempFile {
    fn drop(&mut self) {
        if self.committed {
            return;
        }
        drop(self.file.take());
        match std::fs::remove_file(&self.temp_path) {
            Ok(()) => debug!("Discarded temp file {}", self.temp_path.display()),
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) => warn!("Failed to discard temp file {}: {}", self.temp_path.display(), e),
        }
    }
}
