//! Relational lookup of file records
//!
//! The metadata store owns the `files` table; this crate only reads it.

use crate::error::{DownloadError, Result};
use crate::models::FileRecord;
use async_trait::async_trait;
use dashmap::DashMap;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions, SqliteRow};
use sqlx::Row;
use std::str::FromStr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tracing::{debug, info};

/// Lookup of file records by id
#[async_trait]
pub trait FileRepository: Send + Sync {
    /// `Ok(None)` when no record has this id
    async fn select_by_id(&self, id: i64) -> Result<Option<FileRecord>>;
}

const CREATE_FILES_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS files (
    id              INTEGER PRIMARY KEY,
    object_key      TEXT    NOT NULL,
    bucket          TEXT    NOT NULL,
    origin_filename TEXT    NOT NULL,
    md5             TEXT    NOT NULL DEFAULT '',
    size            INTEGER NOT NULL,
    content_type    TEXT,
    created_at      TEXT
)
"#;

/// File repository on a SQLite database
pub struct SqliteFileRepository {
    pool: SqlitePool,
}

impl SqliteFileRepository {
    /// Open the database, creating it and the `files` table when missing
    pub async fn connect(database_url: &str) -> Result<Self> {
        let options = SqliteConnectOptions::from_str(database_url)
            .map_err(|e| {
                DownloadError::ConfigError(format!("Invalid database url {}: {}", database_url, e))
            })?
            .create_if_missing(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(8)
            .connect_with(options)
            .await
            .map_err(|e| DownloadError::MetadataError(format!("Failed to open database: {}", e)))?;

        let repo = SqliteFileRepository { pool };
        repo.init_schema().await?;
        info!("Metadata store ready: {}", database_url);
        Ok(repo)
    }

    async fn init_schema(&self) -> Result<()> {
        sqlx::query(CREATE_FILES_TABLE)
            .execute(&self.pool)
            .await
            .map_err(|e| DownloadError::MetadataError(format!("Failed to create files table: {}", e)))?;
        Ok(())
    }

    /// Insert or replace a record
    ///
    /// The upload path owns this table; downloads never write to it. This
    /// exists to seed a database, as the tests do.
    pub async fn insert(&self, record: &FileRecord) -> Result<()> {
        sqlx::query(
            "INSERT OR REPLACE INTO files \
             (id, object_key, bucket, origin_filename, md5, size, content_type, created_at) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(record.id)
        .bind(&record.object_key)
        .bind(&record.bucket)
        .bind(&record.origin_filename)
        .bind(&record.md5)
        .bind(record.size as i64)
        .bind(&record.content_type)
        .bind(&record.created_at)
        .execute(&self.pool)
        .await
        .map_err(|e| DownloadError::MetadataError(format!("Failed to insert file {}: {}", record.id, e)))?;
        Ok(())
    }

    fn map_row(row: &SqliteRow) -> std::result::Result<FileRecord, sqlx::Error> {
        let size: i64 = row.try_get("size")?;
        Ok(FileRecord {
            id: row.try_get("id")?,
            object_key: row.try_get("object_key")?,
            bucket: row.try_get("bucket")?,
            origin_filename: row.try_get("origin_filename")?,
            md5: row.try_get("md5")?,
            size: size.max(0) as u64,
            content_type: row.try_get("content_type")?,
            created_at: row.try_get("created_at")?,
        })
    }
}

#[async_trait]
impl FileRepository for SqliteFileRepository {
    async fn select_by_id(&self, id: i64) -> Result<Option<FileRecord>> {
        debug!("Selecting file record id={}", id);
        let row = sqlx::query(
            "SELECT id, object_key, bucket, origin_filename, md5, size, content_type, created_at \
             FROM files WHERE id = ?",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| DownloadError::MetadataError(format!("Query for file {} failed: {}", id, e)))?;

        row.as_ref()
            .map(Self::map_row)
            .transpose()
            .map_err(|e| DownloadError::MetadataError(format!("Bad row for file {}: {}", id, e)))
    }
}

/// File repository kept in process
#[derive(Default)]
pub struct MemoryFileRepository {
    records: DashMap<i64, FileRecord>,
    lookups: AtomicUsize,
}

impl MemoryFileRepository {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, record: FileRecord) {
        self.records.insert(record.id, record);
    }

    /// Number of `select_by_id` calls served
    pub fn lookups(&self) -> usize {
        self.lookups.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl FileRepository for MemoryFileRepository {
    async fn select_by_id(&self, id: i64) -> Result<Option<FileRecord>> {
        self.lookups.fetch_add(1, Ordering::SeqCst);
        Ok(self.records.get(&id).map(|r| r.clone()))
    }
}

/// Shared handle to any file repository
pub type SharedFileRepository = Arc<dyn FileRepository>;

#[cfg(test)]
mod tests {
    use super::*;

    fn record(id: i64) -> FileRecord {
        FileRecord {
            id,
            object_key: format!("2024/06/{}.bin", id),
            bucket: "files".to_string(),
            origin_filename: "report final.pdf".to_string(),
            md5: "d41d8cd98f00b204e9800998ecf8427e".to_string(),
            size: 4096,
            content_type: Some("application/pdf".to_string()),
            created_at: None,
        }
    }

    #[tokio::test]
    async fn test_sqlite_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let url = format!("sqlite://{}", dir.path().join("files.db").display());
        let repo = SqliteFileRepository::connect(&url).await.unwrap();

        assert_eq!(repo.select_by_id(7).await.unwrap(), None);

        repo.insert(&record(7)).await.unwrap();
        assert_eq!(repo.select_by_id(7).await.unwrap(), Some(record(7)));
    }

    #[tokio::test]
    async fn test_memory_repository() {
        let repo = MemoryFileRepository::new();
        repo.insert(record(1));
        assert_eq!(repo.select_by_id(1).await.unwrap().unwrap().size, 4096);
        assert!(repo.select_by_id(2).await.unwrap().is_none());
        assert_eq!(repo.lookups(), 2);
    }
}
