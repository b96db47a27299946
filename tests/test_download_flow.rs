//! End-to-end tests for the range and full download handlers
//!
//! Every test runs a real DownloadService over an in-process object store,
//! an in-process metadata repository and a temporary cache directory.

use async_trait::async_trait;
use bytes::Bytes;
use http::StatusCode;
use http_body_util::BodyExt;
use slice_download::{
    ByteRange, CacheKey, DownloadConfig, DownloadError, DownloadResponse, DownloadService,
    FileRecord, MemoryFileRepository, MemoryObjectStore, MemorySharedCache, ObjectBody,
    ObjectStat, ObjectStore,
};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

const OBJECT_KEY: &str = "uploads/2025/report.bin";

struct Harness {
    dir: TempDir,
    store: Arc<MemoryObjectStore>,
    service: Arc<DownloadService>,
}

fn test_data(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i % 251) as u8).collect()
}

fn record(len: usize) -> FileRecord {
    FileRecord {
        id: 7,
        object_key: OBJECT_KEY.to_string(),
        bucket: "files".to_string(),
        origin_filename: "report.bin".to_string(),
        md5: String::new(),
        size: len as u64,
        content_type: None,
        created_at: None,
    }
}

async fn harness_with(
    data: &[u8],
    store: MemoryObjectStore,
    tweak: impl FnOnce(&mut DownloadConfig),
) -> Harness {
    let dir = TempDir::new().unwrap();
    let store = Arc::new(store);
    store.put(OBJECT_KEY, data.to_vec());

    let repo = Arc::new(MemoryFileRepository::new());
    repo.insert(record(data.len()));

    let mut config = DownloadConfig {
        cache_dir: dir.path().to_path_buf(),
        worker_pool_size: 4,
        ..Default::default()
    };
    config.retry.backoff_ms = 10;
    tweak(&mut config);

    let service = DownloadService::new(
        config,
        store.clone(),
        repo,
        Arc::new(MemorySharedCache::new()),
    )
    .await
    .unwrap();

    Harness {
        dir,
        store,
        service: Arc::new(service),
    }
}

async fn harness(data: &[u8]) -> Harness {
    harness_with(data, MemoryObjectStore::new(), |_| {}).await
}

async fn body(response: DownloadResponse) -> Bytes {
    response.body.collect().await.unwrap().to_bytes()
}

fn leftover_temp_files(dir: &std::path::Path) -> Vec<std::path::PathBuf> {
    let mut found = Vec::new();
    let mut pending = vec![dir.to_path_buf()];
    while let Some(current) = pending.pop() {
        for entry in std::fs::read_dir(&current).unwrap() {
            let path = entry.unwrap().path();
            if path.is_dir() {
                pending.push(path);
            } else if path.extension().map(|e| e == "tmp").unwrap_or(false) {
                found.push(path);
            }
        }
    }
    found
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_misses_share_one_fetch() {
    let data = test_data(4096);
    let h = harness(&data).await;
    h.store.set_get_delay(Duration::from_millis(300));

    let mut tasks = Vec::new();
    for _ in 0..8 {
        let service = Arc::clone(&h.service);
        tasks.push(tokio::spawn(async move {
            let response = service.handle_range(7, Some("bytes=100-2099")).await;
            assert_eq!(response.status, StatusCode::PARTIAL_CONTENT);
            body(response).await
        }));
    }

    for task in tasks {
        let bytes = task.await.unwrap();
        assert_eq!(bytes.as_ref(), &data[100..2100]);
    }

    assert_eq!(h.store.get_calls(), 1, "only one origin fetch per cache key");
    let stats = h.service.metrics().get_stats();
    assert_eq!(stats.dedup_joins + stats.memory_hits + stats.disk_hits, 7);
    assert_eq!(h.service.inflight().in_flight_count(), 0);
}

#[tokio::test]
async fn test_open_ended_range_covers_whole_object() {
    let data = test_data(1000);
    let h = harness(&data).await;

    let response = h.service.handle_range(7, Some("bytes=0-")).await;
    assert_eq!(response.status, StatusCode::PARTIAL_CONTENT);
    assert_eq!(response.headers["content-range"], "bytes 0-999/1000");
    assert_eq!(response.headers["content-length"], "1000");
    assert_eq!(response.headers["accept-ranges"], "bytes");
    assert_eq!(body(response).await.as_ref(), data.as_slice());
}

#[tokio::test]
async fn test_suffix_and_clamped_ranges() {
    let data = test_data(1000);
    let h = harness(&data).await;

    let suffix = h.service.handle_range(7, Some("bytes=-100")).await;
    assert_eq!(suffix.headers["content-range"], "bytes 900-999/1000");
    assert_eq!(body(suffix).await.as_ref(), &data[900..]);

    // the end is clamped, never expanded
    let clamped = h.service.handle_range(7, Some("bytes=990-5000")).await;
    assert_eq!(clamped.headers["content-range"], "bytes 990-999/1000");
    assert_eq!(body(clamped).await.as_ref(), &data[990..]);
}

#[tokio::test]
async fn test_reversed_range_is_416_without_fetch() {
    let data = test_data(1000);
    let h = harness(&data).await;

    let response = h.service.handle_range(7, Some("bytes=500-100")).await;
    assert_eq!(response.status, StatusCode::RANGE_NOT_SATISFIABLE);
    assert_eq!(response.headers["content-range"], "bytes */1000");

    let past_end = h.service.handle_range(7, Some("bytes=1000-")).await;
    assert_eq!(past_end.status, StatusCode::RANGE_NOT_SATISFIABLE);

    assert_eq!(h.store.get_calls(), 0);
    assert_eq!(h.service.metrics().get_stats().not_satisfiable, 2);
}

#[tokio::test]
async fn test_wrong_length_disk_file_is_refetched() {
    let data = test_data(1000);
    let h = harness(&data).await;

    let range = ByteRange::new(0, 499).unwrap();
    let path = h.service.disk_cache().range_path(OBJECT_KEY, &range);
    h.service
        .disk_cache()
        .write(&path, b"stale and far too short")
        .await
        .unwrap();

    let response = h.service.handle_range(7, Some("bytes=0-499")).await;
    assert_eq!(response.status, StatusCode::PARTIAL_CONTENT);
    assert_eq!(body(response).await.as_ref(), &data[..500]);

    assert_eq!(h.store.get_calls(), 1);
    assert_eq!(std::fs::metadata(&path).unwrap().len(), 500);
}

#[tokio::test]
async fn test_repeated_range_is_served_from_cache() {
    let data = test_data(2048);
    let h = harness(&data).await;

    for _ in 0..3 {
        let response = h.service.handle_range(7, Some("bytes=1024-2047")).await;
        assert_eq!(body(response).await.as_ref(), &data[1024..]);
    }

    assert_eq!(h.store.get_calls(), 1);
    assert_eq!(h.store.stat_calls(), 1, "stat is cached after the first request");
    let stats = h.service.metrics().get_stats();
    assert_eq!(stats.cache_misses, 1);
    assert_eq!(stats.memory_hits, 2);
    assert_eq!(stats.bytes_from_origin, 1024);
}

#[tokio::test]
async fn test_truncated_body_is_retried() {
    let data = test_data(1000);
    let h = harness_with(&data, MemoryObjectStore::with_chunk_size(100), |_| {}).await;
    h.store.truncate_next_gets(1);

    let response = h.service.handle_range(7, Some("bytes=0-999")).await;
    assert_eq!(response.status, StatusCode::PARTIAL_CONTENT);
    assert_eq!(body(response).await.as_ref(), data.as_slice());

    assert_eq!(h.store.get_calls(), 2);
    assert_eq!(h.service.metrics().get_stats().fetch_retries, 1);
    assert!(leftover_temp_files(h.dir.path()).is_empty());
}

#[tokio::test]
async fn test_failed_fetch_publishes_nothing() {
    let data = test_data(1000);
    let h = harness_with(&data, MemoryObjectStore::with_chunk_size(100), |_| {}).await;
    h.store.truncate_next_gets(3);

    let response = h.service.handle_range(7, Some("bytes=0-999")).await;
    assert_eq!(response.status, StatusCode::INTERNAL_SERVER_ERROR);
    assert_eq!(h.store.get_calls(), 3);

    let range = ByteRange::new(0, 999).unwrap();
    let path = h.service.disk_cache().range_path(OBJECT_KEY, &range);
    assert!(!path.exists(), "a failed fetch must not leave a final file");
    assert!(leftover_temp_files(h.dir.path()).is_empty());

    // the next request starts a fresh flight and succeeds
    let retry = h.service.handle_range(7, Some("bytes=0-999")).await;
    assert_eq!(retry.status, StatusCode::PARTIAL_CONTENT);
    assert_eq!(body(retry).await.as_ref(), data.as_slice());
}

#[tokio::test]
async fn test_missing_object_is_not_retried() {
    let data = test_data(100);
    let h = harness(&data).await;
    h.store.fail_next_gets(1);

    // an injected transport failure is retried
    let response = h.service.handle_range(7, Some("bytes=0-9")).await;
    assert_eq!(response.status, StatusCode::PARTIAL_CONTENT);
    assert_eq!(h.store.get_calls(), 2);

    let unknown = h.service.handle_range(8, Some("bytes=0-9")).await;
    assert_eq!(unknown.status, StatusCode::NOT_FOUND);
    assert_eq!(h.store.get_calls(), 2);
}

#[tokio::test]
async fn test_slow_origin_times_out_and_fetch_continues() {
    let data = test_data(1000);
    let h = harness_with(&data, MemoryObjectStore::new(), |config| {
        config.range_wait_timeout_secs = 1;
    })
    .await;
    h.store.set_get_delay(Duration::from_millis(1500));

    let response = h.service.handle_range(7, Some("bytes=0-99")).await;
    assert_eq!(response.status, StatusCode::GATEWAY_TIMEOUT);
    assert_eq!(h.service.metrics().get_stats().timeouts, 1);

    // the worker keeps going and publishes for the next request
    tokio::time::sleep(Duration::from_millis(1200)).await;
    let later = h.service.handle_range(7, Some("bytes=0-99")).await;
    assert_eq!(later.status, StatusCode::PARTIAL_CONTENT);
    assert_eq!(body(later).await.as_ref(), &data[..100]);
    assert_eq!(h.store.get_calls(), 1);
}

#[tokio::test]
async fn test_large_full_download_streams_from_disk() {
    let data = test_data(10_000);
    let h = harness_with(&data, MemoryObjectStore::with_chunk_size(1000), |config| {
        config.stream_direct_threshold = 4096;
        config.memory_promote_threshold = 1024;
    })
    .await;

    let response = h.service.handle_full(7).await;
    assert_eq!(response.status, StatusCode::OK);
    assert!(response.headers.get("content-range").is_none());
    assert_eq!(response.content_length(), Some(10_000));
    assert_eq!(body(response).await.as_ref(), data.as_slice());

    assert!(!h.service.chunk_cache().contains(&CacheKey::full(OBJECT_KEY)));
    let path = h.service.disk_cache().full_path(OBJECT_KEY);
    assert_eq!(std::fs::metadata(&path).unwrap().len(), 10_000);

    // served from disk the second time
    let again = h.service.handle_full(7).await;
    assert_eq!(body(again).await.as_ref(), data.as_slice());
    assert_eq!(h.store.get_calls(), 1);
    assert_eq!(h.service.metrics().get_stats().disk_hits, 1);
}

#[tokio::test]
async fn test_mid_sized_full_download_is_buffered_not_cached() {
    let data = test_data(3000);
    let h = harness_with(&data, MemoryObjectStore::new(), |config| {
        config.stream_direct_threshold = 4096;
        config.memory_promote_threshold = 1024;
    })
    .await;

    let response = h.service.handle_full(7).await;
    assert_eq!(response.status, StatusCode::OK);
    assert_eq!(body(response).await.as_ref(), data.as_slice());
    assert!(!h.service.chunk_cache().contains(&CacheKey::full(OBJECT_KEY)));
}

#[tokio::test]
async fn test_full_download_of_empty_object() {
    let h = harness(&[]).await;

    let response = h.service.handle_full(7).await;
    assert_eq!(response.status, StatusCode::OK);
    assert_eq!(response.headers["content-length"], "0");
    assert!(body(response).await.is_empty());
    assert_eq!(h.store.get_calls(), 0);

    let ranged = h.service.handle_range(7, None).await;
    assert_eq!(ranged.status, StatusCode::RANGE_NOT_SATISFIABLE);
}

#[tokio::test]
async fn test_content_disposition_uses_origin_filename() {
    let data = test_data(10);
    let h = harness(&data).await;

    let response = h.service.handle_full(7).await;
    let disposition = response.headers["content-disposition"].to_str().unwrap();
    assert!(disposition.starts_with("attachment;"));
    assert!(disposition.contains("report.bin"));
    assert!(response.headers.get("etag").is_some());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_large_full_downloads_share_one_fetch() {
    let data = test_data(200_000);
    let h = harness_with(&data, MemoryObjectStore::new(), |config| {
        config.stream_direct_threshold = 1024;
        config.memory_promote_threshold = 512;
    })
    .await;
    h.store.set_get_delay(Duration::from_millis(300));

    let mut tasks = Vec::new();
    for _ in 0..6 {
        let service = Arc::clone(&h.service);
        tasks.push(tokio::spawn(async move {
            let response = service.handle_full(7).await;
            assert_eq!(response.status, StatusCode::OK);
            body(response).await
        }));
    }

    for task in tasks {
        assert_eq!(task.await.unwrap().as_ref(), data.as_slice());
    }
    assert_eq!(h.store.get_calls(), 1);
    assert!(!h.service.chunk_cache().contains(&CacheKey::full(OBJECT_KEY)));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_client_abort_affects_only_its_own_download() {
    let data = test_data(200_000);
    let h = harness_with(&data, MemoryObjectStore::new(), |config| {
        config.stream_direct_threshold = 1024;
        config.memory_promote_threshold = 512;
    })
    .await;
    h.store.set_get_delay(Duration::from_millis(300));

    let mut tasks = Vec::new();
    for i in 0..6 {
        let service = Arc::clone(&h.service);
        tasks.push(tokio::spawn(async move {
            let mut response = service.handle_full(7).await;
            assert_eq!(response.status, StatusCode::OK);
            if i == 0 {
                // read one frame, then hang up
                let first = response.body.frame().await.unwrap().unwrap();
                assert!(first.is_data());
                drop(response);
                None
            } else {
                Some(body(response).await)
            }
        }));
    }

    let mut complete = 0;
    for task in tasks {
        if let Some(bytes) = task.await.unwrap() {
            assert_eq!(bytes.as_ref(), data.as_slice());
            complete += 1;
        }
    }
    assert_eq!(complete, 5);
    assert_eq!(h.store.get_calls(), 1);
    assert_eq!(h.service.metrics().get_stats().client_aborts, 1);

    // the published file is intact for later requests
    let path = h.service.disk_cache().full_path(OBJECT_KEY);
    assert_eq!(std::fs::metadata(&path).unwrap().len(), 200_000);
}

/// Store whose stat call always fails with a transport error
#[derive(Default)]
struct UnreachableStore {
    stat_calls: AtomicUsize,
}

#[async_trait]
impl ObjectStore for UnreachableStore {
    async fn stat_object(&self, object_key: &str) -> slice_download::Result<ObjectStat> {
        self.stat_calls.fetch_add(1, Ordering::SeqCst);
        Err(DownloadError::HttpError(format!("connection refused stating {}", object_key)))
    }

    async fn get_object(
        &self,
        object_key: &str,
        _offset: u64,
        _length: u64,
    ) -> slice_download::Result<Box<dyn ObjectBody>> {
        Err(DownloadError::HttpError(format!("connection refused reading {}", object_key)))
    }
}

#[tokio::test]
async fn test_stat_failure_is_500_and_not_cached() {
    let dir = TempDir::new().unwrap();
    let store = Arc::new(UnreachableStore::default());
    let repo = Arc::new(MemoryFileRepository::new());
    repo.insert(record(1000));
    let config = DownloadConfig {
        cache_dir: dir.path().to_path_buf(),
        ..Default::default()
    };
    let service = DownloadService::new(
        config,
        store.clone(),
        repo,
        Arc::new(MemorySharedCache::new()),
    )
    .await
    .unwrap();

    let ranged = service.handle_range(7, Some("bytes=0-99")).await;
    assert_eq!(ranged.status, StatusCode::INTERNAL_SERVER_ERROR);
    let full = service.handle_full(7).await;
    assert_eq!(full.status, StatusCode::INTERNAL_SERVER_ERROR);

    assert_eq!(store.stat_calls.load(Ordering::SeqCst), 2);
    assert_eq!(service.metrics().get_stats().failed_requests, 2);
}
