//! Integration tests for HttpObjectStore against a mock S3-style endpoint

use slice_download::{DownloadError, HttpObjectStore, ObjectStore, OriginConfig};
use wiremock::matchers::{header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn store_for(server: &MockServer) -> HttpObjectStore {
    let config = OriginConfig {
        endpoint: server.uri(),
        bucket: "files".to_string(),
        request_timeout_secs: 5,
        connect_timeout_secs: 2,
    };
    HttpObjectStore::new(&config).unwrap()
}

async fn read_all(store: &HttpObjectStore, key: &str, offset: u64, length: u64) -> Vec<u8> {
    let mut body = store.get_object(key, offset, length).await.unwrap();
    let mut out = Vec::new();
    while let Some(chunk) = body.next_chunk().await.unwrap() {
        out.extend_from_slice(&chunk);
    }
    out
}

#[tokio::test]
async fn test_stat_object_reads_headers() {
    let server = MockServer::start().await;
    Mock::given(method("HEAD"))
        .and(path("/files/media/clip.bin"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_bytes(vec![0u8; 1000])
                .insert_header("ETag", "\"abc123\"")
                .insert_header("Last-Modified", "Mon, 06 Jan 2025 08:00:00 GMT"),
        )
        .expect(1)
        .mount(&server)
        .await;

    let store = store_for(&server);
    let stat = store.stat_object("media/clip.bin").await.unwrap();
    assert_eq!(stat.object_key, "media/clip.bin");
    assert_eq!(stat.size, 1000);
    assert_eq!(stat.etag, "abc123");
    assert_eq!(stat.last_modified, "Mon, 06 Jan 2025 08:00:00 GMT");
}

#[tokio::test]
async fn test_stat_missing_object_is_not_found() {
    let server = MockServer::start().await;
    Mock::given(method("HEAD"))
        .and(path("/files/missing.bin"))
        .respond_with(ResponseTemplate::new(404))
        .mount(&server)
        .await;

    let store = store_for(&server);
    let result = store.stat_object("missing.bin").await;
    assert!(matches!(result, Err(DownloadError::NotFound(_))));
}

#[tokio::test]
async fn test_stat_server_error_is_upstream_error() {
    let server = MockServer::start().await;
    Mock::given(method("HEAD"))
        .respond_with(ResponseTemplate::new(503))
        .mount(&server)
        .await;

    let store = store_for(&server);
    let err = store.stat_object("media/clip.bin").await.unwrap_err();
    assert!(matches!(err, DownloadError::UpstreamError(_)));
    assert!(err.should_retry());
}

#[tokio::test]
async fn test_get_object_sends_range_header() {
    let server = MockServer::start().await;
    let payload: Vec<u8> = (0..100u8).collect();
    Mock::given(method("GET"))
        .and(path("/files/media/clip.bin"))
        .and(header("Range", "bytes=10-19"))
        .respond_with(
            ResponseTemplate::new(206)
                .set_body_bytes(payload[10..20].to_vec())
                .insert_header("Content-Range", "bytes 10-19/100"),
        )
        .expect(1)
        .mount(&server)
        .await;

    let store = store_for(&server);
    let body = read_all(&store, "media/clip.bin", 10, 10).await;
    assert_eq!(body, &payload[10..20]);
}

#[tokio::test]
async fn test_get_object_accepts_200_from_offset_zero() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/files/small.txt"))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(b"hello".to_vec()))
        .mount(&server)
        .await;

    let store = store_for(&server);
    assert_eq!(read_all(&store, "small.txt", 0, 5).await, b"hello");
}

#[tokio::test]
async fn test_get_object_rejects_200_for_mid_object_range() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(b"hello".to_vec()))
        .mount(&server)
        .await;

    let store = store_for(&server);
    let result = store.get_object("small.txt", 2, 3).await;
    assert!(matches!(result, Err(DownloadError::HttpError(_))));
}

#[tokio::test]
async fn test_object_keys_are_percent_encoded() {
    let server = MockServer::start().await;
    Mock::given(method("HEAD"))
        .and(path("/files/reports/annual%20report.pdf"))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(vec![0u8; 42]))
        .expect(1)
        .mount(&server)
        .await;

    let store = store_for(&server);
    let stat = store.stat_object("reports/annual report.pdf").await.unwrap();
    assert_eq!(stat.size, 42);
}

#[tokio::test]
async fn test_invalid_endpoint_is_config_error() {
    let config = OriginConfig {
        endpoint: "not a url".to_string(),
        ..Default::default()
    };
    assert!(matches!(
        HttpObjectStore::new(&config),
        Err(DownloadError::ConfigError(_))
    ));
}
