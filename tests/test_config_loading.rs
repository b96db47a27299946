use slice_download::{DownloadConfig, DownloadError};
use std::time::Duration;
use tempfile::TempDir;

#[test]
fn test_load_shipped_config() {
    let config = DownloadConfig::from_file("slice_download.yaml");
    assert!(config.is_ok(), "Failed to load shipped config: {:?}", config.err());

    let config = config.unwrap();
    assert_eq!(config.listen_address, "0.0.0.0:8080");
    assert_eq!(config.stream_direct_threshold, 64 * 1024 * 1024);
    assert_eq!(config.memory_promote_threshold, 16 * 1024 * 1024);
    assert_eq!(config.range_wait_timeout(), Duration::from_secs(360));
    assert_eq!(config.full_wait_timeout(), Duration::from_secs(900));
    assert_eq!(config.retry.max_attempts, 3);
    assert_eq!(config.origin.bucket, "files");
    assert_eq!(config.redis.as_ref().map(|r| r.url.as_str()), Some("redis://127.0.0.1:6379"));
}

#[test]
fn test_load_minimal_config() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("minimal.yaml");
    std::fs::write(&path, "listen_address: \"127.0.0.1:9090\"\n").unwrap();

    let config = DownloadConfig::from_file(&path).unwrap();
    assert_eq!(config.listen_address, "127.0.0.1:9090");
    // Check defaults are applied
    assert_eq!(config.retry.max_attempts, 3);
    assert_eq!(config.chunk_cache_ttl_secs, 600);
    assert!(config.redis.is_none());
    assert!(config.effective_pool_size() >= 4);
}

#[test]
fn test_load_invalid_config() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("invalid.yaml");
    std::fs::write(
        &path,
        "stream_direct_threshold: 1024\nmemory_promote_threshold: 4096\n",
    )
    .unwrap();

    let result = DownloadConfig::from_file(&path);
    assert!(
        matches!(result, Err(DownloadError::ConfigError(_))),
        "promote threshold above the stream threshold must be rejected"
    );
}

#[test]
fn test_load_nonexistent_file() {
    let config = DownloadConfig::from_file("nonexistent.yaml");
    assert!(config.is_err(), "Should fail when file doesn't exist");
}
