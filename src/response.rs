//! Download responses: headers, bodies and streaming from the disk cache

use crate::error::{DownloadError, Result};
use crate::metrics::DownloadMetrics;
use crate::models::{FileRecord, ObjectStat};
use bytes::{Bytes, BytesMut};
use http::{HeaderMap, HeaderValue, StatusCode};
use hyper::body::{Body, Frame, SizeHint};
use std::fmt::Write;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio::io::AsyncReadExt;
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// Read size when streaming a disk cache file
pub const STREAM_BUFFER_SIZE: usize = 64 * 1024;

const STREAM_CHANNEL_DEPTH: usize = 4;

/// A response produced by the download service, independent of the server
pub struct DownloadResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: ResponseBody,
}

impl DownloadResponse {
    pub fn new(status: StatusCode, headers: HeaderMap, body: ResponseBody) -> Self {
        DownloadResponse {
            status,
            headers,
            body,
        }
    }

    /// Plain-text error response for `err`
    ///
    /// A 416 carries `Content-Range: bytes */<total>`.
    pub fn from_error(err: &DownloadError) -> Self {
        let status =
            StatusCode::from_u16(err.to_http_status()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        let mut headers = HeaderMap::new();
        headers.insert("content-type", HeaderValue::from_static("text/plain; charset=utf-8"));

        if let DownloadError::RangeNotSatisfiable { total, .. } = err {
            headers.insert("accept-ranges", HeaderValue::from_static("bytes"));
            if let Ok(value) = HeaderValue::from_str(&format!("bytes */{}", total)) {
                headers.insert("content-range", value);
            }
        }

        let body = Bytes::from(format!("{}\n", err));
        if let Ok(value) = HeaderValue::from_str(&body.len().to_string()) {
            headers.insert("content-length", value);
        }

        DownloadResponse {
            status,
            headers,
            body: ResponseBody::full(body),
        }
    }

    /// Value of the Content-Length header, if set
    pub fn content_length(&self) -> Option<u64> {
        self.headers
            .get("content-length")
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse().ok())
    }

    /// Same status and headers without a body, for HEAD
    pub fn without_body(self) -> Self {
        if let ResponseBody::File(mut file) = self.body {
            file.failed = true;
        }
        DownloadResponse {
            status: self.status,
            headers: self.headers,
            body: ResponseBody::Empty,
        }
    }

    pub fn into_http(self) -> http::Response<ResponseBody> {
        let mut response = http::Response::new(self.body);
        *response.status_mut() = self.status;
        *response.headers_mut() = self.headers;
        response
    }
}

/// Headers of a successful 200/206 download
///
/// # Arguments
/// * `record` - File record supplying the display name
/// * `stat` - Object stat supplying validators
/// * `content_length` - Bytes in this response body
/// * `content_range` - Content-Range value for a 206, `None` for a 200
pub fn payload_headers(
    record: &FileRecord,
    stat: &ObjectStat,
    content_length: u64,
    content_range: Option<String>,
) -> Result<HeaderMap> {
    let invalid = |e: http::header::InvalidHeaderValue| {
        DownloadError::InternalError(format!("Invalid header value: {}", e))
    };
    let mut headers = HeaderMap::new();

    headers.insert("accept-ranges", HeaderValue::from_static("bytes"));
    headers.insert("content-type", HeaderValue::from_static("application/octet-stream"));
    headers.insert(
        "content-length",
        HeaderValue::from_str(&content_length.to_string()).map_err(invalid)?,
    );
    if let Some(content_range) = content_range {
        headers.insert("content-range", HeaderValue::from_str(&content_range).map_err(invalid)?);
    }
    // a store that reports no validator gets none, rather than an empty one
    if !stat.etag.is_empty() {
        headers.insert(
            "etag",
            HeaderValue::from_str(&format!("\"{}\"", stat.etag)).map_err(invalid)?,
        );
    }
    if !stat.last_modified.is_empty() {
        headers.insert("last-modified", HeaderValue::from_str(&stat.last_modified).map_err(invalid)?);
    }
    headers.insert(
        "content-disposition",
        HeaderValue::from_str(&content_disposition(&record.origin_filename)).map_err(invalid)?,
    );

    Ok(headers)
}

/// `attachment` disposition carrying `filename` safely over HTTP/1
///
/// Emits an ASCII `filename` fallback plus the RFC 5987 `filename*` form so
/// non-ASCII names survive.
pub fn content_disposition(filename: &str) -> String {
    let fallback: String = filename
        .chars()
        .map(|c| match c {
            '"' | '\\' => '_',
            c if c == ' ' || c.is_ascii_graphic() => c,
            _ => '_',
        })
        .collect();

    let mut encoded = String::with_capacity(filename.len() * 3);
    for byte in filename.bytes() {
        if byte.is_ascii_alphanumeric() || b"!#$&+-.^_`|~".contains(&byte) {
            encoded.push(byte as char);
        } else {
            let _ = write!(encoded, "%{:02X}", byte);
        }
    }

    format!("attachment; filename=\"{}\"; filename*=UTF-8''{}", fallback, encoded)
}

/// Body of a download response
pub enum ResponseBody {
    Empty,
    Full(Option<Bytes>),
    File(FileBody),
}

impl ResponseBody {
    pub fn full(data: Bytes) -> Self {
        if data.is_empty() {
            ResponseBody::Empty
        } else {
            ResponseBody::Full(Some(data))
        }
    }
}

impl Body for ResponseBody {
    type Data = Bytes;
    type Error = DownloadError;

    fn poll_frame(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<std::result::Result<Frame<Bytes>, DownloadError>>> {
        match self.get_mut() {
            ResponseBody::Empty => Poll::Ready(None),
            ResponseBody::Full(data) => Poll::Ready(data.take().map(|d| Ok(Frame::data(d)))),
            ResponseBody::File(file) => file.poll_chunk(cx),
        }
    }

    fn is_end_stream(&self) -> bool {
        match self {
            ResponseBody::Empty => true,
            ResponseBody::Full(data) => data.is_none(),
            ResponseBody::File(file) => file.remaining == 0,
        }
    }

    fn size_hint(&self) -> SizeHint {
        match self {
            ResponseBody::Empty => SizeHint::with_exact(0),
            ResponseBody::Full(data) => {
                SizeHint::with_exact(data.as_ref().map(|d| d.len() as u64).unwrap_or(0))
            }
            ResponseBody::File(file) => SizeHint::with_exact(file.remaining),
        }
    }
}

/// Streams an opened disk cache file to the client
///
/// A reader task feeds a small channel so the file is never buffered whole.
/// Dropping the body before the last byte was handed out counts as a client
/// abort; it only affects this request.
pub struct FileBody {
    rx: mpsc::Receiver<Result<Bytes>>,
    remaining: u64,
    label: String,
    metrics: Arc<DownloadMetrics>,
    failed: bool,
}

impl FileBody {
    /// Must be called within a tokio runtime
    pub fn new(file: tokio::fs::File, len: u64, label: String, metrics: Arc<DownloadMetrics>) -> Self {
        let (tx, rx) = mpsc::channel(STREAM_CHANNEL_DEPTH);
        tokio::spawn(Self::pump(file, len, tx));
        FileBody {
            rx,
            remaining: len,
            label,
            metrics,
            failed: false,
        }
    }

    async fn pump(file: tokio::fs::File, len: u64, tx: mpsc::Sender<Result<Bytes>>) {
        let mut reader = file.take(len);
        let mut sent = 0u64;

        while sent < len {
            let mut buf = BytesMut::with_capacity(STREAM_BUFFER_SIZE);
            let chunk = match reader.read_buf(&mut buf).await {
                Ok(0) => Err(DownloadError::ShortRead {
                    expected: len,
                    actual: sent,
                }),
                Ok(n) => {
                    sent += n as u64;
                    Ok(buf.freeze())
                }
                Err(e) => Err(DownloadError::from(e)),
            };
            let stop = chunk.is_err();
            if tx.send(chunk).await.is_err() || stop {
                return;
            }
        }
    }

    fn poll_chunk(
        &mut self,
        cx: &mut Context<'_>,
    ) -> Poll<Option<std::result::Result<Frame<Bytes>, DownloadError>>> {
        if self.remaining == 0 {
            return Poll::Ready(None);
        }
        match self.rx.poll_recv(cx) {
            Poll::Ready(Some(Ok(chunk))) => {
                let n = chunk.len() as u64;
                self.remaining = self.remaining.saturating_sub(n);
                self.metrics.record_bytes_to_client(n);
                Poll::Ready(Some(Ok(Frame::data(chunk))))
            }
            Poll::Ready(Some(Err(e))) => {
                self.failed = true;
                warn!("Streaming {} failed: {}", self.label, e);
                Poll::Ready(Some(Err(e)))
            }
            Poll::Ready(None) => {
                self.failed = true;
                Poll::Ready(Some(Err(DownloadError::InternalError(format!(
                    "reader for {} stopped early",
                    self.label
                )))))
            }
            Poll::Pending => Poll::Pending,
        }
    }
}

impl Drop for FileBody {
    fn drop(&mut self) {
        if self.remaining == 0 {
            debug!("Finished streaming {}", self.label);
        } else if !self.failed {
            let abort = DownloadError::ClientAbort(self.label.clone());
            warn!("{} with {} bytes left", abort, self.remaining);
            self.metrics.record_client_abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use http_body_util::BodyExt;

    fn record(name: &str) -> FileRecord {
        FileRecord {
            id: 1,
            object_key: "k".to_string(),
            bucket: "files".to_string(),
            origin_filename: name.to_string(),
            md5: String::new(),
            size: 10,
            content_type: None,
            created_at: None,
        }
    }

    fn stat() -> ObjectStat {
        ObjectStat {
            object_key: "k".to_string(),
            size: 10,
            etag: "abc123".to_string(),
            last_modified: "Mon, 06 Jan 2025 08:00:00 GMT".to_string(),
        }
    }

    #[test]
    fn test_payload_headers_partial() {
        let headers =
            payload_headers(&record("a.bin"), &stat(), 5, Some("bytes 0-4/10".to_string())).unwrap();
        assert_eq!(headers["accept-ranges"], "bytes");
        assert_eq!(headers["content-length"], "5");
        assert_eq!(headers["content-range"], "bytes 0-4/10");
        assert_eq!(headers["etag"], "\"abc123\"");
        assert_eq!(headers["content-type"], "application/octet-stream");
        assert_eq!(headers["last-modified"], "Mon, 06 Jan 2025 08:00:00 GMT");
    }

    #[test]
    fn test_payload_headers_full_has_no_range() {
        let headers = payload_headers(&record("a.bin"), &stat(), 10, None).unwrap();
        assert!(headers.get("content-range").is_none());
    }

    #[test]
    fn test_payload_headers_skip_unknown_validators() {
        let bare = ObjectStat {
            etag: String::new(),
            last_modified: String::new(),
            ..stat()
        };
        let headers = payload_headers(&record("a.bin"), &bare, 10, None).unwrap();
        assert!(headers.get("etag").is_none());
        assert!(headers.get("last-modified").is_none());
        assert_eq!(headers["content-length"], "10");
        assert!(headers.get("content-disposition").is_some());
    }

    #[test]
    fn test_content_disposition_non_ascii() {
        let value = content_disposition("年报 2024.pdf");
        assert!(value.starts_with("attachment; filename=\"__ 2024.pdf\""));
        assert!(value.ends_with("filename*=UTF-8''%E5%B9%B4%E6%8A%A5%202024.pdf"));
        assert!(HeaderValue::from_str(&value).is_ok());
    }

    #[test]
    fn test_content_disposition_quotes() {
        let value = content_disposition("say \"hi\".txt");
        assert!(value.contains("filename=\"say _hi_.txt\""));
        assert!(value.contains("say%20%22hi%22.txt"));
    }

    #[test]
    fn test_error_response_416() {
        let err = DownloadError::RangeNotSatisfiable { start: 500, end: 100, total: 1000 };
        let response = DownloadResponse::from_error(&err);
        assert_eq!(response.status, StatusCode::RANGE_NOT_SATISFIABLE);
        assert_eq!(response.headers["content-range"], "bytes */1000");
    }

    #[test]
    fn test_error_response_504() {
        let response = DownloadResponse::from_error(&DownloadError::Timeout("k".into()));
        assert_eq!(response.status, StatusCode::GATEWAY_TIMEOUT);
    }

    #[tokio::test]
    async fn test_file_body_streams_everything() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("payload");
        let data: Vec<u8> = (0..200_000u32).map(|i| (i % 251) as u8).collect();
        tokio::fs::write(&path, &data).await.unwrap();

        let metrics = Arc::new(DownloadMetrics::new());
        let file = tokio::fs::File::open(&path).await.unwrap();
        let body = ResponseBody::File(FileBody::new(file, data.len() as u64, "k".into(), metrics.clone()));
        assert_eq!(body.size_hint().exact(), Some(200_000));

        let collected = body.collect().await.unwrap().to_bytes();
        assert_eq!(collected.as_ref(), data.as_slice());
        let stats = metrics.get_stats();
        assert_eq!(stats.bytes_to_client, 200_000);
        assert_eq!(stats.client_aborts, 0);
    }

    #[tokio::test]
    async fn test_file_body_shorter_than_expected_fails() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("payload");
        tokio::fs::write(&path, b"short").await.unwrap();

        let metrics = Arc::new(DownloadMetrics::new());
        let file = tokio::fs::File::open(&path).await.unwrap();
        let body = ResponseBody::File(FileBody::new(file, 10, "k".into(), metrics.clone()));
        assert!(body.collect().await.is_err());
        assert_eq!(metrics.get_stats().client_aborts, 0);
    }

    #[tokio::test]
    async fn test_dropped_file_body_is_client_abort() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("payload");
        tokio::fs::write(&path, vec![7u8; 300_000]).await.unwrap();

        let metrics = Arc::new(DownloadMetrics::new());
        let file = tokio::fs::File::open(&path).await.unwrap();
        let mut body = ResponseBody::File(FileBody::new(file, 300_000, "k".into(), metrics.clone()));
        let first = body.frame().await.unwrap().unwrap();
        assert!(first.is_data());
        drop(body);

        assert_eq!(metrics.get_stats().client_aborts, 1);
    }
}
