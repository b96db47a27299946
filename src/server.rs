//! HTTP front end
//!
//! Routes:
//! - `GET /files/download/{id}`: range download, 206 (no Range means `bytes=0-`)
//! - `GET /files/downloadForWindows/{id}`: 200 full download, or 206 with a Range header
//! - `GET /metrics`: Prometheus text
//! - `GET /health`: JSON status
//!
//! `HEAD` is accepted wherever `GET` is and returns the same headers.

use crate::download_service::DownloadService;
use crate::error::{DownloadError, Result};
use crate::response::{DownloadResponse, ResponseBody};
use bytes::Bytes;
use http::{HeaderMap, HeaderValue, Method, Request, Response, StatusCode};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper_util::rt::TokioIo;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

const RANGE_PREFIX: &str = "/files/download/";
const FULL_PREFIX: &str = "/files/downloadForWindows/";

#[derive(Debug, PartialEq, Eq)]
enum Route<'a> {
    Range(&'a str),
    Windows(&'a str),
    Metrics,
    Health,
    NotFound,
}

fn match_route(path: &str) -> Route<'_> {
    if let Some(id) = path.strip_prefix(RANGE_PREFIX) {
        return Route::Range(id);
    }
    if let Some(id) = path.strip_prefix(FULL_PREFIX) {
        return Route::Windows(id);
    }
    match path {
        "/metrics" => Route::Metrics,
        "/health" => Route::Health,
        _ => Route::NotFound,
    }
}

fn parse_id(raw: &str) -> Result<i64> {
    raw.parse::<i64>()
        .map_err(|_| DownloadError::ParseError(format!("invalid file id {:?}", raw)))
}

/// Answer one request
pub async fn route<B>(service: &DownloadService, req: &Request<B>) -> DownloadResponse {
    let method = req.method();
    let path = req.uri().path();
    let route = match_route(path);

    if route == Route::NotFound {
        return text_response(StatusCode::NOT_FOUND, "404 Not Found\n");
    }
    if method != Method::GET && method != Method::HEAD {
        let mut response = text_response(StatusCode::METHOD_NOT_ALLOWED, "405 Method Not Allowed\n");
        response
            .headers
            .insert("allow", HeaderValue::from_static("GET, HEAD"));
        return response;
    }

    let range_header = req
        .headers()
        .get("range")
        .and_then(|v| v.to_str().ok())
        .map(|v| v.to_string());

    let response = match route {
        Route::Range(raw) => match parse_id(raw) {
            Ok(id) => service.handle_range(id, range_header.as_deref()).await,
            Err(e) => DownloadResponse::from_error(&e),
        },
        Route::Windows(raw) => match parse_id(raw) {
            Ok(id) => match range_header.as_deref() {
                Some(range) => service.handle_range(id, Some(range)).await,
                None => service.handle_full(id).await,
            },
            Err(e) => DownloadResponse::from_error(&e),
        },
        Route::Metrics => metrics_response(service),
        Route::Health => health_response(service),
        Route::NotFound => text_response(StatusCode::NOT_FOUND, "404 Not Found\n"),
    };

    if method == Method::HEAD {
        response.without_body()
    } else {
        response
    }
}

fn text_response(status: StatusCode, body: &'static str) -> DownloadResponse {
    let mut headers = HeaderMap::new();
    headers.insert("content-type", HeaderValue::from_static("text/plain; charset=utf-8"));
    headers.insert("content-length", HeaderValue::from(body.len()));
    DownloadResponse::new(status, headers, ResponseBody::full(Bytes::from_static(body.as_bytes())))
}

fn metrics_response(service: &DownloadService) -> DownloadResponse {
    let mut body = service.metrics().get_stats().to_prometheus();
    let files = service.file_cache().get_stats();
    let stats = service.stat_cache().get_stats();

    let gauges = [
        ("in_flight_fetches", "Fetches currently in flight", service.inflight().in_flight_count() as u64),
        ("chunk_cache_entries", "Payloads held in the memory cache", service.chunk_cache().entry_count()),
        ("file_cache_entries", "File records held locally", files.l1_entries),
        ("stat_cache_entries", "Object stats held locally", stats.l1_entries),
    ];
    for (name, help, value) in gauges {
        body.push_str(&format!(
            "# HELP slice_download_{name} {help}\n# TYPE slice_download_{name} gauge\nslice_download_{name} {value}\n\n"
        ));
    }

    let mut headers = HeaderMap::new();
    headers.insert(
        "content-type",
        HeaderValue::from_static("text/plain; version=0.0.4; charset=utf-8"),
    );
    headers.insert("content-length", HeaderValue::from(body.len()));
    DownloadResponse::new(StatusCode::OK, headers, ResponseBody::full(Bytes::from(body)))
}

fn health_response(service: &DownloadService) -> DownloadResponse {
    let body = serde_json::json!({
        "status": "healthy",
        "in_flight": service.inflight().in_flight_count(),
    })
    .to_string();

    let mut headers = HeaderMap::new();
    headers.insert("content-type", HeaderValue::from_static("application/json"));
    headers.insert("content-length", HeaderValue::from(body.len()));
    DownloadResponse::new(StatusCode::OK, headers, ResponseBody::full(Bytes::from(body)))
}

/// Accept connections on `listener` until `shutdown` fires
///
/// Open connections are asked to finish their current response and close.
pub async fn serve(
    listener: TcpListener,
    service: Arc<DownloadService>,
    shutdown: CancellationToken,
) -> Result<()> {
    let addr = listener.local_addr()?;
    info!("Download server listening on http://{}", addr);

    loop {
        let (stream, peer) = tokio::select! {
            _ = shutdown.cancelled() => {
                info!("Download server stopping");
                return Ok(());
            }
            accepted = listener.accept() => match accepted {
                Ok(accepted) => accepted,
                Err(e) => {
                    warn!("Failed to accept connection: {}", e);
                    continue;
                }
            },
        };

        let service = Arc::clone(&service);
        let shutdown = shutdown.clone();
        tokio::spawn(serve_connection(stream, peer, service, shutdown));
    }
}

async fn serve_connection(
    stream: tokio::net::TcpStream,
    peer: SocketAddr,
    service: Arc<DownloadService>,
    shutdown: CancellationToken,
) {
    let io = TokioIo::new(stream);
    let handler = service_fn(move |req: Request<hyper::body::Incoming>| {
        let service = Arc::clone(&service);
        async move {
            debug!("{} {} from {}", req.method(), req.uri(), peer);
            // downloads never read a request body
            let (parts, _) = req.into_parts();
            let req = Request::from_parts(parts, ());
            let response: Response<ResponseBody> = route(&service, &req).await.into_http();
            Ok::<_, Infallible>(response)
        }
    });

    let conn = http1::Builder::new().serve_connection(io, handler);
    tokio::pin!(conn);

    let result = tokio::select! {
        result = conn.as_mut() => result,
        _ = shutdown.cancelled() => {
            conn.as_mut().graceful_shutdown();
            conn.await
        }
    };
    if let Err(err) = result {
        if err.is_incomplete_message() || err.is_canceled() {
            debug!("Connection from {} closed early: {}", peer, err);
        } else {
            error!("Error serving connection from {}: {:?}", peer, err);
        }
    }
}
