//! Metrics collection for the download service
//!
//! Thread-safe counters built on atomics. They track requests, cache tiers,
//! in-flight dedup, origin fetches and bytes moved, and render in the
//! Prometheus text format for `/metrics`.

use std::fmt::Write;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

/// Which handler served a request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestKind {
    Range,
    Full,
}

/// Metrics collector for the download service
#[derive(Debug, Default)]
pub struct DownloadMetrics {
    // Request statistics
    range_requests: AtomicU64,
    full_requests: AtomicU64,
    not_satisfiable: AtomicU64,
    failed_requests: AtomicU64,
    timeouts: AtomicU64,
    client_aborts: AtomicU64,

    // Cache statistics
    memory_hits: AtomicU64,
    disk_hits: AtomicU64,
    cache_misses: AtomicU64,
    dedup_joins: AtomicU64,

    // Origin statistics
    origin_fetches: AtomicU64,
    failed_origin_fetches: AtomicU64,
    fetch_retries: AtomicU64,

    // Byte statistics
    bytes_from_origin: AtomicU64,
    bytes_from_cache: AtomicU64,
    bytes_to_client: AtomicU64,

    // Latency statistics (stored as microseconds)
    total_request_duration_us: AtomicU64,
    total_fetch_duration_us: AtomicU64,
}

/// Snapshot of metrics at a point in time
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MetricsSnapshot {
    pub range_requests: u64,
    pub full_requests: u64,
    pub not_satisfiable: u64,
    pub failed_requests: u64,
    pub timeouts: u64,
    pub client_aborts: u64,

    pub memory_hits: u64,
    pub disk_hits: u64,
    pub cache_misses: u64,
    pub dedup_joins: u64,

    pub origin_fetches: u64,
    pub failed_origin_fetches: u64,
    pub fetch_retries: u64,

    pub bytes_from_origin: u64,
    pub bytes_from_cache: u64,
    pub bytes_to_client: u64,

    pub total_request_duration_us: u64,
    pub total_fetch_duration_us: u64,
}

impl DownloadMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_request(&self, kind: RequestKind) {
        match kind {
            RequestKind::Range => self.range_requests.fetch_add(1, Ordering::Relaxed),
            RequestKind::Full => self.full_requests.fetch_add(1, Ordering::Relaxed),
        };
    }

    /// Record the status of a finished request
    pub fn record_status(&self, status: u16) {
        match status {
            416 => {
                self.not_satisfiable.fetch_add(1, Ordering::Relaxed);
            }
            504 => {
                self.timeouts.fetch_add(1, Ordering::Relaxed);
            }
            s if s >= 500 => {
                self.failed_requests.fetch_add(1, Ordering::Relaxed);
            }
            _ => {}
        }
    }

    pub fn record_client_abort(&self) {
        self.client_aborts.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_memory_hit(&self) {
        self.memory_hits.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_disk_hit(&self) {
        self.disk_hits.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_cache_miss(&self) {
        self.cache_misses.fetch_add(1, Ordering::Relaxed);
    }

    /// A miss that joined a fetch already in flight
    pub fn record_dedup_join(&self) {
        self.dedup_joins.fetch_add(1, Ordering::Relaxed);
    }

    /// Record one origin fetch attempt
    pub fn record_origin_fetch(&self, success: bool) {
        self.origin_fetches.fetch_add(1, Ordering::Relaxed);
        if !success {
            self.failed_origin_fetches.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn record_fetch_retry(&self) {
        self.fetch_retries.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_bytes_from_origin(&self, bytes: u64) {
        self.bytes_from_origin.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn record_bytes_from_cache(&self, bytes: u64) {
        self.bytes_from_cache.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn record_bytes_to_client(&self, bytes: u64) {
        self.bytes_to_client.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn record_request_duration(&self, duration: Duration) {
        self.total_request_duration_us
            .fetch_add(duration.as_micros() as u64, Ordering::Relaxed);
    }

    pub fn record_fetch_duration(&self, duration: Duration) {
        self.total_fetch_duration_us
            .fetch_add(duration.as_micros() as u64, Ordering::Relaxed);
    }

    /// Get a snapshot of current metrics
    ///
    /// Fields are loaded one by one, so a snapshot taken under load may not
    /// be perfectly consistent across fields.
    pub fn get_stats(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            range_requests: self.range_requests.load(Ordering::Relaxed),
            full_requests: self.full_requests.load(Ordering::Relaxed),
            not_satisfiable: self.not_satisfiable.load(Ordering::Relaxed),
            failed_requests: self.failed_requests.load(Ordering::Relaxed),
            timeouts: self.timeouts.load(Ordering::Relaxed),
            client_aborts: self.client_aborts.load(Ordering::Relaxed),
            memory_hits: self.memory_hits.load(Ordering::Relaxed),
            disk_hits: self.disk_hits.load(Ordering::Relaxed),
            cache_misses: self.cache_misses.load(Ordering::Relaxed),
            dedup_joins: self.dedup_joins.load(Ordering::Relaxed),
            origin_fetches: self.origin_fetches.load(Ordering::Relaxed),
            failed_origin_fetches: self.failed_origin_fetches.load(Ordering::Relaxed),
            fetch_retries: self.fetch_retries.load(Ordering::Relaxed),
            bytes_from_origin: self.bytes_from_origin.load(Ordering::Relaxed),
            bytes_from_cache: self.bytes_from_cache.load(Ordering::Relaxed),
            bytes_to_client: self.bytes_to_client.load(Ordering::Relaxed),
            total_request_duration_us: self.total_request_duration_us.load(Ordering::Relaxed),
            total_fetch_duration_us: self.total_fetch_duration_us.load(Ordering::Relaxed),
        }
    }
}

impl MetricsSnapshot {
    pub fn total_requests(&self) -> u64 {
        self.range_requests + self.full_requests
    }

    /// Cache hit rate as a percentage (0.0 to 100.0)
    pub fn cache_hit_rate(&self) -> f64 {
        let hits = self.memory_hits + self.disk_hits;
        let total = hits + self.cache_misses;
        if total == 0 {
            0.0
        } else {
            (hits as f64 / total as f64) * 100.0
        }
    }

    pub fn avg_request_duration_ms(&self) -> f64 {
        let total = self.total_requests();
        if total == 0 {
            0.0
        } else {
            (self.total_request_duration_us as f64 / total as f64) / 1000.0
        }
    }

    pub fn avg_fetch_duration_ms(&self) -> f64 {
        let ok = self.origin_fetches - self.failed_origin_fetches.min(self.origin_fetches);
        if ok == 0 {
            0.0
        } else {
            (self.total_fetch_duration_us as f64 / ok as f64) / 1000.0
        }
    }

    /// Render in Prometheus exposition format
    pub fn to_prometheus(&self) -> String {
        let mut out = String::new();

        let counters: [(&str, &str, u64); 16] = [
            ("range_requests_total", "Requests served by the range handler", self.range_requests),
            ("full_requests_total", "Requests served by the full-object handler", self.full_requests),
            ("range_not_satisfiable_total", "Requests answered with 416", self.not_satisfiable),
            ("failed_requests_total", "Requests answered with a 5xx other than 504", self.failed_requests),
            ("timeouts_total", "Requests answered with 504", self.timeouts),
            ("client_aborts_total", "Downloads the client abandoned mid-stream", self.client_aborts),
            ("memory_hits_total", "Payloads served from the memory cache", self.memory_hits),
            ("disk_hits_total", "Payloads served from the disk cache", self.disk_hits),
            ("cache_misses_total", "Payloads that needed an origin fetch", self.cache_misses),
            ("dedup_joins_total", "Misses that joined a fetch already in flight", self.dedup_joins),
            ("origin_fetches_total", "Origin fetch attempts", self.origin_fetches),
            ("failed_origin_fetches_total", "Failed origin fetch attempts", self.failed_origin_fetches),
            ("fetch_retries_total", "Origin fetch retries", self.fetch_retries),
            ("bytes_from_origin_total", "Bytes received from the origin", self.bytes_from_origin),
            ("bytes_from_cache_total", "Bytes served from the caches", self.bytes_from_cache),
            ("bytes_to_client_total", "Bytes sent to clients", self.bytes_to_client),
        ];
        for (name, help, value) in counters {
            let _ = writeln!(out, "# HELP slice_download_{} {}", name, help);
            let _ = writeln!(out, "# TYPE slice_download_{} counter", name);
            let _ = writeln!(out, "slice_download_{} {}\n", name, value);
        }

        let gauges: [(&str, &str, f64); 3] = [
            ("cache_hit_rate", "Cache hit rate percentage", self.cache_hit_rate()),
            ("request_duration_ms_avg", "Average request duration in milliseconds", self.avg_request_duration_ms()),
            ("fetch_duration_ms_avg", "Average origin fetch duration in milliseconds", self.avg_fetch_duration_ms()),
        ];
        for (name, help, value) in gauges {
            let _ = writeln!(out, "# HELP slice_download_{} {}", name, help);
            let _ = writeln!(out, "# TYPE slice_download_{} gauge", name);
            let _ = writeln!(out, "slice_download_{} {:.2}\n", name, value);
        }

        out
    }
}
