//! Service metrics and health reporting

use chrono::{DateTime, Utc};
use metrics::{
    describe_counter, describe_gauge, describe_histogram, register_counter, register_gauge,
    register_histogram, Counter, Gauge, Histogram,
};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use serde::Serialize;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use crate::error::CaptureError;

/// Handles for the counters and gauges the request pipeline touches.
pub struct Metrics {
    pub captures: Counter,
    pub captures_failed: Counter,
    pub capture_duration: Histogram,
    pub rejected_requests: Counter,
    pub direct_deliveries: Counter,
    pub callback_deliveries: Counter,
    pub delivery_failures: Counter,
    pub active_requests: Gauge,
}

impl Metrics {
    /// Bind handles against the globally installed recorder. Without a
    /// recorder (unit tests, the one-off CLI path) every handle is a no-op.
    pub fn new() -> Self {
        Self {
            captures: register_counter!("captures_total"),
            captures_failed: register_counter!("captures_failed_total"),
            capture_duration: register_histogram!("capture_duration_seconds"),
            rejected_requests: register_counter!("rejected_requests_total"),
            direct_deliveries: register_counter!("direct_deliveries_total"),
            callback_deliveries: register_counter!("callback_deliveries_total"),
            delivery_failures: register_counter!("delivery_failures_total"),
            active_requests: register_gauge!("active_requests"),
        }
    }

    pub fn record_capture(&self, duration: Duration, success: bool) {
        self.captures.increment(1);
        if !success {
            self.captures_failed.increment(1);
        }
        self.capture_duration.record(duration.as_secs_f64());
    }

    pub fn record_rejected(&self) {
        self.rejected_requests.increment(1);
    }

    pub fn record_direct_delivery(&self) {
        self.direct_deliveries.increment(1);
    }

    pub fn record_callback_delivery(&self) {
        self.callback_deliveries.increment(1);
    }

    pub fn record_delivery_failure(&self) {
        self.delivery_failures.increment(1);
    }

    pub fn request_started(&self) {
        self.active_requests.increment(1.0);
    }

    pub fn request_finished(&self) {
        self.active_requests.decrement(1.0);
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Install the Prometheus recorder and return the render handle for the
/// metrics endpoint. Call once, before any [`Metrics::new`].
pub fn install_recorder() -> Result<PrometheusHandle, CaptureError> {
    let handle = PrometheusBuilder::new().install_recorder().map_err(|e| {
        CaptureError::ConfigurationError(format!("Failed to install metrics recorder: {e}"))
    })?;

    describe_counter!("captures_total", "Capture attempts handed to the engine");
    describe_counter!("captures_failed_total", "Captures that ended in an error");
    describe_histogram!(
        "capture_duration_seconds",
        "Wall time per capture, cache hits included"
    );
    describe_counter!(
        "capture_cache_hits_total",
        "Captures answered from an existing artifact"
    );
    describe_counter!(
        "rejected_requests_total",
        "Requests refused by validation or the allow-list"
    );
    describe_counter!("direct_deliveries_total", "Artifacts streamed in-response");
    describe_counter!(
        "callback_deliveries_total",
        "Artifacts handed off for callback upload"
    );
    describe_counter!(
        "delivery_failures_total",
        "Deliveries that could not hand over the artifact"
    );
    describe_gauge!("active_requests", "Capture requests currently in flight");

    Ok(handle)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthLevel {
    Healthy,
    Warning,
    Critical,
}

/// Snapshot returned by the health endpoint.
#[derive(Debug, Clone, Serialize)]
pub struct HealthReport {
    pub status: HealthLevel,
    pub started_at: DateTime<Utc>,
    pub uptime_seconds: u64,
    pub requests_handled: u64,
    pub capture_failures: u64,
    pub storage_writable: bool,
    pub memory_usage_bytes: Option<u64>,
}

/// Liveness bookkeeping shared across the request pipeline.
pub struct ServiceHealth {
    started: Instant,
    started_at: DateTime<Utc>,
    requests: AtomicU64,
    capture_failures: AtomicU64,
    storage_dir: PathBuf,
}

impl ServiceHealth {
    pub fn new(storage_dir: PathBuf) -> Self {
        Self {
            started: Instant::now(),
            started_at: Utc::now(),
            requests: AtomicU64::new(0),
            capture_failures: AtomicU64::new(0),
            storage_dir,
        }
    }

    pub fn record_request(&self) {
        self.requests.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_capture_failure(&self) {
        self.capture_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn uptime(&self) -> Duration {
        self.started.elapsed()
    }

    pub async fn report(&self) -> HealthReport {
        let requests = self.requests.load(Ordering::Relaxed);
        let failures = self.capture_failures.load(Ordering::Relaxed);
        let storage_writable = self.storage_writable().await;

        let failure_rate = if requests > 0 {
            failures as f64 / requests as f64
        } else {
            0.0
        };

        // Rates are meaningless on a handful of requests.
        let status = if !storage_writable {
            HealthLevel::Critical
        } else if requests >= 10 && failure_rate > 0.5 {
            HealthLevel::Critical
        } else if requests >= 10 && failure_rate > 0.2 {
            HealthLevel::Warning
        } else {
            HealthLevel::Healthy
        };

        HealthReport {
            status,
            started_at: self.started_at,
            uptime_seconds: self.uptime().as_secs(),
            requests_handled: requests,
            capture_failures: failures,
            storage_writable,
            memory_usage_bytes: memory_usage_bytes(),
        }
    }

    async fn storage_writable(&self) -> bool {
        if tokio::fs::create_dir_all(&self.storage_dir).await.is_err() {
            return false;
        }
        let probe = self.storage_dir.join(".healthcheck");
        match tokio::fs::write(&probe, b"ok").await {
            Ok(()) => {
                let _ = tokio::fs::remove_file(&probe).await;
                true
            }
            Err(_) => false,
        }
    }
}

/// Resident set size from /proc/self/status, where available.
fn memory_usage_bytes() -> Option<u64> {
    let content = std::fs::read_to_string("/proc/self/status").ok()?;
    for line in content.lines() {
        if let Some(rest) = line.strip_prefix("VmRSS:") {
            let kb: u64 = rest.split_whitespace().next()?.parse().ok()?;
            return Some(kb * 1024);
        }
    }
    None
}
