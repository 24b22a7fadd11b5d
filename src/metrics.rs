//! Metrics Collection for hookdesk
//!
//! This module provides the counters and latency histogram behind `/metrics`
//! and `/status`:
//! - Atomic counters for delivery outcomes, audit failures and API traffic
//! - An HDR histogram of transport durations
//! - Prometheus-compatible text format export
//!
//! # Example
//!
//! ```rust,no_run
//! use hookdesk::metrics::Metrics;
//! use std::time::Duration;
//!
//! let metrics = Metrics::new();
//! metrics.record_attempt(true, Duration::from_millis(150));
//! let output = metrics.to_prometheus_format();
//! ```

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use hdrhistogram::Histogram;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

/// Metric name prefix
const PREFIX: &str = "hookdesk";

/// Request latency percentile metrics.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LatencyMetrics {
    /// 50th percentile (median) latency in milliseconds
    pub p50_ms: f64,

    /// 95th percentile latency in milliseconds
    pub p95_ms: f64,

    /// 99th percentile latency in milliseconds
    pub p99_ms: f64,

    /// Total number of samples recorded
    pub total: u64,

    /// Mean latency in milliseconds
    pub mean_ms: f64,

    /// Maximum latency recorded in milliseconds
    pub max_ms: f64,
}

/// Thread-safe latency histogram.
///
/// Tracks latencies from 1 microsecond to 10 minutes with 3 significant figures.
#[derive(Debug)]
pub struct LatencyHistogram {
    inner: Option<RwLock<Histogram<u64>>>,
}

impl LatencyHistogram {
    /// Create a new latency histogram.
    pub fn new() -> Self {
        let inner = match Histogram::new_with_bounds(1, 600_000_000, 3) {
            Ok(histogram) => Some(RwLock::new(histogram)),
            Err(e) => {
                tracing::error!(error = %e, "latency histogram disabled");
                None
            }
        };
        Self { inner }
    }

    /// Record a latency duration. Values outside the bounds are ignored.
    pub fn record_duration(&self, duration: Duration) {
        if let Some(inner) = &self.inner {
            let _ = inner.write().record(duration.as_micros() as u64);
        }
    }

    /// Get the total count of recorded values.
    pub fn count(&self) -> u64 {
        self.inner.as_ref().map_or(0, |h| h.read().len())
    }

    /// Percentiles in milliseconds
    pub fn metrics(&self) -> LatencyMetrics {
        let Some(inner) = &self.inner else {
            return LatencyMetrics::default();
        };
        let hist = inner.read();
        if hist.is_empty() {
            return LatencyMetrics::default();
        }
        LatencyMetrics {
            p50_ms: hist.value_at_percentile(50.0) as f64 / 1000.0,
            p95_ms: hist.value_at_percentile(95.0) as f64 / 1000.0,
            p99_ms: hist.value_at_percentile(99.0) as f64 / 1000.0,
            total: hist.len(),
            mean_ms: hist.mean() / 1000.0,
            max_ms: hist.max() as f64 / 1000.0,
        }
    }

    /// Reset the histogram, clearing all recorded values.
    pub fn reset(&self) {
        if let Some(inner) = &self.inner {
            inner.write().reset();
        }
    }
}

impl Default for LatencyHistogram {
    fn default() -> Self {
        Self::new()
    }
}

/// Metrics collection for hookdesk
///
/// Thread-safe collector using atomics and a lock around the labeled
/// breakdowns. Shared as `Arc<Metrics>`.
#[derive(Debug)]
pub struct Metrics {
    // === Delivery counters ===
    /// Transport attempts made (manual and scheduled)
    pub deliveries_attempted: AtomicU64,
    /// Attempts that ended in `success`
    pub deliveries_succeeded: AtomicU64,
    /// Attempts that scheduled a retry
    pub deliveries_retried: AtomicU64,
    /// Attempts that dead-lettered
    pub deliveries_dead: AtomicU64,
    /// Attempts lost to a concurrent commit
    pub delivery_conflicts: AtomicU64,

    // === Control plane ===
    /// Audit entries that could not be written
    pub audit_failures: AtomicU64,
    /// Authenticated API requests
    pub api_requests: AtomicU64,
    /// Rejected authentications
    pub auth_failures: AtomicU64,

    transport_latency: LatencyHistogram,
    errors_by_kind: RwLock<HashMap<String, u64>>,
    start_time: Instant,
}

impl Metrics {
    /// Create a new Metrics instance
    pub fn new() -> Self {
        Self {
            deliveries_attempted: AtomicU64::new(0),
            deliveries_succeeded: AtomicU64::new(0),
            deliveries_retried: AtomicU64::new(0),
            deliveries_dead: AtomicU64::new(0),
            delivery_conflicts: AtomicU64::new(0),
            audit_failures: AtomicU64::new(0),
            api_requests: AtomicU64::new(0),
            auth_failures: AtomicU64::new(0),
            transport_latency: LatencyHistogram::new(),
            errors_by_kind: RwLock::new(HashMap::new()),
            start_time: Instant::now(),
        }
    }

    /// Record one transport attempt and its duration
    pub fn record_attempt(&self, success: bool, duration: Duration) {
        self.deliveries_attempted.fetch_add(1, Ordering::Relaxed);
        if success {
            self.deliveries_succeeded.fetch_add(1, Ordering::Relaxed);
        }
        self.transport_latency.record_duration(duration);
    }

    /// Record that a failed attempt scheduled a retry
    pub fn record_retry(&self) {
        self.deliveries_retried.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a dead-lettered delivery
    pub fn record_dead_letter(&self) {
        self.deliveries_dead.fetch_add(1, Ordering::Relaxed);
    }

    /// Record an attempt whose commit lost the optimistic-concurrency race
    pub fn record_conflict(&self) {
        self.delivery_conflicts.fetch_add(1, Ordering::Relaxed);
    }

    /// Record an audit write failure
    pub fn record_audit_failure(&self) {
        self.audit_failures.fetch_add(1, Ordering::Relaxed);
    }

    /// Record an authenticated request
    pub fn record_api_request(&self) {
        self.api_requests.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a rejected authentication
    pub fn record_auth_failure(&self) {
        self.auth_failures.fetch_add(1, Ordering::Relaxed);
    }

    /// Record an API error by kind
    pub fn record_error(&self, kind: &str) {
        *self.errors_by_kind.write().entry(kind.to_string()).or_insert(0) += 1;
    }

    /// Transport latency percentiles
    pub fn transport_latency(&self) -> LatencyMetrics {
        self.transport_latency.metrics()
    }

    /// Seconds since the collector was created
    pub fn uptime_seconds(&self) -> u64 {
        self.start_time.elapsed().as_secs()
    }

    /// Convert metrics to Prometheus text format
    pub fn to_prometheus_format(&self) -> String {
        let counters = [
            ("deliveries_attempted_total", &self.deliveries_attempted),
            ("deliveries_succeeded_total", &self.deliveries_succeeded),
            ("deliveries_retried_total", &self.deliveries_retried),
            ("deliveries_dead_total", &self.deliveries_dead),
            ("delivery_conflicts_total", &self.delivery_conflicts),
            ("audit_failures_total", &self.audit_failures),
            ("api_requests_total", &self.api_requests),
            ("auth_failures_total", &self.auth_failures),
        ];

        let mut output = String::new();
        for (name, counter) in counters {
            output.push_str(&format!(
                "{PREFIX}_{name} {}\n",
                counter.load(Ordering::Relaxed)
            ));
        }

        let mut errors: Vec<(String, u64)> = self
            .errors_by_kind
            .read()
            .iter()
            .map(|(k, v)| (k.clone(), *v))
            .collect();
        errors.sort();
        for (kind, count) in errors {
            output.push_str(&format!(
                "{PREFIX}_api_errors_total{{kind=\"{kind}\"}} {count}\n"
            ));
        }

        let latency = self.transport_latency.metrics();
        if latency.total > 0 {
            output.push_str(&format!(
                "{PREFIX}_transport_duration_p50_ms {}\n",
                latency.p50_ms
            ));
            output.push_str(&format!(
                "{PREFIX}_transport_duration_p95_ms {}\n",
                latency.p95_ms
            ));
            output.push_str(&format!(
                "{PREFIX}_transport_duration_p99_ms {}\n",
                latency.p99_ms
            ));
        }

        output.push_str(&format!(
            "{PREFIX}_uptime_seconds {}\n",
            self.uptime_seconds()
        ));

        output
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}
