///! Metrics and telemetry for the insights store
///!
///! Prometheus collectors for the write path, aggregation queries,
///! augmentation and deletes.

use lazy_static::lazy_static;
use prometheus::{
    register_counter, register_counter_vec, register_histogram, register_histogram_vec, Counter,
    CounterVec, Encoder, Histogram, HistogramVec, TextEncoder,
};
use std::sync::atomic::{AtomicBool, Ordering};

use crate::error::{Error, Result};

static ENABLED: AtomicBool = AtomicBool::new(true);

lazy_static! {
    // === Write Path ===

    /// Samples written per tier
    pub static ref SAMPLES_WRITTEN_TOTAL: CounterVec = register_counter_vec!(
        "insights_samples_written_total",
        "Total samples written",
        &["tier"]
    ).unwrap();

    /// Recording times submitted (duplicates included)
    pub static ref RECORDING_TIMES_WRITTEN_TOTAL: Counter = register_counter!(
        "insights_recording_times_written_total",
        "Total recording times submitted"
    ).unwrap();

    /// Repository name resolutions by outcome
    pub static ref REPO_NAMES_RESOLVED_TOTAL: CounterVec = register_counter_vec!(
        "insights_repo_names_resolved_total",
        "Repository name resolutions",
        &["outcome"]
    ).unwrap();

    /// Write batch duration
    pub static ref WRITE_DURATION: Histogram = register_histogram!(
        "insights_write_duration_seconds",
        "Write batch latency in seconds",
        vec![0.001, 0.01, 0.1, 0.5, 1.0, 5.0]
    ).unwrap();

    // === Read Path ===

    /// Aggregate queries by strategy and status
    pub static ref QUERIES_TOTAL: CounterVec = register_counter_vec!(
        "insights_queries_total",
        "Total aggregate queries",
        &["strategy", "status"]
    ).unwrap();

    /// Aggregate query duration
    pub static ref QUERY_DURATION: HistogramVec = register_histogram_vec!(
        "insights_query_duration_seconds",
        "Aggregate query latency in seconds",
        &["strategy"],
        vec![0.001, 0.01, 0.1, 0.5, 1.0, 5.0]
    ).unwrap();

    /// Merged deny-list size per query
    pub static ref DENY_LIST_SIZE: Histogram = register_histogram!(
        "insights_deny_list_size",
        "Number of excluded repositories per query",
        vec![0.0, 1.0, 10.0, 100.0, 1_000.0, 10_000.0, 100_000.0]
    ).unwrap();

    /// Zero points synthesized by augmentation
    pub static ref AUGMENTED_POINTS_TOTAL: Counter = register_counter!(
        "insights_augmented_points_total",
        "Total zero-valued points synthesized"
    ).unwrap();

    // === Maintenance ===

    /// Rows removed per delete kind
    pub static ref DELETED_ROWS_TOTAL: CounterVec = register_counter_vec!(
        "insights_deleted_rows_total",
        "Rows removed by deletes",
        &["kind"]
    ).unwrap();

    // === Errors ===

    /// Total errors by type
    pub static ref ERRORS_TOTAL: CounterVec = register_counter_vec!(
        "insights_errors_total",
        "Total errors by type and operation",
        &["error_type", "operation"]
    ).unwrap();
}

/// Turn metric recording on or off
pub fn set_enabled(enabled: bool) {
    ENABLED.store(enabled, Ordering::Relaxed);
}

#[inline]
fn enabled() -> bool {
    ENABLED.load(Ordering::Relaxed)
}

/// Get metrics in Prometheus text format
pub fn gather_metrics() -> Result<String> {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = vec![];

    encoder
        .encode(&metric_families, &mut buffer)
        .map_err(|e| Error::Configuration(format!("Failed to encode metrics: {}", e)))?;

    String::from_utf8(buffer)
        .map_err(|e| Error::Configuration(format!("Metrics contain invalid UTF-8: {}", e)))
}

/// Record a committed write batch
#[inline]
pub fn record_write(recorded: usize, snapshot: usize, duration_secs: f64) {
    if !enabled() {
        return;
    }
    SAMPLES_WRITTEN_TOTAL
        .with_label_values(&["recorded"])
        .inc_by(recorded as f64);
    SAMPLES_WRITTEN_TOTAL
        .with_label_values(&["snapshot"])
        .inc_by(snapshot as f64);
    WRITE_DURATION.observe(duration_secs);
}

/// Record submitted recording times
#[inline]
pub fn record_recording_times(count: usize) {
    if enabled() {
        RECORDING_TIMES_WRITTEN_TOTAL.inc_by(count as f64);
    }
}

/// Record a repository name resolution
#[inline]
pub fn record_repo_name(inserted: bool) {
    if enabled() {
        let outcome = if inserted { "inserted" } else { "existing" };
        REPO_NAMES_RESOLVED_TOTAL.with_label_values(&[outcome]).inc();
    }
}

/// Record an aggregate query
#[inline]
pub fn record_query(strategy: &str, deny_len: usize, duration_secs: f64, success: bool) {
    if !enabled() {
        return;
    }
    let status = if success { "success" } else { "error" };
    QUERIES_TOTAL.with_label_values(&[strategy, status]).inc();
    QUERY_DURATION
        .with_label_values(&[strategy])
        .observe(duration_secs);
    DENY_LIST_SIZE.observe(deny_len as f64);
}

/// Record synthesized zero points
#[inline]
pub fn record_augmented(count: usize) {
    if enabled() && count > 0 {
        AUGMENTED_POINTS_TOTAL.inc_by(count as f64);
    }
}

/// Record rows removed by a delete
#[inline]
pub fn record_deleted(kind: &str, rows: usize) {
    if enabled() {
        DELETED_ROWS_TOTAL
            .with_label_values(&[kind])
            .inc_by(rows as f64);
    }
}

/// Record an error
#[inline]
pub fn record_error(error: &Error, operation: &str) {
    if enabled() {
        ERRORS_TOTAL
            .with_label_values(&[error.kind(), operation])
            .inc();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_query() {
        record_query("push_down", 3, 0.002, true);
        let metrics = gather_metrics().expect("Failed to gather metrics");
        assert!(metrics.contains("insights_queries_total"));
        assert!(metrics.contains("insights_deny_list_size"));
    }

    #[test]
    fn test_record_error() {
        record_error(&Error::Cancelled, "series_points");
        let metrics = gather_metrics().expect("Failed to gather metrics");
        assert!(metrics.contains("insights_errors_total"));
    }
}
