//! Prometheus metrics for the query service.
//!
//! Metrics are exposed by a dedicated HTTP listener (`METRICS_PORT`). Every
//! recording function is a no-op until [`init_metrics`] installs the exporter.
//!
//! # Available Metrics
//!
//! ## Counters
//! - `query_gateway_queries_total` - Catalog executions (labels: query, status)
//! - `query_gateway_custom_queries_total` - Custom queries (labels: collection, operation, status)
//! - `query_gateway_query_fallbacks_total` - Capability fallbacks taken (labels: query, capability)
//! - `query_gateway_rate_limit_rejections_total` - Requests refused with 429 (labels: profile)
//!
//! ## Histograms
//! - `query_gateway_request_duration_seconds` - HTTP request duration (labels: path, method, status)
//! - `query_gateway_query_duration_seconds` - Data store call duration (labels: kind)
//!
//! ## Gauges
//! - `query_gateway_rate_limit_buckets` - Live rate limit buckets (labels: profile)

use metrics::{counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram};
use metrics_exporter_prometheus::PrometheusBuilder;
use std::net::SocketAddr;
use tracing::{error, info};

/// Metric names as constants for consistency.
pub mod names {
    pub const QUERIES_TOTAL: &str = "query_gateway_queries_total";
    pub const CUSTOM_QUERIES_TOTAL: &str = "query_gateway_custom_queries_total";
    pub const QUERY_FALLBACKS_TOTAL: &str = "query_gateway_query_fallbacks_total";
    pub const RATE_LIMIT_REJECTIONS_TOTAL: &str = "query_gateway_rate_limit_rejections_total";
    pub const REQUEST_DURATION_SECONDS: &str = "query_gateway_request_duration_seconds";
    pub const QUERY_DURATION_SECONDS: &str = "query_gateway_query_duration_seconds";
    pub const RATE_LIMIT_BUCKETS: &str = "query_gateway_rate_limit_buckets";
}

/// Install the Prometheus exporter and describe all metrics.
///
/// # Returns
///
/// `Ok(())` if initialization succeeds, `Err` with message otherwise.
pub fn init_metrics(metrics_addr: SocketAddr) -> Result<(), String> {
    PrometheusBuilder::new()
        .with_http_listener(metrics_addr)
        .install()
        .map_err(|e| format!("Failed to install Prometheus exporter: {e}"))?;

    describe_counter!(names::QUERIES_TOTAL, "Total number of catalog query executions");
    describe_counter!(
        names::CUSTOM_QUERIES_TOTAL,
        "Total number of custom query requests"
    );
    describe_counter!(
        names::QUERY_FALLBACKS_TOTAL,
        "Total number of capability fallbacks taken by catalog queries"
    );
    describe_counter!(
        names::RATE_LIMIT_REJECTIONS_TOTAL,
        "Total number of requests rejected by a rate limiter"
    );

    describe_histogram!(
        names::REQUEST_DURATION_SECONDS,
        "HTTP request duration in seconds"
    );
    describe_histogram!(
        names::QUERY_DURATION_SECONDS,
        "Data store call duration in seconds"
    );

    describe_gauge!(
        names::RATE_LIMIT_BUCKETS,
        "Number of live client buckets per rate limit profile"
    );

    info!(addr = %metrics_addr, "Prometheus metrics endpoint started");
    Ok(())
}

/// Try to initialize metrics, logging any errors but not failing.
pub fn try_init_metrics(metrics_addr: SocketAddr) {
    if let Err(e) = init_metrics(metrics_addr) {
        error!(error = %e, "Failed to initialize metrics, continuing without metrics");
    }
}

// =============================================================================
// Counter Recording Functions
// =============================================================================

/// Record one catalog query execution.
pub fn record_query(query: &str, status: &str) {
    counter!(names::QUERIES_TOTAL, "query" => query.to_string(), "status" => status.to_string())
        .increment(1);
}

/// Record one custom query request.
pub fn record_custom_query(collection: &str, operation: &str, status: &str) {
    counter!(names::CUSTOM_QUERIES_TOTAL, "collection" => collection.to_string(), "operation" => operation.to_string(), "status" => status.to_string())
        .increment(1);
}

/// Record a fallback from an index-backed operation.
pub fn record_query_fallback(query: &str, capability: &str) {
    counter!(names::QUERY_FALLBACKS_TOTAL, "query" => query.to_string(), "capability" => capability.to_string())
        .increment(1);
}

/// Record a rate limit rejection.
pub fn record_rate_limit_rejection(profile: &str) {
    counter!(names::RATE_LIMIT_REJECTIONS_TOTAL, "profile" => profile.to_string()).increment(1);
}

// =============================================================================
// Histogram Recording Functions
// =============================================================================

/// Record HTTP request duration.
pub fn record_request_duration(path: &str, method: &str, status: &str, duration_secs: f64) {
    histogram!(names::REQUEST_DURATION_SECONDS, "path" => path.to_string(), "method" => method.to_string(), "status" => status.to_string())
        .record(duration_secs);
}

/// Record data store call duration. `kind` is `catalog` or `custom`.
pub fn record_query_duration(kind: &str, duration_secs: f64) {
    histogram!(names::QUERY_DURATION_SECONDS, "kind" => kind.to_string()).record(duration_secs);
}

// =============================================================================
// Gauge Recording Functions
// =============================================================================

/// Update the live bucket gauge for a rate limit profile.
pub fn set_rate_limit_buckets(profile: &str, buckets: usize) {
    gauge!(names::RATE_LIMIT_BUCKETS, "profile" => profile.to_string()).set(buckets as f64);
}

#[cfg(test)]
mod tests {
    use super::*;

    // These only verify that recording without an exporter does not panic.

    #[test]
    fn test_record_query() {
        record_query("basic-find-companies", "success");
        record_query_fallback("text-search-jobs", "text");
    }

    #[test]
    fn test_record_custom_query() {
        record_custom_query("users", "find", "forbidden");
    }

    #[test]
    fn test_record_durations() {
        record_request_duration("/health", "GET", "200", 0.001);
        record_query_duration("catalog", 0.02);
    }

    #[test]
    fn test_rate_limit_metrics() {
        record_rate_limit_rejection("custom_query");
        set_rate_limit_buckets("api", 3);
    }
}
