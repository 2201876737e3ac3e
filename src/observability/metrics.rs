//! Metrics collection and exposition.
//!
//! # Metrics
//! - `cache_requests_total` (counter): client requests by method, status
//! - `cache_request_duration_seconds` (histogram): latency distribution
//! - `cache_events_total` (counter): trace events (fresh, miss, store, …)
//! - `cache_store_errors_total` (counter): store failures by operation
//!
//! # Design Decisions
//! - Exposed through a Prometheus scrape endpoint on its own listener
//! - Recording is a no-op until an exporter is installed

use std::net::SocketAddr;
use std::time::Instant;

use metrics::{counter, histogram};
use metrics_exporter_prometheus::PrometheusBuilder;

use crate::cache::TraceEvent;

/// Install the Prometheus exporter with an HTTP scrape listener on `addr`.
pub fn init_metrics(addr: SocketAddr) {
    match PrometheusBuilder::new().with_http_listener(addr).install() {
        Ok(()) => tracing::info!(address = %addr, "Metrics endpoint started"),
        Err(e) => tracing::error!(error = %e, "Failed to install metrics exporter"),
    }
}

pub fn record_request(method: &str, status: u16, start_time: Instant) {
    counter!(
        "cache_requests_total",
        "method" => method.to_string(),
        "status" => status.to_string()
    )
    .increment(1);
    histogram!("cache_request_duration_seconds", "method" => method.to_string())
        .record(start_time.elapsed().as_secs_f64());
}

pub fn record_cache_event(event: TraceEvent) {
    counter!("cache_events_total", "event" => event.as_str()).increment(1);
}

pub fn record_store_error(operation: &'static str) {
    counter!("cache_store_errors_total", "operation" => operation).increment(1);
}
