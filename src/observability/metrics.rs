//! Metrics collection and exposition.
//!
//! # Responsibilities
//! - Define proxy metrics (RPS, latency, errors, health, reconciliation)
//! - Expose Prometheus-compatible metrics endpoint
//! - Track per-target and aggregate metrics
//!
//! # Metrics
//! - `proxy_requests_total` (counter): total requests by router, service, status
//! - `proxy_request_duration_seconds` (histogram): latency distribution
//! - `proxy_backend_health` (gauge): 1=routable, 0=unhealthy
//! - `proxy_retries_total` (counter): extra attempts by service
//! - `proxy_rate_limited_total` (counter): rejections by middleware
//! - `proxy_reconciliations_total` (counter): cycles by outcome
//! - `proxy_config_errors` (gauge): entity errors of the current snapshot
//! - `proxy_snapshot_generation` (gauge): current snapshot generation
//!
//! # Design Decisions
//! - Low-overhead metric updates through the `metrics` facade
//! - Without an installed recorder every call is a no-op (tests, CLI)

use std::net::SocketAddr;
use std::time::Duration;

use metrics::{counter, gauge, histogram};
use metrics_exporter_prometheus::PrometheusBuilder;

/// Install the Prometheus recorder and its HTTP listener.
pub fn init_metrics(addr: SocketAddr) {
    match PrometheusBuilder::new().with_http_listener(addr).install() {
        Ok(()) => tracing::info!(address = %addr, "Metrics endpoint listening"),
        Err(e) => tracing::error!(address = %addr, error = %e, "Failed to install metrics exporter"),
    }
}

pub fn record_request(router: &str, service: &str, status: u16, latency: Duration) {
    counter!(
        "proxy_requests_total",
        "router" => router.to_string(),
        "service" => service.to_string(),
        "status" => status.to_string()
    )
    .increment(1);
    histogram!("proxy_request_duration_seconds", "router" => router.to_string())
        .record(latency.as_secs_f64());
}

pub fn record_backend_health(service: &str, target: &str, routable: bool) {
    gauge!(
        "proxy_backend_health",
        "service" => service.to_string(),
        "target" => target.to_string()
    )
    .set(if routable { 1.0 } else { 0.0 });
}

pub fn record_retry(service: &str) {
    counter!("proxy_retries_total", "service" => service.to_string()).increment(1);
}

pub fn record_rate_limited(middleware: &str) {
    counter!("proxy_rate_limited_total", "middleware" => middleware.to_string()).increment(1);
}

pub fn record_reconciliation(outcome: &'static str, generation: u64, error_count: usize) {
    counter!("proxy_reconciliations_total", "outcome" => outcome).increment(1);
    gauge!("proxy_snapshot_generation").set(generation as f64);
    gauge!("proxy_config_errors").set(error_count as f64);
}
