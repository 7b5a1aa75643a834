//! Metrics collection and exposition.
//!
//! # Metrics
//! - `gateway_preflight_total` (counter): preflights answered by the CORS layer
//! - `gateway_upstream_requests_total` (counter): forwarded requests by method, status
//! - `gateway_upstream_duration_seconds` (histogram): upstream latency by method
//! - `gateway_upstream_errors_total` (counter): requests the upstream never answered

use std::net::SocketAddr;
use std::time::Instant;

use metrics::{counter, histogram};
use metrics_exporter_prometheus::{BuildError, PrometheusBuilder};

/// Install the Prometheus recorder and its scrape listener.
///
/// Must be called from within a tokio runtime.
pub fn init_metrics(addr: SocketAddr) -> Result<(), BuildError> {
    PrometheusBuilder::new().with_http_listener(addr).install()?;
    tracing::info!(address = %addr, "Metrics endpoint listening");
    Ok(())
}

pub fn record_preflight() {
    counter!("gateway_preflight_total").increment(1);
}

/// Record a request the upstream answered.
pub fn record_upstream(method: &str, status: u16, start: Instant) {
    counter!(
        "gateway_upstream_requests_total",
        "method" => method.to_string(),
        "status" => status.to_string()
    )
    .increment(1);
    histogram!(
        "gateway_upstream_duration_seconds",
        "method" => method.to_string()
    )
    .record(start.elapsed().as_secs_f64());
}

pub fn record_upstream_error(method: &str) {
    counter!("gateway_upstream_errors_total", "method" => method.to_string()).increment(1);
}
