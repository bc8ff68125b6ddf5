//! Metrics collection and exposition.
//!
//! # Metrics
//! - `devserve_requests_total` (counter): requests by method and status
//! - `devserve_request_duration_seconds` (histogram): time to response written
//! - `devserve_active_connections` (gauge): current connection count
//! - `devserve_worker_restarts_total` (counter): reload restarts by reason

use std::net::SocketAddr;
use std::time::Instant;

use metrics::Label;
use metrics_exporter_prometheus::{BuildError, PrometheusBuilder};

/// Install the Prometheus recorder and its scrape listener.
///
/// Must run inside a tokio runtime.
pub fn install_exporter(addr: SocketAddr) -> Result<(), BuildError> {
    PrometheusBuilder::new().with_http_listener(addr).install()?;
    tracing::info!(address = %addr, "Metrics exporter listening");
    Ok(())
}

/// Record one completed request.
pub fn record_request(method: &str, status: u16, start: Instant) {
    let labels = vec![
        Label::new("method", method.to_string()),
        Label::new("status", status.to_string()),
    ];
    metrics::counter!("devserve_requests_total", labels.clone()).increment(1);
    metrics::histogram!("devserve_request_duration_seconds", labels)
        .record(start.elapsed().as_secs_f64());
}

pub fn set_active_connections(count: u64) {
    metrics::gauge!("devserve_active_connections").set(count as f64);
}

/// Record a worker restart. `reason` is "change", "requested" or "failure".
pub fn record_worker_restart(reason: &'static str) {
    metrics::counter!("devserve_worker_restarts_total", "reason" => reason).increment(1);
}
