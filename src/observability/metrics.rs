//! Metrics collection and exposition.
//!
//! # Metrics
//! - `devserver_requests_total` (counter): completed requests by status
//! - `devserver_app_errors_total` (counter): app failures and panics
//! - `devserver_reloads_total` (counter): worker restarts after a change
//! - `devserver_worker_crashes_total` (counter): unexpected worker exits
//!
//! # Design Decisions
//! - Recording is always on; without an installed recorder the `metrics`
//!   macros are no-ops
//! - The Prometheus endpoint is opt-in (`observability.metrics_address`)

use std::net::SocketAddr;

use metrics::{counter, describe_counter};
use metrics_exporter_prometheus::PrometheusBuilder;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum MetricsError {
    #[error("invalid metrics address {0}")]
    InvalidAddress(String),

    #[error("failed to install Prometheus exporter: {0}")]
    Install(String),
}

/// Install the Prometheus recorder and its HTTP listener.
///
/// Must be called from within a Tokio runtime.
pub fn init(address: &str) -> Result<(), MetricsError> {
    let addr: SocketAddr = address
        .parse()
        .map_err(|e| MetricsError::InvalidAddress(format!("{}: {}", address, e)))?;

    PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()
        .map_err(|e| MetricsError::Install(e.to_string()))?;

    describe();
    tracing::info!(address = %addr, "Metrics endpoint listening");
    Ok(())
}

fn describe() {
    describe_counter!("devserver_requests_total", "Completed requests by status");
    describe_counter!("devserver_app_errors_total", "Application failures and panics");
    describe_counter!("devserver_reloads_total", "Worker restarts caused by a file change");
    describe_counter!(
        "devserver_worker_crashes_total",
        "Worker exits the supervisor did not ask for"
    );
}

pub fn record_request(status: u16) {
    counter!("devserver_requests_total", "status" => status.to_string()).increment(1);
}

pub fn record_app_error() {
    counter!("devserver_app_errors_total").increment(1);
}

pub fn record_reload() {
    counter!("devserver_reloads_total").increment(1);
}

pub fn record_worker_crash() {
    counter!("devserver_worker_crashes_total").increment(1);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_unparsable_address() {
        assert!(matches!(init("not-an-address"), Err(MetricsError::InvalidAddress(_))));
    }

    #[test]
    fn recording_without_recorder_is_harmless() {
        record_request(200);
        record_app_error();
        record_reload();
        record_worker_crash();
    }
}
