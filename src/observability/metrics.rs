//! Metrics collection and exposition.
//!
//! # Metrics
//! - `connections_accepted_total` (counter)
//! - `connections_active` (gauge)
//! - `tls_negotiations_total` (counter): by outcome
//! - `tls_renegotiations_started_total` (counter): transport round trips
//! - `body_contract_violations_total` (counter): by direction
//!
//! Recording is a no-op until an exporter is installed.

use std::net::SocketAddr;

use metrics_exporter_prometheus::{BuildError, PrometheusBuilder};

/// Install the Prometheus exporter listening on `addr`.
pub fn init_metrics(addr: SocketAddr) -> Result<(), BuildError> {
    PrometheusBuilder::new().with_http_listener(addr).install()?;
    tracing::info!(address = %addr, "Metrics exporter listening");
    Ok(())
}

pub fn record_connection_accepted() {
    metrics::counter!("connections_accepted_total").increment(1);
}

pub fn record_active_connections(active: u64) {
    metrics::gauge!("connections_active").set(active as f64);
}

pub fn record_negotiation(outcome: &'static str) {
    metrics::counter!("tls_negotiations_total", "outcome" => outcome).increment(1);
}

pub fn record_renegotiation_started() {
    metrics::counter!("tls_renegotiations_started_total").increment(1);
}

pub fn record_body_contract_violation(direction: &'static str) {
    metrics::counter!("body_contract_violations_total", "direction" => direction).increment(1);
}
