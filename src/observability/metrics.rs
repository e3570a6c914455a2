//! Metrics collection and exposition.
//!
//! # Metrics
//! - `httpsys_connections_total` (counter): accepted connections by port
//! - `httpsys_connections_rejected_total` (counter): refused at the connection cap
//! - `httpsys_requests_queued_total` (counter): requests handed to a queue
//! - `httpsys_queue_rejections_total` (counter): 503s from a full queue
//! - `httpsys_responses_total` (counter): responses by status code
//! - `httpsys_request_duration_seconds` (histogram): enqueue to final send
//! - `httpsys_tls_handshakes_total` (counter): handshakes by outcome
//! - `httpsys_logon_failures_total` (counter): failed logons by scheme

use std::net::SocketAddr;
use std::time::Instant;

use metrics_exporter_prometheus::PrometheusBuilder;

/// Install the Prometheus recorder and its scrape endpoint.
pub fn init_metrics(addr: SocketAddr) {
    match PrometheusBuilder::new().with_http_listener(addr).install() {
        Ok(()) => tracing::info!(address = %addr, "Metrics endpoint listening"),
        Err(e) => tracing::error!(address = %addr, error = %e, "Failed to install metrics exporter"),
    }
}

pub fn record_connection_accepted(port: u16) {
    metrics::counter!("httpsys_connections_total", "port" => port.to_string()).increment(1);
}

pub fn record_connection_rejected(port: u16) {
    metrics::counter!("httpsys_connections_rejected_total", "port" => port.to_string()).increment(1);
}

pub fn record_request_queued(queue: &str) {
    metrics::counter!("httpsys_requests_queued_total", "queue" => queue.to_string()).increment(1);
}

pub fn record_queue_rejection(queue: &str) {
    metrics::counter!("httpsys_queue_rejections_total", "queue" => queue.to_string()).increment(1);
}

pub fn record_response(status: u16, started: Instant) {
    metrics::counter!("httpsys_responses_total", "status" => status.to_string()).increment(1);
    metrics::histogram!("httpsys_request_duration_seconds").record(started.elapsed().as_secs_f64());
}

pub fn record_tls_handshake(outcome: &'static str) {
    metrics::counter!("httpsys_tls_handshakes_total", "outcome" => outcome).increment(1);
}

pub fn record_logon_failure(scheme: &'static str) {
    metrics::counter!("httpsys_logon_failures_total", "scheme" => scheme).increment(1);
}
