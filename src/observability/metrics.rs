//! Metrics collection and exposition.
//!
//! # Responsibilities
//! - Define transport metrics (connections, requests, sessions)
//! - Expose a Prometheus-compatible endpoint when the binary asks for it
//!
//! # Metrics
//! - `net_connections_total` (counter): opened connections by transport
//! - `net_active_connections` (gauge): currently open connections by transport
//! - `http_requests_total` (counter): requests by method, status
//! - `http_request_duration_seconds` (histogram): time to response head
//! - `websocket_sessions_total` (counter): successful upgrades and client sessions
//!
//! # Design Decisions
//! - Without an installed recorder every call is a no-op, so the library
//!   records unconditionally

use std::net::SocketAddr;
use std::time::Instant;

use metrics::{counter, gauge, histogram};
use metrics_exporter_prometheus::{BuildError, PrometheusBuilder};

use crate::net::connection::TransportKind;

/// Install the Prometheus recorder and its HTTP listener.
///
/// Must be called from inside a Tokio runtime.
pub fn init_metrics(addr: SocketAddr) -> Result<(), BuildError> {
    PrometheusBuilder::new().with_http_listener(addr).install()?;
    tracing::info!(address = %addr, "Metrics endpoint listening");
    Ok(())
}

pub fn record_connection_opened(transport: TransportKind) {
    counter!("net_connections_total", "transport" => transport.as_str()).increment(1);
    gauge!("net_active_connections", "transport" => transport.as_str()).increment(1.0);
}

pub fn record_connection_closed(transport: TransportKind) {
    gauge!("net_active_connections", "transport" => transport.as_str()).decrement(1.0);
}

pub fn record_request(method: &str, status: u16, start: Instant) {
    counter!(
        "http_requests_total",
        "method" => method.to_string(),
        "status" => status.to_string()
    )
    .increment(1);
    histogram!("http_request_duration_seconds").record(start.elapsed().as_secs_f64());
}

pub fn record_websocket_session() {
    counter!("websocket_sessions_total").increment(1);
}
