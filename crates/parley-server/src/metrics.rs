//! Prometheus metrics.
//!
//! Recording goes through the `metrics` facade and is a no-op until
//! [`install`] sets up the exporter.

use anyhow::{Context, Result};
use metrics::{counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram};
use metrics_exporter_prometheus::PrometheusBuilder;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use tracing::info;

/// Metric names.
pub mod names {
    pub const CONNECTIONS_TOTAL: &str = "parley_connections_total";
    pub const CONNECTIONS_ACTIVE: &str = "parley_connections_active";
    pub const FRAMES_TOTAL: &str = "parley_frames_total";
    pub const FRAME_BYTES_TOTAL: &str = "parley_frame_bytes_total";
    pub const JOINS_TOTAL: &str = "parley_joins_total";
    pub const JOIN_ERRORS_TOTAL: &str = "parley_join_errors_total";
    pub use parley_core::subscription::SUBSCRIPTION_EXITS_TOTAL;
    pub const REQUEST_SECONDS: &str = "parley_request_seconds";
    pub const ERRORS_TOTAL: &str = "parley_errors_total";
}

/// Register metric descriptions.
pub fn describe() {
    describe_counter!(names::CONNECTIONS_TOTAL, "WebSocket connections accepted");
    describe_gauge!(names::CONNECTIONS_ACTIVE, "Open WebSocket connections");
    describe_counter!(names::FRAMES_TOTAL, "Frames by direction");
    describe_counter!(names::FRAME_BYTES_TOTAL, "Frame bytes by direction");
    describe_counter!(names::JOINS_TOTAL, "Successful room joins");
    describe_counter!(names::JOIN_ERRORS_TOTAL, "Failed room joins by reason");
    describe_counter!(
        names::SUBSCRIPTION_EXITS_TOTAL,
        "Finished room subscriptions by outcome"
    );
    describe_histogram!(names::REQUEST_SECONDS, "Request handling time");
    describe_counter!(names::ERRORS_TOTAL, "Connection-level errors by kind");
}

/// Install the Prometheus exporter listening on `port`.
///
/// # Errors
///
/// Returns an error if the exporter cannot bind or a recorder is already installed.
pub fn install(port: u16) -> Result<()> {
    let addr = SocketAddr::from(([0, 0, 0, 0], port));

    PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()
        .with_context(|| format!("Failed to start metrics exporter on {addr}"))?;

    info!("Metrics exporter listening on {}", addr);
    Ok(())
}

/// Record a frame.
pub fn record_frame(bytes: usize, direction: &'static str) {
    counter!(names::FRAMES_TOTAL, "direction" => direction).increment(1);
    counter!(names::FRAME_BYTES_TOTAL, "direction" => direction).increment(bytes as u64);
}

/// Record how long a request took.
pub fn record_request(seconds: f64) {
    histogram!(names::REQUEST_SECONDS).record(seconds);
}

/// Record a successful join.
pub fn record_join() {
    counter!(names::JOINS_TOTAL).increment(1);
}

/// Record a failed join.
pub fn record_join_error(reason: &'static str) {
    counter!(names::JOIN_ERRORS_TOTAL, "reason" => reason).increment(1);
}

/// Record a connection-level error.
pub fn record_error(kind: &'static str) {
    counter!(names::ERRORS_TOTAL, "kind" => kind).increment(1);
}

/// Counts one open connection, both in the exported gauge and in a local
/// counter used for the connection limit.
pub struct ConnectionGuard<'a> {
    active: &'a AtomicUsize,
}

impl<'a> ConnectionGuard<'a> {
    /// Record a new connection.
    pub fn new(active: &'a AtomicUsize) -> Self {
        active.fetch_add(1, Ordering::Relaxed);
        counter!(names::CONNECTIONS_TOTAL).increment(1);
        gauge!(names::CONNECTIONS_ACTIVE).increment(1.0);
        Self { active }
    }
}

impl Drop for ConnectionGuard<'_> {
    fn drop(&mut self) {
        self.active.fetch_sub(1, Ordering::Relaxed);
        gauge!(names::CONNECTIONS_ACTIVE).decrement(1.0);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connection_guard_counts() {
        let active = AtomicUsize::new(0);
        {
            let _a = ConnectionGuard::new(&active);
            let _b = ConnectionGuard::new(&active);
            assert_eq!(active.load(Ordering::Relaxed), 2);
        }
        assert_eq!(active.load(Ordering::Relaxed), 0);
    }

    #[test]
    fn test_recording_without_exporter() {
        record_join();
        record_join_error("validation");
        record_frame(42, "inbound");
        record_request(0.001);
    }
}
