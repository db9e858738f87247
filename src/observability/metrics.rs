//! Metrics collection and exposition.
//!
//! # Responsibilities
//! - Define proxy metrics (exchanges, primary latency, comparisons, connections)
//! - Expose Prometheus-compatible metrics endpoint
//!
//! # Metrics
//! - `dual_proxy_exchanges_total` (counter): exchanges by outcome
//! - `dual_proxy_primary_duration_seconds` (histogram): time to the primary's response head
//! - `dual_proxy_comparisons_total` (counter): `match` / `mismatch`
//! - `dual_proxy_secondary_failures_total` (counter): secondary branch failures by stage
//! - `dual_proxy_active_connections` (gauge): current connection count
//!
//! # Design Decisions
//! - Low-overhead metric updates (atomic operations)
//! - Without an installed exporter every call is a no-op

use std::net::SocketAddr;
use std::time::Instant;

use metrics_exporter_prometheus::PrometheusBuilder;

/// Install the Prometheus exporter with an HTTP listener on `addr`.
///
/// Must run inside the Tokio runtime.
pub fn init_metrics(addr: SocketAddr) {
    match PrometheusBuilder::new().with_http_listener(addr).install() {
        Ok(()) => {
            describe();
            tracing::info!(address = %addr, "Metrics exporter listening");
        }
        Err(e) => tracing::error!(address = %addr, error = %e, "Failed to install metrics exporter"),
    }
}

fn describe() {
    ::metrics::describe_counter!("dual_proxy_exchanges_total", "Exchanges handled, by outcome");
    ::metrics::describe_histogram!(
        "dual_proxy_primary_duration_seconds",
        ::metrics::Unit::Seconds,
        "Time until the primary backend's response head arrived"
    );
    ::metrics::describe_counter!("dual_proxy_comparisons_total", "Primary/secondary status comparisons");
    ::metrics::describe_counter!(
        "dual_proxy_secondary_failures_total",
        "Secondary branches that ended without a comparison"
    );
    ::metrics::describe_gauge!("dual_proxy_active_connections", "Accepted connections not yet closed");
}

/// Count a finished exchange, e.g. `forwarded`, `capture_failed`, `primary_failed`.
pub fn record_exchange(outcome: &'static str) {
    ::metrics::counter!("dual_proxy_exchanges_total", "outcome" => outcome).increment(1);
}

pub fn record_primary(status: u16, started: Instant) {
    ::metrics::histogram!(
        "dual_proxy_primary_duration_seconds",
        "status" => status.to_string()
    )
    .record(started.elapsed().as_secs_f64());
}

pub fn record_comparison(mismatch: bool) {
    let result = if mismatch { "mismatch" } else { "match" };
    ::metrics::counter!("dual_proxy_comparisons_total", "result" => result).increment(1);
}

pub fn record_secondary_failure(stage: &'static str) {
    ::metrics::counter!("dual_proxy_secondary_failures_total", "stage" => stage).increment(1);
}

pub fn set_active_connections(count: usize) {
    ::metrics::gauge!("dual_proxy_active_connections").set(count as f64);
}
