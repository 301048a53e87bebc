//! Prometheus metrics for gateway observability.
//!
//! These are the operator-facing counters exported on a dedicated port; the
//! in-process analytics engine remains the authority for the dashboard. All
//! recording functions are safe to call before the exporter is installed.

use std::net::SocketAddr;

use metrics::{counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram};
use metrics_exporter_prometheus::PrometheusBuilder;
use tracing::{error, info};

/// Metric names as constants for consistency.
pub mod names {
    pub const REQUESTS_TOTAL: &str = "gateway_requests_total";
    pub const REQUEST_DURATION_SECONDS: &str = "gateway_request_duration_seconds";
    pub const RATE_LIMIT_HITS_TOTAL: &str = "gateway_rate_limit_hits_total";
    pub const AUTH_FAILURES_TOTAL: &str = "gateway_auth_failures_total";
    pub const DEVICE_REGISTRATIONS_TOTAL: &str = "gateway_device_registrations_total";
    pub const ACTIVE_DEVICES: &str = "gateway_active_devices";
}

/// Install the Prometheus exporter and describe all metrics.
pub fn init_metrics(metrics_addr: SocketAddr) -> Result<(), String> {
    PrometheusBuilder::new()
        .with_http_listener(metrics_addr)
        .install()
        .map_err(|e| format!("Failed to install Prometheus exporter: {e}"))?;

    describe_counter!(names::REQUESTS_TOTAL, "Requests completed by the gateway");
    describe_counter!(
        names::RATE_LIMIT_HITS_TOTAL,
        "Requests rejected by the rate limiter"
    );
    describe_counter!(
        names::AUTH_FAILURES_TOTAL,
        "Requests rejected by authentication"
    );
    describe_counter!(
        names::DEVICE_REGISTRATIONS_TOTAL,
        "Device registrations accepted"
    );
    describe_histogram!(
        names::REQUEST_DURATION_SECONDS,
        "Request duration through the pipeline in seconds"
    );
    describe_gauge!(names::ACTIVE_DEVICES, "Active, unexpired devices");

    info!(addr = %metrics_addr, "Prometheus metrics endpoint started");
    Ok(())
}

/// Try to initialize metrics, logging any errors but not failing.
pub fn try_init_metrics(metrics_addr: SocketAddr) {
    if let Err(e) = init_metrics(metrics_addr) {
        error!(error = %e, "Failed to initialize metrics, continuing without metrics");
    }
}

/// Record a completed request.
pub fn record_request(method: &str, status: u16, duration_ms: u64) {
    counter!(names::REQUESTS_TOTAL, "method" => method.to_string(), "status" => status.to_string())
        .increment(1);
    histogram!(names::REQUEST_DURATION_SECONDS, "method" => method.to_string())
        .record(duration_ms as f64 / 1000.0);
}

/// Record a rate-limiter rejection.
pub fn record_rate_limit_hit() {
    counter!(names::RATE_LIMIT_HITS_TOTAL).increment(1);
}

/// Record an authentication rejection.
pub fn record_auth_failure() {
    counter!(names::AUTH_FAILURES_TOTAL).increment(1);
}

/// Record an accepted device registration.
pub fn record_device_registration() {
    counter!(names::DEVICE_REGISTRATIONS_TOTAL).increment(1);
}

/// Update the active-device gauge.
pub fn set_active_devices(count: usize) {
    gauge!(names::ACTIVE_DEVICES).set(count as f64);
}
