//! Prometheus metrics for the control plane.
//!
//! Metrics are exposed via a dedicated HTTP listener (default port 9090,
//! disabled with `METRICS_PORT=0`).
//!
//! # Available Metrics
//!
//! ## Counters
//! - `catalog_rate_limited_total` - Requests rejected by the per-client limiter
//! - `catalog_limiter_evictions_total` - Idle limiter entries removed by the sweeper
//! - `catalog_auth_failures_total` - Failed authentications (label: reason)
//! - `catalog_authz_denials_total` - Requests refused by a permission check (label: reason)
//! - `catalog_background_tasks_total` - Finished background tasks (labels: task, outcome)
//! - `catalog_emails_total` - Emails handed to the mailer (labels: template, outcome)
//!
//! ## Histograms
//! - `catalog_request_duration_seconds` - Request duration (label: status)
//!
//! ## Gauges
//! - `catalog_limiter_clients` - Clients currently tracked by the limiter
//! - `catalog_background_tasks_outstanding` - Background tasks not yet finished
//! - `catalog_store_up` - Store reachability from the periodic health check (1 = up)
//!
//! Recording functions are no-ops until [`init_metrics`] installs a recorder,
//! so library code and tests may call them unconditionally.

use std::net::SocketAddr;

use metrics::{counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram};
use metrics_exporter_prometheus::PrometheusBuilder;
use tracing::{error, info};

/// Metric names as constants for consistency.
pub mod names {
    pub const RATE_LIMITED_TOTAL: &str = "catalog_rate_limited_total";
    pub const LIMITER_EVICTIONS_TOTAL: &str = "catalog_limiter_evictions_total";
    pub const AUTH_FAILURES_TOTAL: &str = "catalog_auth_failures_total";
    pub const AUTHZ_DENIALS_TOTAL: &str = "catalog_authz_denials_total";
    pub const BACKGROUND_TASKS_TOTAL: &str = "catalog_background_tasks_total";
    pub const EMAILS_TOTAL: &str = "catalog_emails_total";
    pub const REQUEST_DURATION_SECONDS: &str = "catalog_request_duration_seconds";
    pub const LIMITER_CLIENTS: &str = "catalog_limiter_clients";
    pub const BACKGROUND_TASKS_OUTSTANDING: &str = "catalog_background_tasks_outstanding";
    pub const STORE_UP: &str = "catalog_store_up";
}

/// Install the Prometheus exporter and describe every metric.
pub fn init_metrics(metrics_addr: SocketAddr) -> Result<(), String> {
    PrometheusBuilder::new()
        .with_http_listener(metrics_addr)
        .install()
        .map_err(|e| format!("Failed to install Prometheus exporter: {e}"))?;

    describe_counter!(
        names::RATE_LIMITED_TOTAL,
        "Total number of requests rejected by the rate limiter"
    );
    describe_counter!(
        names::LIMITER_EVICTIONS_TOTAL,
        "Total number of idle rate limiter entries evicted"
    );
    describe_counter!(
        names::AUTH_FAILURES_TOTAL,
        "Total number of failed bearer token authentications"
    );
    describe_counter!(
        names::AUTHZ_DENIALS_TOTAL,
        "Total number of requests denied by a permission check"
    );
    describe_counter!(
        names::BACKGROUND_TASKS_TOTAL,
        "Total number of finished background tasks"
    );
    describe_counter!(names::EMAILS_TOTAL, "Total number of emails sent");

    describe_histogram!(
        names::REQUEST_DURATION_SECONDS,
        "HTTP request duration in seconds"
    );

    describe_gauge!(
        names::LIMITER_CLIENTS,
        "Number of clients tracked by the rate limiter"
    );
    describe_gauge!(
        names::BACKGROUND_TASKS_OUTSTANDING,
        "Number of background tasks still running"
    );
    describe_gauge!(
        names::STORE_UP,
        "Store reachability (1 = reachable, 0 = unreachable)"
    );

    info!(addr = %metrics_addr, "Prometheus metrics endpoint started");
    Ok(())
}

/// Try to initialize metrics, logging any errors but not failing.
pub fn try_init_metrics(metrics_addr: SocketAddr) {
    if let Err(e) = init_metrics(metrics_addr) {
        error!(error = %e, "Failed to initialize metrics, continuing without metrics");
    }
}

// =============================================================================
// Counter Recording Functions
// =============================================================================

pub fn record_rate_limited() {
    counter!(names::RATE_LIMITED_TOTAL).increment(1);
}

pub fn record_limiter_evictions(count: usize) {
    counter!(names::LIMITER_EVICTIONS_TOTAL).increment(count as u64);
}

/// Record a failed authentication with its error code as the reason.
pub fn record_auth_failure(reason: &'static str) {
    counter!(names::AUTH_FAILURES_TOTAL, "reason" => reason).increment(1);
}

pub fn record_authz_denial(reason: &'static str) {
    counter!(names::AUTHZ_DENIALS_TOTAL, "reason" => reason).increment(1);
}

/// Record a finished background task.
///
/// Outcomes: `completed`, `panicked`, `cancelled`.
pub fn record_background_task(task: &'static str, outcome: &'static str) {
    counter!(names::BACKGROUND_TASKS_TOTAL, "task" => task, "outcome" => outcome).increment(1);
}

pub fn record_email(template: &'static str, outcome: &'static str) {
    counter!(names::EMAILS_TOTAL, "template" => template, "outcome" => outcome).increment(1);
}

// =============================================================================
// Histogram Recording Functions
// =============================================================================

/// Record HTTP request duration.
pub fn record_request_duration(status: u16, duration_secs: f64) {
    histogram!(names::REQUEST_DURATION_SECONDS, "status" => status.to_string())
        .record(duration_secs);
}

// =============================================================================
// Gauge Recording Functions
// =============================================================================

pub fn set_limiter_clients(count: usize) {
    gauge!(names::LIMITER_CLIENTS).set(count as f64);
}

pub fn set_background_tasks_outstanding(count: usize) {
    gauge!(names::BACKGROUND_TASKS_OUTSTANDING).set(count as f64);
}

pub fn set_store_up(up: bool) {
    gauge!(names::STORE_UP).set(if up { 1.0 } else { 0.0 });
}
