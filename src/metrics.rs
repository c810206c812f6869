//! Prometheus metrics for gateway observability.
//!
//! Metrics are exposed on a dedicated HTTP listener (default port 9090) so the
//! scrape endpoint never shares a path namespace with proxied routes.
//!
//! # Available Metrics
//!
//! ## Counters
//! - `gateway_requests_total` - Dispatched requests (labels: route, status)
//! - `gateway_circuit_breaker_rejections_total` - Calls refused by an open circuit (label: service)
//! - `gateway_circuit_breaker_opens_total` - Times a breaker opened (label: service)
//! - `gateway_rate_limit_rejections_total` - Requests answered with 429 (label: route)
//! - `gateway_config_reloads_total` - Routing reload attempts (label: outcome)
//!
//! ## Histograms
//! - `gateway_request_duration_seconds` - End-to-end dispatch latency (labels: route, status)
//!
//! ## Gauges
//! - `gateway_circuit_breaker_state` - Breaker state, 0 closed, 1 half-open, 2 open (label: service)
//! - `gateway_routes` - Routes in the current snapshot

use metrics::{counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram};
use metrics_exporter_prometheus::PrometheusBuilder;
use std::net::SocketAddr;
use tracing::{error, info};

use crate::breaker::CircuitState;

/// Metric names as constants for consistency.
pub mod names {
    pub const REQUESTS_TOTAL: &str = "gateway_requests_total";
    pub const REQUEST_DURATION_SECONDS: &str = "gateway_request_duration_seconds";
    pub const CIRCUIT_BREAKER_REJECTIONS_TOTAL: &str = "gateway_circuit_breaker_rejections_total";
    pub const CIRCUIT_BREAKER_OPENS_TOTAL: &str = "gateway_circuit_breaker_opens_total";
    pub const CIRCUIT_BREAKER_STATE: &str = "gateway_circuit_breaker_state";
    pub const RATE_LIMIT_REJECTIONS_TOTAL: &str = "gateway_rate_limit_rejections_total";
    pub const CONFIG_RELOADS_TOTAL: &str = "gateway_config_reloads_total";
    pub const ROUTES: &str = "gateway_routes";
}

/// Outcome label values for `gateway_config_reloads_total`.
pub mod reload {
    pub const APPLIED: &str = "applied";
    pub const PARSE_ERROR: &str = "parse_error";
    pub const FETCH_ERROR: &str = "fetch_error";
}

/// Initialize the Prometheus metrics exporter.
///
/// Installs the global recorder, starts the HTTP listener on `metrics_addr`
/// and registers metric descriptions.
pub fn init_metrics(metrics_addr: SocketAddr) -> Result<(), String> {
    PrometheusBuilder::new()
        .with_http_listener(metrics_addr)
        .install()
        .map_err(|e| format!("Failed to install Prometheus exporter: {e}"))?;

    describe_counter!(
        names::REQUESTS_TOTAL,
        "Total number of requests handled by the dispatcher"
    );
    describe_counter!(
        names::CIRCUIT_BREAKER_REJECTIONS_TOTAL,
        "Total number of calls rejected by an open circuit"
    );
    describe_counter!(
        names::CIRCUIT_BREAKER_OPENS_TOTAL,
        "Total number of times a circuit breaker opened"
    );
    describe_counter!(
        names::RATE_LIMIT_REJECTIONS_TOTAL,
        "Total number of requests rejected by the rate limiter"
    );
    describe_counter!(
        names::CONFIG_RELOADS_TOTAL,
        "Routing configuration reload attempts by outcome"
    );

    describe_histogram!(
        names::REQUEST_DURATION_SECONDS,
        "Dispatch duration in seconds, including the upstream call"
    );

    describe_gauge!(
        names::CIRCUIT_BREAKER_STATE,
        "Circuit breaker state (0 = closed, 1 = half-open, 2 = open)"
    );
    describe_gauge!(names::ROUTES, "Routes in the current routing snapshot");

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
// Request Metrics
// =============================================================================

/// Record one dispatched request and its latency.
pub fn record_request(route: &str, status: u16, duration_secs: f64) {
    let status = status.to_string();
    counter!(names::REQUESTS_TOTAL, "route" => route.to_string(), "status" => status.clone())
        .increment(1);
    histogram!(names::REQUEST_DURATION_SECONDS, "route" => route.to_string(), "status" => status)
        .record(duration_secs);
}

/// Record a 429 issued for `route`.
pub fn record_rate_limit_rejection(route: &str) {
    counter!(names::RATE_LIMIT_REJECTIONS_TOTAL, "route" => route.to_string()).increment(1);
}

// =============================================================================
// Circuit Breaker Metrics
// =============================================================================

/// Record circuit breaker opening.
pub fn record_circuit_breaker_open(service: &str) {
    counter!(names::CIRCUIT_BREAKER_OPENS_TOTAL, "service" => service.to_string()).increment(1);
}

/// Record circuit breaker rejection.
pub fn record_circuit_breaker_rejection(service: &str) {
    counter!(names::CIRCUIT_BREAKER_REJECTIONS_TOTAL, "service" => service.to_string())
        .increment(1);
}

/// Update circuit breaker state gauge.
///
/// States: 0 = closed, 1 = half-open, 2 = open
pub fn set_circuit_breaker_state(service: &str, state: CircuitState) {
    let value = match state {
        CircuitState::Closed => 0.0,
        CircuitState::HalfOpen => 1.0,
        CircuitState::Open => 2.0,
    };
    gauge!(names::CIRCUIT_BREAKER_STATE, "service" => service.to_string()).set(value);
}

// =============================================================================
// Routing Metrics
// =============================================================================

/// Count a reload attempt; see [`reload`] for outcome labels.
pub fn record_config_reload(outcome: &'static str) {
    counter!(names::CONFIG_RELOADS_TOTAL, "outcome" => outcome).increment(1);
}

/// Update the route count gauge after a publish.
pub fn set_route_count(routes: usize) {
    gauge!(names::ROUTES).set(routes as f64);
}
