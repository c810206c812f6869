//! Liveness and readiness endpoints.
//!
//! # Endpoints
//!
//! - `GET /health` - Always 200, with routing and breaker details
//! - `GET /ready` - 200 once a routing snapshot is loaded, 503 before
//!
//! Both paths are served by the gateway itself and take precedence over any
//! configured route with the same prefix.

use axum::Json;
use axum::extract::State;
use axum::http::StatusCode;
use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::instrument;

use crate::state::GatewayState;

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    /// Whether a routing snapshot has been loaded.
    pub configured: bool,
    pub config_version: Option<u64>,
    pub routes: usize,
    pub breakers: Vec<BreakerStatus>,
    pub version: &'static str,
    pub uptime_seconds: u64,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Serialize)]
pub struct BreakerStatus {
    pub service: String,
    pub state: String,
    pub consecutive_failures: u32,
}

/// Health check endpoint.
///
/// # Response Body
///
/// ```json
/// {
///   "status": "healthy",
///   "configured": true,
///   "config_version": 42,
///   "routes": 3,
///   "breakers": [{ "service": "users", "state": "closed", "consecutive_failures": 0 }],
///   "version": "0.1.0",
///   "uptime_seconds": 120,
///   "timestamp": "2024-01-15T10:30:00Z"
/// }
/// ```
#[instrument(skip(state))]
pub async fn health_check(State(state): State<GatewayState>) -> Json<HealthResponse> {
    let snapshot = state.routing.current();
    let breakers = state
        .breakers
        .snapshot()
        .into_iter()
        .map(|(service, snap)| BreakerStatus {
            service,
            state: snap.state.to_string(),
            consecutive_failures: snap.consecutive_failures,
        })
        .collect();

    Json(HealthResponse {
        status: if snapshot.is_some() {
            "healthy"
        } else {
            "unconfigured"
        },
        configured: snapshot.is_some(),
        config_version: snapshot.as_ref().map(|s| s.version()),
        routes: snapshot.as_ref().map_or(0, |s| s.len()),
        breakers,
        version: env!("CARGO_PKG_VERSION"),
        uptime_seconds: state.uptime_seconds(),
        timestamp: Utc::now(),
    })
}

/// Readiness check endpoint for Kubernetes probes.
///
/// ```yaml
/// readinessProbe:
///   httpGet:
///     path: /ready
///     port: 8080
/// ```
#[instrument(skip(state))]
pub async fn readiness_check(State(state): State<GatewayState>) -> StatusCode {
    if state.routing.is_configured() {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    }
}
