use axum::http::header::{HeaderName, HeaderValue, RETRY_AFTER, WWW_AUTHENTICATE};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use serde::Serialize;
use thiserror::Error;

use crate::ratelimit::RateLimitHeaders;

/// Reasons a bearer token can be rejected by the auth guard.
///
/// Every variant maps to `401 Unauthorized`. The `Display` text is safe to
/// show to clients: it never includes the token or the verification key.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AuthError {
    #[error("authorization header missing")]
    MissingHeader,

    #[error("invalid authorization header format")]
    InvalidScheme,

    #[error("token signed with a disallowed algorithm")]
    DisallowedAlgorithm,

    #[error("invalid token")]
    InvalidToken,

    #[error("invalid token: user_id claim missing or not a string")]
    MissingUserId,
}

/// Gateway-wide error type with an HTTP mapping for the request path.
///
/// Variants that only occur off the request path (`ConfigFetch`,
/// `ConfigParse`, `RouteResolution`, `Config`) still implement
/// `IntoResponse` so they can be surfaced uniformly, but the watcher and the
/// route compiler only ever log them.
#[derive(Error, Debug)]
pub enum GatewayError {
    #[error("failed to fetch gateway configuration: {0}")]
    ConfigFetch(String),

    #[error("failed to parse gateway configuration: {0}")]
    ConfigParse(#[from] serde_json::Error),

    #[error("route '{route}' dropped: {reason}")]
    RouteResolution { route: String, reason: String },

    #[error("authentication failed: {0}")]
    Auth(#[from] AuthError),

    #[error("rate limit exceeded for route '{route}'")]
    RateLimitExceeded {
        route: String,
        headers: RateLimitHeaders,
    },

    #[error("rate limit store failure: {0}")]
    RateLimitStore(String),

    #[error("circuit open for service '{0}'")]
    CircuitOpen(String),

    #[error("gateway has no routing configuration yet")]
    NotConfigured,

    #[error("no route matches '{0}'")]
    NoRouteMatch(String),

    #[error("upstream '{service}' unreachable: {reason}")]
    UpstreamUnavailable { service: String, reason: String },

    #[error("upstream '{0}' timed out")]
    UpstreamTimeout(String),

    #[error("request body exceeds {0} bytes")]
    PayloadTooLarge(usize),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Internal server error: {0}")]
    Internal(String),
}

impl GatewayError {
    /// HTTP status for this error.
    pub fn status_code(&self) -> StatusCode {
        match self {
            GatewayError::Auth(_) => StatusCode::UNAUTHORIZED,
            GatewayError::RateLimitExceeded { .. } => StatusCode::TOO_MANY_REQUESTS,
            GatewayError::CircuitOpen(_) | GatewayError::NotConfigured => {
                StatusCode::SERVICE_UNAVAILABLE
            }
            GatewayError::NoRouteMatch(_) => StatusCode::NOT_FOUND,
            GatewayError::UpstreamUnavailable { .. } => StatusCode::BAD_GATEWAY,
            GatewayError::UpstreamTimeout(_) => StatusCode::GATEWAY_TIMEOUT,
            GatewayError::PayloadTooLarge(_) => StatusCode::PAYLOAD_TOO_LARGE,
            GatewayError::ConfigFetch(_)
            | GatewayError::ConfigParse(_)
            | GatewayError::RouteResolution { .. }
            | GatewayError::RateLimitStore(_)
            | GatewayError::Config(_)
            | GatewayError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Short machine-readable error kind used in response bodies and metrics.
    pub fn kind(&self) -> &'static str {
        match self {
            GatewayError::ConfigFetch(_) => "config_fetch",
            GatewayError::ConfigParse(_) => "config_parse",
            GatewayError::RouteResolution { .. } => "route_resolution",
            GatewayError::Auth(_) => "unauthorized",
            GatewayError::RateLimitExceeded { .. } => "rate_limited",
            GatewayError::RateLimitStore(_) => "rate_limit_unavailable",
            GatewayError::CircuitOpen(_) => "circuit_open",
            GatewayError::NotConfigured => "not_configured",
            GatewayError::NoRouteMatch(_) => "not_found",
            GatewayError::UpstreamUnavailable { .. } => "bad_gateway",
            GatewayError::UpstreamTimeout(_) => "gateway_timeout",
            GatewayError::PayloadTooLarge(_) => "payload_too_large",
            GatewayError::Config(_) => "config_error",
            GatewayError::Internal(_) => "internal_error",
        }
    }

    /// Message shown to the client. Internal details stay in the logs.
    fn client_message(&self) -> String {
        match self {
            GatewayError::Auth(e) => e.to_string(),
            GatewayError::RateLimitExceeded { .. } => "Too many requests".to_string(),
            GatewayError::RateLimitStore(_) => "Could not process request".to_string(),
            GatewayError::CircuitOpen(_) => "Service unavailable".to_string(),
            GatewayError::NotConfigured => {
                "Gateway is not configured yet. Please try again later.".to_string()
            }
            GatewayError::NoRouteMatch(_) => "No route matches the request path".to_string(),
            GatewayError::UpstreamUnavailable { .. } => {
                "Upstream service is unreachable".to_string()
            }
            GatewayError::UpstreamTimeout(_) => "Upstream service timed out".to_string(),
            GatewayError::PayloadTooLarge(limit) => {
                format!("Request body exceeds the {limit} byte limit")
            }
            GatewayError::ConfigFetch(_)
            | GatewayError::ConfigParse(_)
            | GatewayError::RouteResolution { .. }
            | GatewayError::Config(_)
            | GatewayError::Internal(_) => {
                "An internal error occurred. Please contact support if the issue persists."
                    .to_string()
            }
        }
    }
}

/// Error response body for gateway-generated responses.
#[derive(Serialize)]
struct ErrorResponse {
    error: &'static str,
    message: String,
}

impl IntoResponse for GatewayError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        if status.is_server_error() {
            tracing::error!(error = %self, status = status.as_u16(), "Request failed");
        } else {
            tracing::debug!(error = %self, status = status.as_u16(), "Request rejected");
        }

        let mut headers = HeaderMap::new();
        match &self {
            GatewayError::Auth(_) => {
                headers.insert(WWW_AUTHENTICATE, HeaderValue::from_static("Bearer"));
            }
            GatewayError::RateLimitExceeded { headers: rl, .. } => {
                rl.apply(&mut headers);
                if let Ok(value) = HeaderValue::from_str(&rl.retry_after_secs.to_string()) {
                    headers.insert(RETRY_AFTER, value);
                }
            }
            _ => {}
        }

        let body = ErrorResponse {
            error: self.kind(),
            message: self.client_message(),
        };

        (status, headers, axum::Json(body)).into_response()
    }
}

/// Header carrying the authenticated identity to upstream services.
pub static USER_ID_HEADER: HeaderName = HeaderName::from_static("x-user-id");

/// Convenience type alias for Results with GatewayError.
pub type GatewayResult<T> = Result<T, GatewayError>;

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_status_codes_follow_taxonomy() {
        assert_eq!(
            GatewayError::Auth(AuthError::MissingHeader).status_code(),
            StatusCode::UNAUTHORIZED
        );
        assert_eq!(
            GatewayError::CircuitOpen("users".into()).status_code(),
            StatusCode::SERVICE_UNAVAILABLE
        );
        assert_eq!(
            GatewayError::NotConfigured.status_code(),
            StatusCode::SERVICE_UNAVAILABLE
        );
        assert_eq!(
            GatewayError::RateLimitStore("down".into()).status_code(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
        assert_eq!(
            GatewayError::NoRouteMatch("/x".into()).status_code(),
            StatusCode::NOT_FOUND
        );
    }

    #[test]
    fn test_auth_error_sets_www_authenticate() {
        let response = GatewayError::Auth(AuthError::InvalidToken).into_response();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(response.headers().get(WWW_AUTHENTICATE).unwrap(), "Bearer");
    }

    #[test]
    fn test_rate_limited_response_carries_headers() {
        let err = GatewayError::RateLimitExceeded {
            route: "/api".into(),
            headers: RateLimitHeaders {
                limit: 2,
                remaining: 0,
                reset_epoch_secs: 1_700_000_060,
                retry_after_secs: 60,
            },
        };
        let response = err.into_response();
        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(response.headers().get("x-ratelimit-limit").unwrap(), "2");
        assert_eq!(response.headers().get("x-ratelimit-remaining").unwrap(), "0");
        assert_eq!(
            response.headers().get("x-ratelimit-reset").unwrap(),
            "1700000060"
        );
        assert_eq!(response.headers().get(RETRY_AFTER).unwrap(), "60");
    }

    #[test]
    fn test_internal_details_not_exposed() {
        let err = GatewayError::RateLimitStore("redis at 10.0.0.3 refused".into());
        assert!(!err.client_message().contains("10.0.0.3"));
    }
}
