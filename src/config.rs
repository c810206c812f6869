//! Process configuration loaded from environment variables.
//!
//! This is the gateway's *own* configuration (listen address, where the
//! routing configuration lives, secrets, resilience knobs). The routing
//! configuration itself is fetched at runtime from the config source, see
//! [`crate::routing`].
//!
//! # Config Source
//!
//! - `CONSUL_ADDRESS`: Consul agent address (default: `http://localhost:8500`)
//! - `CONSUL_HTTP_TOKEN`: Optional ACL token
//! - `CONFIG_KEY`: KV key holding the routing configuration (default: `gateway/config`)
//! - `CONFIG_WATCH_WAIT_SECS`: Blocking query wait (default: 300)
//! - `CONFIG_WATCH_BACKOFF_SECS`: Delay after a failed watch (default: 5)
//!
//! # Security
//!
//! - `JWT_SECRET_KEY`: HMAC secret for bearer tokens. When unset, a fixed
//!   insecure default is used and a warning is logged at startup.
//! - `TRUSTED_PROXIES`: Comma-separated CIDR ranges whose `X-Forwarded-For`
//!   is believed when resolving the caller's network identity
//!
//! # Resilience
//!
//! - `REDIS_URL`: Rate counter store (default: `redis://localhost:6379`)
//! - `CIRCUIT_BREAKER_FAILURE_THRESHOLD`: Failures tolerated before opening (default: 5)
//! - `CIRCUIT_BREAKER_HALF_OPEN_PROBES`: Probes allowed while half-open (default: 3)
//! - `CIRCUIT_BREAKER_OPEN_DURATION_SECS`: Cool-down before probing (default: 30)
//! - `UPSTREAM_TIMEOUT_SECS`: Upper bound for one backend call (default: 30)
//! - `MAX_REQUEST_BODY_SIZE`: Largest buffered request body in bytes (default: 10 MiB)
//!
//! # Observability
//!
//! - `METRICS_PORT`: Prometheus exporter port (default: 9090, 0 disables)
//! - `RUST_LOG`: Log filter, read directly by the tracing subscriber (default: `info`)

use std::env;
use std::time::Duration;

use crate::breaker::CircuitBreakerConfig;
use crate::error::{GatewayError, GatewayResult};

/// Fallback HMAC secret used when `JWT_SECRET_KEY` is not configured.
///
/// Anyone who knows this value can mint tokens the gateway accepts. It exists
/// so a development gateway starts without extra setup; startup logs a warning
/// whenever it is in effect.
pub const INSECURE_DEFAULT_JWT_SECRET: &str = "a-string-secret-at-least-256-bits-long";

/// Gateway process configuration.
///
/// # Example
///
/// ```rust,ignore
/// let config = Config::from_env()?;
/// println!("Gateway will listen on {}", config.server_addr());
/// ```
#[derive(Debug, Clone)]
pub struct Config {
    // =========================================================================
    // Server Configuration
    // =========================================================================
    /// Server host address (default: "0.0.0.0")
    pub host: String,

    /// Server port (default: 8080)
    pub port: u16,

    // =========================================================================
    // Routing Configuration Source
    // =========================================================================
    /// Consul HTTP address, always with a scheme
    pub consul_address: String,

    /// Optional Consul ACL token sent as `X-Consul-Token`
    pub consul_token: Option<String>,

    /// KV key holding the routing configuration document
    pub config_key: String,

    /// How long one blocking watch may wait for a change
    pub config_watch_wait: Duration,

    /// Fixed delay after a failed watch before retrying
    pub config_watch_backoff: Duration,

    // =========================================================================
    // Rate Limiting
    // =========================================================================
    /// Redis connection URL for the shared sliding-window counters
    pub redis_url: String,

    // =========================================================================
    // Circuit Breaker Configuration
    // =========================================================================
    /// Consecutive failures tolerated; the next one opens the circuit (default: 5)
    pub circuit_breaker_failure_threshold: u32,

    /// Probe calls admitted while half-open; that many successes close it (default: 3)
    pub circuit_breaker_half_open_probes: u32,

    /// How long the circuit stays open before transitioning to half-open (default: 30s)
    pub circuit_breaker_open_duration: Duration,

    // =========================================================================
    // Upstream Forwarding
    // =========================================================================
    /// Timeout for a single forwarded request (default: 30 seconds)
    pub upstream_timeout: Duration,

    /// Maximum request body size in bytes (default: 10MB)
    pub max_request_body_size: usize,

    // =========================================================================
    // Security Configuration
    // =========================================================================
    /// HMAC secret for bearer token verification.
    /// `None` means the insecure default is in effect.
    pub jwt_secret: Option<String>,

    /// Trusted proxy CIDR ranges; `X-Forwarded-For` is only honored when the
    /// TCP peer is inside one of them.
    ///
    /// Format: Comma-separated CIDR notation (e.g., "10.0.0.0/8,172.16.0.0/12")
    pub trusted_proxies: Vec<String>,

    // =========================================================================
    // Observability Configuration
    // =========================================================================
    /// Port for Prometheus metrics endpoint (default: 9090, 0 = disabled)
    pub metrics_port: u16,
}

impl Config {
    /// Load configuration from environment variables with sensible defaults.
    ///
    /// # Errors
    ///
    /// Returns `GatewayError::Config` if any value fails to parse or the
    /// resulting configuration is inconsistent.
    pub fn from_env() -> GatewayResult<Self> {
        // Load an .env file if present (ignore errors if not found)
        let _ = dotenvy::dotenv();

        let config = Self {
            // Server
            host: env::var("HOST").unwrap_or_else(|_| "0.0.0.0".to_string()),
            port: Self::parse_env("PORT", 8080)?,

            // Config source
            consul_address: normalize_consul_address(
                &env::var("CONSUL_ADDRESS").unwrap_or_else(|_| "localhost:8500".to_string()),
            ),
            consul_token: env::var("CONSUL_HTTP_TOKEN")
                .ok()
                .filter(|t| !t.trim().is_empty()),
            config_key: env::var("CONFIG_KEY").unwrap_or_else(|_| "gateway/config".to_string()),
            config_watch_wait: Duration::from_secs(Self::parse_env(
                "CONFIG_WATCH_WAIT_SECS",
                300,
            )?),
            config_watch_backoff: Duration::from_secs(Self::parse_env(
                "CONFIG_WATCH_BACKOFF_SECS",
                5,
            )?),

            // Rate limiting
            redis_url: env::var("REDIS_URL")
                .unwrap_or_else(|_| "redis://localhost:6379".to_string()),

            // Circuit breaker
            circuit_breaker_failure_threshold: Self::parse_env(
                "CIRCUIT_BREAKER_FAILURE_THRESHOLD",
                5,
            )?,
            circuit_breaker_half_open_probes: Self::parse_env(
                "CIRCUIT_BREAKER_HALF_OPEN_PROBES",
                3,
            )?,
            circuit_breaker_open_duration: Duration::from_secs(Self::parse_env(
                "CIRCUIT_BREAKER_OPEN_DURATION_SECS",
                30,
            )?),

            // Upstream
            upstream_timeout: Duration::from_secs(Self::parse_env("UPSTREAM_TIMEOUT_SECS", 30)?),
            // 10MB
            max_request_body_size: Self::parse_env("MAX_REQUEST_BODY_SIZE", 10 * 1024 * 1024)?,

            // Security
            jwt_secret: env::var("JWT_SECRET_KEY").ok().filter(|k| !k.is_empty()),
            trusted_proxies: Self::parse_trusted_proxies(),

            // Observability
            metrics_port: Self::parse_env("METRICS_PORT", 9090)?,
        };

        // Validate configuration before returning
        config.validate()?;

        Ok(config)
    }

    /// Validate configuration values for consistency and correctness.
    ///
    /// # Errors
    ///
    /// Returns `GatewayError::Config` if validation fails.
    fn validate(&self) -> GatewayResult<()> {
        if self.config_key.trim().is_empty() {
            return Err(GatewayError::Config(
                "CONFIG_KEY must not be empty".to_string(),
            ));
        }

        if self.circuit_breaker_failure_threshold == 0 {
            return Err(GatewayError::Config(
                "CIRCUIT_BREAKER_FAILURE_THRESHOLD must be greater than 0".to_string(),
            ));
        }

        if self.circuit_breaker_half_open_probes == 0 {
            return Err(GatewayError::Config(
                "CIRCUIT_BREAKER_HALF_OPEN_PROBES must be greater than 0".to_string(),
            ));
        }

        if self.upstream_timeout.is_zero() {
            return Err(GatewayError::Config(
                "UPSTREAM_TIMEOUT_SECS must be greater than 0".to_string(),
            ));
        }

        if self.config_watch_wait.is_zero() {
            return Err(GatewayError::Config(
                "CONFIG_WATCH_WAIT_SECS must be greater than 0".to_string(),
            ));
        }

        // Validate max request body size is reasonable
        if self.max_request_body_size == 0 {
            return Err(GatewayError::Config(
                "MAX_REQUEST_BODY_SIZE must be greater than 0".to_string(),
            ));
        }

        Ok(())
    }

    /// Get the full server address for binding.
    pub fn server_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// The HMAC secret actually used for verification.
    ///
    /// Falls back to [`INSECURE_DEFAULT_JWT_SECRET`] when none is configured.
    pub fn effective_jwt_secret(&self) -> &str {
        self.jwt_secret
            .as_deref()
            .unwrap_or(INSECURE_DEFAULT_JWT_SECRET)
    }

    /// Check whether the insecure fallback secret is in effect.
    pub fn uses_insecure_jwt_secret(&self) -> bool {
        self.jwt_secret.is_none()
    }

    /// Circuit breaker settings applied to every backend service.
    pub fn circuit_breaker(&self) -> CircuitBreakerConfig {
        CircuitBreakerConfig::new(
            self.circuit_breaker_failure_threshold,
            self.circuit_breaker_half_open_probes,
            self.circuit_breaker_open_duration,
        )
    }

    /// Check if Prometheus metrics export is enabled.
    pub fn metrics_enabled(&self) -> bool {
        self.metrics_port > 0
    }

    /// Get the metrics endpoint address.
    ///
    /// Returns `None` if metrics are disabled (port = 0).
    pub fn metrics_addr(&self) -> Option<std::net::SocketAddr> {
        if self.metrics_enabled() {
            Some(std::net::SocketAddr::from((
                [0, 0, 0, 0],
                self.metrics_port,
            )))
        } else {
            None
        }
    }

    /// Parse an environment variable into the specified type with a default value.
    fn parse_env<T>(name: &str, default: T) -> GatewayResult<T>
    where
        T: std::str::FromStr,
        T::Err: std::fmt::Display,
    {
        match env::var(name) {
            Ok(val) => val
                .trim()
                .parse()
                .map_err(|e| GatewayError::Config(format!("Invalid {name}: {e}"))),
            Err(_) => Ok(default),
        }
    }

    /// Parse trusted proxy CIDR ranges from environment variable.
    ///
    /// Default: Empty (only the TCP peer address identifies a caller)
    fn parse_trusted_proxies() -> Vec<String> {
        env::var("TRUSTED_PROXIES")
            .ok()
            .filter(|s| !s.is_empty())
            .map(|s| {
                s.split(',')
                    .map(|p| p.trim().to_string())
                    .filter(|p| !p.is_empty())
                    .collect()
            })
            .unwrap_or_default()
    }
}

/// Strip stray quotes and make sure the address carries a scheme.
///
/// Container environments frequently pass `"consul:8500"` with the quotes
/// included; bare `host:port` values are assumed to be plain HTTP.
fn normalize_consul_address(raw: &str) -> String {
    let trimmed = raw.trim().trim_matches('"').trim_end_matches('/');
    if trimmed.starts_with("http://") || trimmed.starts_with("https://") {
        trimmed.to_string()
    } else {
        format!("http://{trimmed}")
    }
}

/// Default configuration for testing and development.
///
/// Production deployments should use `Config::from_env()` instead.
impl Default for Config {
    fn default() -> Self {
        Self {
            // Server
            host: "0.0.0.0".to_string(),
            port: 8080,
            // Config source
            consul_address: "http://localhost:8500".to_string(),
            consul_token: None,
            config_key: "gateway/config".to_string(),
            config_watch_wait: Duration::from_secs(300),
            config_watch_backoff: Duration::from_secs(5),
            // Rate limiting
            redis_url: "redis://localhost:6379".to_string(),
            // Circuit breaker
            circuit_breaker_failure_threshold: 5,
            circuit_breaker_half_open_probes: 3,
            circuit_breaker_open_duration: Duration::from_secs(30),
            // Upstream
            upstream_timeout: Duration::from_secs(30),
            max_request_body_size: 10 * 1024 * 1024, // 10MB
            // Security
            jwt_secret: None,
            trusted_proxies: vec![],
            // Observability
            metrics_port: 9090,
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_values() {
        let config = Config::default();

        assert_eq!(config.host, "0.0.0.0");
        assert_eq!(config.port, 8080);
        assert_eq!(config.config_key, "gateway/config");
        assert_eq!(config.config_watch_backoff, Duration::from_secs(5));
        assert_eq!(config.circuit_breaker_failure_threshold, 5);
        assert_eq!(config.circuit_breaker_half_open_probes, 3);
        assert_eq!(config.circuit_breaker_open_duration, Duration::from_secs(30));
        assert!(config.jwt_secret.is_none());
    }

    #[test]
    fn test_server_addr_format() {
        let config = Config {
            host: "127.0.0.1".to_string(),
            port: 9000,
            ..Config::default()
        };

        assert_eq!(config.server_addr(), "127.0.0.1:9000");
    }

    #[test]
    fn test_insecure_secret_fallback() {
        let config = Config::default();
        assert!(config.uses_insecure_jwt_secret());
        assert_eq!(config.effective_jwt_secret(), INSECURE_DEFAULT_JWT_SECRET);

        let config = Config {
            jwt_secret: Some("real-secret".to_string()),
            ..Config::default()
        };
        assert!(!config.uses_insecure_jwt_secret());
        assert_eq!(config.effective_jwt_secret(), "real-secret");
    }

    #[test]
    fn test_normalize_consul_address() {
        assert_eq!(
            normalize_consul_address("localhost:8500"),
            "http://localhost:8500"
        );
        assert_eq!(
            normalize_consul_address("\"consul:8500\""),
            "http://consul:8500"
        );
        assert_eq!(
            normalize_consul_address("https://consul.internal/"),
            "https://consul.internal"
        );
    }

    #[test]
    fn test_validate_zero_failure_threshold() {
        let config = Config {
            circuit_breaker_failure_threshold: 0,
            ..Config::default()
        };

        let result = config.validate();
        assert!(result.is_err());
        assert!(
            result
                .unwrap_err()
                .to_string()
                .contains("CIRCUIT_BREAKER_FAILURE_THRESHOLD")
        );
    }

    #[test]
    fn test_validate_empty_config_key() {
        let config = Config {
            config_key: "  ".to_string(),
            ..Config::default()
        };

        assert!(config.validate().is_err());
    }

    #[test]
    fn test_metrics_addr_disabled() {
        let config = Config {
            metrics_port: 0,
            ..Config::default()
        };
        assert!(config.metrics_addr().is_none());
    }

    #[test]
    fn test_validate_valid_config() {
        let config = Config::default();
        assert!(config.validate().is_ok());
    }
}
