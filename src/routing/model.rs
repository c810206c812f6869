//! Routing configuration document as stored in the config source.
//!
//! ```json
//! {
//!   "services": { "users": { "name": "users", "url": "http://users:8080" } },
//!   "routes": [
//!     {
//!       "path_prefix": "/api/users",
//!       "service_name": "users",
//!       "auth_required": true,
//!       "middleware": {
//!         "rate_limit": { "tiers": { "default": { "requests": 2, "window_seconds": 60 } } }
//!       }
//!     }
//!   ]
//! }
//! ```

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// One backend service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceDefinition {
    pub name: String,
    pub url: String,
}

/// Raw tier quota. Signed so a bad value drops one tier instead of failing
/// the whole document.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TierDefinition {
    pub requests: i64,
    pub window_seconds: i64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateLimitPolicy {
    #[serde(default)]
    pub tiers: HashMap<String, TierDefinition>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MiddlewareConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rate_limit: Option<RateLimitPolicy>,
}

/// One route: a path prefix bound to a service plus its policy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RouteDefinition {
    pub path_prefix: String,
    pub service_name: String,
    #[serde(default)]
    pub auth_required: bool,
    #[serde(default)]
    pub middleware: MiddlewareConfig,
}

impl RouteDefinition {
    /// Declared tiers, empty when the route has no rate-limit block.
    pub fn tiers(&self) -> impl Iterator<Item = (&String, &TierDefinition)> {
        self.middleware
            .rate_limit
            .iter()
            .flat_map(|policy| policy.tiers.iter())
    }
}

/// The whole routing configuration document.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoutingConfig {
    #[serde(default)]
    pub services: HashMap<String, ServiceDefinition>,
    #[serde(default)]
    pub routes: Vec<RouteDefinition>,
}

impl RoutingConfig {
    pub fn from_json(bytes: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(bytes)
    }
}
