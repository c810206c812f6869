//! Compiled routing snapshots and the hot-swappable table holding them.

use std::collections::HashMap;
use std::sync::Arc;

use arc_swap::ArcSwapOption;
use reqwest::Url;
use tracing::{info, warn};

use super::model::{RouteDefinition, RoutingConfig};
use crate::error::GatewayError;
use crate::metrics;
use crate::ratelimit::TierLimit;

/// A route whose service reference has been resolved.
#[derive(Debug, Clone)]
pub struct RouteEntry {
    pub path_prefix: String,
    pub service_name: String,
    pub base_url: Url,
    pub auth_required: bool,
    /// Valid tiers only; empty means unmetered.
    pub tiers: HashMap<String, TierLimit>,
}

impl RouteEntry {
    /// Remainder of `path` after this prefix, if the prefix matches on a
    /// segment boundary. `/api/users` matches `/api/users` and
    /// `/api/users/7` but not `/api/usersettings`.
    fn remainder<'a>(&self, path: &'a str) -> Option<&'a str> {
        let rest = path.strip_prefix(self.path_prefix.as_str())?;
        if rest.is_empty() || rest.starts_with('/') || self.path_prefix.ends_with('/') {
            Some(rest)
        } else {
            None
        }
    }

    pub fn matches(&self, path: &str) -> bool {
        self.remainder(path).is_some()
    }

    /// The path the backend sees: the prefix removed, always starting with `/`.
    pub fn upstream_path(&self, path: &str) -> Option<String> {
        self.remainder(path).map(|rest| {
            if rest.starts_with('/') {
                rest.to_string()
            } else {
                format!("/{rest}")
            }
        })
    }
}

/// Immutable compiled form of one configuration version.
#[derive(Debug, Clone, Default)]
pub struct RoutingSnapshot {
    version: u64,
    entries: Vec<Arc<RouteEntry>>,
}

impl RoutingSnapshot {
    /// Compile `cfg` into a snapshot.
    ///
    /// Never fails: a route with an unknown service, an unusable URL or a
    /// malformed prefix is dropped with a warning and the remaining routes
    /// are kept in declaration order.
    pub fn compile(cfg: &RoutingConfig, version: u64) -> Self {
        let entries = cfg
            .routes
            .iter()
            .filter_map(|route| match compile_route(cfg, route) {
                Ok(entry) => Some(Arc::new(entry)),
                Err(e) => {
                    warn!(version, error = %e, "Skipping route");
                    None
                }
            })
            .collect();

        Self { version, entries }
    }

    /// Source version this snapshot was built from.
    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn entries(&self) -> &[Arc<RouteEntry>] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// First entry in declaration order whose prefix matches `path`.
    ///
    /// Overlapping prefixes are not ranked by length: `/api` declared before
    /// `/api/users` wins for `/api/users/1`.
    pub fn find(&self, path: &str) -> Option<&Arc<RouteEntry>> {
        self.entries.iter().find(|entry| entry.matches(path))
    }
}

fn compile_route(cfg: &RoutingConfig, route: &RouteDefinition) -> Result<RouteEntry, GatewayError> {
    let reject = |reason: String| GatewayError::RouteResolution {
        route: route.path_prefix.clone(),
        reason,
    };

    if !route.path_prefix.starts_with('/') {
        return Err(reject("path_prefix must start with '/'".to_string()));
    }

    let service = cfg
        .services
        .get(&route.service_name)
        .ok_or_else(|| reject(format!("unknown service '{}'", route.service_name)))?;

    let base_url = Url::parse(&service.url)
        .map_err(|e| reject(format!("service '{}' has invalid url: {e}", service.name)))?;
    if !matches!(base_url.scheme(), "http" | "https") || base_url.host_str().is_none() {
        return Err(reject(format!(
            "service '{}' url must be absolute http(s) with a host",
            service.name
        )));
    }

    let mut tiers = HashMap::new();
    for (name, tier) in route.tiers() {
        match (u64::try_from(tier.requests), u64::try_from(tier.window_seconds)) {
            (Ok(requests), Ok(window_seconds)) if requests > 0 && window_seconds > 0 => {
                tiers.insert(
                    name.clone(),
                    TierLimit {
                        requests,
                        window_seconds,
                    },
                );
            }
            _ => warn!(
                route = %route.path_prefix,
                tier = %name,
                requests = tier.requests,
                window_seconds = tier.window_seconds,
                "Dropping tier with non-positive limits"
            ),
        }
    }

    Ok(RouteEntry {
        path_prefix: route.path_prefix.clone(),
        service_name: route.service_name.clone(),
        base_url,
        auth_required: route.auth_required,
        tiers,
    })
}

/// The current routing snapshot, swapped atomically.
///
/// Readers take a pointer-sized load and keep their `Arc` for the rest of the
/// request; a concurrent publish never changes what they hold.
#[derive(Default)]
pub struct RoutingTable {
    current: ArcSwapOption<RoutingSnapshot>,
}

impl RoutingTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the current snapshot.
    pub fn publish(&self, snapshot: RoutingSnapshot) {
        let version = snapshot.version;
        let routes = snapshot.len();
        self.current.store(Some(Arc::new(snapshot)));
        metrics::set_route_count(routes);
        info!(version, routes, "Routing table updated");
    }

    /// `None` until the first configuration has been loaded.
    pub fn current(&self) -> Option<Arc<RoutingSnapshot>> {
        self.current.load_full()
    }

    pub fn is_configured(&self) -> bool {
        self.current.load().is_some()
    }
}
