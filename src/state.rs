//! Shared gateway state for Axum handlers.
//!
//! [`GatewayState`] owns everything a request or a background task needs:
//!
//! - **Routing table**: the current compiled snapshot, swapped by the watcher
//! - **Breaker registry**: one circuit breaker per backend service
//! - **Dispatcher**: the stage pipeline plus the upstream HTTP client
//! - **Config source**: where the routing document is read from
//!
//! # Structured Concurrency
//!
//! The config watcher runs on a `TaskTracker` and stops when the
//! `CancellationToken` fires. Call [`GatewayState::shutdown`] after the HTTP
//! server has drained to stop it cleanly.

use std::sync::Arc;
use std::time::Instant;

use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

use crate::breaker::BreakerRegistry;
use crate::config::Config;
use crate::error::{GatewayError, GatewayResult};
use crate::middleware::{AuthGuard, TrustedProxyConfig};
use crate::proxy::{Dispatcher, Forwarder, standard_pipeline};
use crate::ratelimit::{CounterStore, RateLimiter};
use crate::routing::{ConfigWatcher, RoutingTable};
use crate::source::ConfigSource;

/// Cloned into every handler; all fields are cheap handles.
///
/// # Lifecycle
///
/// ```rust,ignore
/// let state = GatewayState::new(config, source, store)?;
/// state.start().await;     // initial load + watcher
/// // ... serve ...
/// state.shutdown().await;  // stop the watcher
/// ```
#[derive(Clone)]
pub struct GatewayState {
    pub config: Arc<Config>,
    pub routing: Arc<RoutingTable>,
    pub breakers: Arc<BreakerRegistry>,
    pub dispatcher: Arc<Dispatcher>,
    pub started_at: Instant,
    source: Arc<dyn ConfigSource>,
    task_tracker: TaskTracker,
    cancellation_token: CancellationToken,
}

impl GatewayState {
    /// Wire up the gateway. Nothing is contacted yet; see [`start`](Self::start).
    ///
    /// # Errors
    ///
    /// Returns `GatewayError::Config` if the upstream HTTP client cannot be
    /// built.
    pub fn new(
        config: Config,
        source: Arc<dyn ConfigSource>,
        store: Arc<dyn CounterStore>,
    ) -> GatewayResult<Self> {
        if config.uses_insecure_jwt_secret() {
            warn!("JWT_SECRET_KEY is not set, using the built-in development secret");
        }

        let routing = Arc::new(RoutingTable::new());
        let breakers = Arc::new(BreakerRegistry::new(config.circuit_breaker()));
        let forwarder = Forwarder::new(config.upstream_timeout)
            .map_err(|e| GatewayError::Config(format!("cannot build upstream client: {e}")))?;

        let trusted_proxies = TrustedProxyConfig::new(&config.trusted_proxies);
        if trusted_proxies.is_enabled() {
            info!(
                ranges = config.trusted_proxies.len(),
                "Forwarding headers honored from trusted proxies"
            );
        }

        let dispatcher = Dispatcher::new(
            Arc::clone(&routing),
            standard_pipeline(
                AuthGuard::new(config.effective_jwt_secret()),
                RateLimiter::new(store),
                Arc::clone(&breakers),
            ),
            forwarder,
            trusted_proxies,
            config.max_request_body_size,
        );

        Ok(Self {
            config: Arc::new(config),
            routing,
            breakers,
            dispatcher: Arc::new(dispatcher),
            started_at: Instant::now(),
            source,
            task_tracker: TaskTracker::new(),
            cancellation_token: CancellationToken::new(),
        })
    }

    /// Load the configuration once, then keep watching it in the background.
    ///
    /// A failed initial load is not fatal: the gateway answers 503 until the
    /// watcher publishes a first snapshot.
    pub async fn start(&self) {
        let watcher = ConfigWatcher::new(
            Arc::clone(&self.source),
            Arc::clone(&self.routing),
            self.config.config_key.clone(),
            self.config.config_watch_backoff,
        );

        let last_seen = watcher.load_initial().await;
        if !self.routing.is_configured() {
            warn!(key = %self.config.config_key, "No routing configuration loaded yet");
        }

        let cancel = self.cancellation_token.clone();
        self.task_tracker.spawn(async move {
            watcher.run(last_seen, cancel).await;
            debug!("Config watcher task finished");
        });
    }

    /// Stop background tasks and wait for them to finish.
    pub async fn shutdown(&self) {
        info!("Initiating graceful shutdown of background tasks");
        self.cancellation_token.cancel();
        self.task_tracker.close();
        self.task_tracker.wait().await;
        info!("All background tasks have completed");
    }

    pub fn uptime_seconds(&self) -> u64 {
        self.started_at.elapsed().as_secs()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use std::time::Duration;

    use crate::ratelimit::MemoryCounterStore;
    use crate::source::MemorySource;

    const DOC: &str = r#"{
        "services": { "svc": { "name": "svc", "url": "http://svc" } },
        "routes": [ { "path_prefix": "/svc", "service_name": "svc" } ]
    }"#;

    fn state(source: Arc<MemorySource>) -> GatewayState {
        let config = Config {
            config_watch_backoff: Duration::from_millis(10),
            ..Config::default()
        };
        GatewayState::new(config, source, Arc::new(MemoryCounterStore::new())).unwrap()
    }

    #[tokio::test]
    async fn test_start_loads_existing_config() {
        let source = Arc::new(MemorySource::with_wait(Duration::from_millis(50)));
        source.put("gateway/config", DOC);

        let state = state(Arc::clone(&source));
        state.start().await;

        let snapshot = state.routing.current().unwrap();
        assert_eq!(snapshot.len(), 1);
        state.shutdown().await;
    }

    #[tokio::test]
    async fn test_start_without_config_stays_unconfigured_then_picks_up_change() {
        let source = Arc::new(MemorySource::with_wait(Duration::from_millis(50)));
        let state = state(Arc::clone(&source));
        state.start().await;
        assert!(!state.routing.is_configured());

        source.put("gateway/config", DOC);
        for _ in 0..100 {
            if state.routing.is_configured() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(state.routing.is_configured());
        state.shutdown().await;
    }

    #[tokio::test]
    async fn test_shutdown_stops_watcher() {
        let source = Arc::new(MemorySource::new());
        let state = state(source);
        state.start().await;

        tokio::time::timeout(Duration::from_secs(2), state.shutdown())
            .await
            .expect("watcher should stop promptly");
    }
}
