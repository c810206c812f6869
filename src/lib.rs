//! # Gatehouse
//!
//! An API gateway core built on Axum:
//!
//! - **Hot Reload**: routing configuration long-polled from Consul and swapped
//!   atomically without dropping in-flight requests
//! - **Resilience**: one circuit breaker per backend service
//! - **Fairness**: distributed sliding-window rate limits with per-tier quotas
//! - **Security**: HMAC JWT verification with the caller forwarded as `X-User-ID`
//! - **Observability**: request IDs, structured logging, Prometheus metrics
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                      Axum HTTP Server                       │
//! ├─────────────────────────────────────────────────────────────┤
//! │  Request ID → Trace → /health, /ready | Dispatcher          │
//! ├─────────────────────────────────────────────────────────────┤
//! │  Dispatcher: match route → Auth → Rate Limit → Breaker      │
//! ├───────────────────────────────┬─────────────────────────────┤
//! │  Routing Table (ArcSwap)      │  Forwarder (reqwest)        │
//! │     ▲                         │     │                       │
//! │  Config Watcher               │     ▼                       │
//! ├───────────────────────────────┤  Backend services           │
//! │  Consul KV      Redis         │                             │
//! └───────────────────────────────┴─────────────────────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::net::SocketAddr;
//! use std::sync::Arc;
//!
//! use gatehouse::{Config, ConsulSource, GatewayState, RedisCounterStore, build_router};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = Config::from_env()?;
//!     let store = RedisCounterStore::connect(&config.redis_url).await?;
//!     let source = ConsulSource::new(
//!         config.consul_address.clone(),
//!         config.consul_token.clone(),
//!         config.config_watch_wait,
//!     )?;
//!
//!     let state = GatewayState::new(config, Arc::new(source), Arc::new(store))?;
//!     state.start().await;
//!
//!     let listener = tokio::net::TcpListener::bind("0.0.0.0:8080").await?;
//!     axum::serve(
//!         listener,
//!         build_router(state).into_make_service_with_connect_info::<SocketAddr>(),
//!     )
//!     .await?;
//!     Ok(())
//! }
//! ```
//!
//! ## Configuration Document
//!
//! Stored as JSON under `CONFIG_KEY`:
//!
//! ```json
//! {
//!   "services": { "users": { "name": "users", "url": "http://users:8080" } },
//!   "routes": [{
//!     "path_prefix": "/api/users",
//!     "service_name": "users",
//!     "auth_required": true,
//!     "middleware": { "rate_limit": { "tiers": {
//!       "default": { "requests": 100, "window_seconds": 60 }
//!     } } }
//!   }]
//! }
//! ```

pub mod breaker;
pub mod config;
pub mod error;
pub mod handlers;
pub mod metrics;
pub mod middleware;
pub mod proxy;
pub mod ratelimit;
pub mod routes;
pub mod routing;
pub mod source;
pub mod state;
pub mod utils;

// Re-exports for convenience
pub use config::Config;
pub use error::{AuthError, GatewayError, GatewayResult};
pub use ratelimit::{MemoryCounterStore, RedisCounterStore};
pub use routes::build_router;
pub use routing::{RoutingConfig, RoutingSnapshot, RoutingTable};
pub use source::{ConsulSource, MemorySource};
pub use state::GatewayState;
