use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use axum::body::{Body, Bytes};
use axum::extract::ConnectInfo;
use axum::http::header::CONTENT_LENGTH;
use axum::http::request::Parts;
use axum::http::{HeaderMap, Request};
use axum::response::{IntoResponse, Response};
use tracing::{Span, debug, field, instrument};

use super::forward::{ForwardError, Forwarder, has_dot_segment};
use super::stage::{RequestContext, Stage};
use crate::breaker::CallOutcome;
use crate::error::{GatewayError, GatewayResult};
use crate::metrics;
use crate::middleware::{TrustedProxyConfig, client_identity};
use crate::routing::RoutingTable;

/// Route label for requests that never matched a route.
const UNMATCHED_ROUTE: &str = "unmatched";

/// Matches requests against the current routing snapshot, runs the stage
/// pipeline and forwards to the selected backend.
pub struct Dispatcher {
    table: Arc<RoutingTable>,
    stages: Vec<Box<dyn Stage>>,
    forwarder: Forwarder,
    trusted_proxies: TrustedProxyConfig,
    max_body_size: usize,
}

impl Dispatcher {
    pub fn new(
        table: Arc<RoutingTable>,
        stages: Vec<Box<dyn Stage>>,
        forwarder: Forwarder,
        trusted_proxies: TrustedProxyConfig,
        max_body_size: usize,
    ) -> Self {
        Self {
            table,
            stages,
            forwarder,
            trusted_proxies,
            max_body_size,
        }
    }

    /// Handle one inbound request. Never fails: every error becomes a
    /// response, and backend 5xx responses pass through untouched.
    #[instrument(
        skip_all,
        fields(
            method = %request.method(),
            path = %request.uri().path(),
            route = field::Empty,
            status = field::Empty,
        )
    )]
    pub async fn dispatch(&self, request: Request<Body>) -> Response {
        let started = Instant::now();

        let Some(snapshot) = self.table.current() else {
            return finish(
                UNMATCHED_ROUTE,
                started,
                GatewayError::NotConfigured.into_response(),
            );
        };

        let path = request.uri().path().to_owned();
        if has_dot_segment(&path) {
            return finish(
                UNMATCHED_ROUTE,
                started,
                GatewayError::NoRouteMatch(path).into_response(),
            );
        }
        let Some((route, upstream_path)) = snapshot
            .find(&path)
            .and_then(|route| Some((Arc::clone(route), route.upstream_path(&path)?)))
        else {
            return finish(
                UNMATCHED_ROUTE,
                started,
                GatewayError::NoRouteMatch(path).into_response(),
            );
        };
        Span::current().record("route", route.path_prefix.as_str());

        let upstream_path_and_query = match request.uri().query() {
            Some(query) => format!("{upstream_path}?{query}"),
            None => upstream_path,
        };

        let peer = request
            .extensions()
            .get::<ConnectInfo<SocketAddr>>()
            .map(|ConnectInfo(addr)| *addr);
        let identity = client_identity(request.headers(), peer, &self.trusted_proxies);

        let mut ctx = RequestContext::new(
            Arc::clone(&route),
            upstream_path_and_query,
            identity.into_owned(),
        );
        let (parts, body) = request.into_parts();

        let mut response = match self.process(&mut ctx, parts, body, peer).await {
            Ok(response) => response,
            Err(e) => e.into_response(),
        };
        merge_headers(response.headers_mut(), &ctx.response_headers);

        finish(&route.path_prefix, started, response)
    }

    async fn process(
        &self,
        ctx: &mut RequestContext,
        parts: Parts,
        body: Body,
        peer: Option<SocketAddr>,
    ) -> GatewayResult<Response> {
        for stage in &self.stages {
            if let Err(e) = stage.run(ctx, &parts).await {
                debug!(
                    stage = stage.name(),
                    identity = %ctx.identity,
                    error = %e,
                    "Stage rejected request"
                );
                return Err(e);
            }
        }

        // An unused permit releases its probe slot on drop.
        let body = self.read_body(&parts.headers, body).await?;
        let permit = ctx.permit.take();
        let service = ctx.route.service_name.clone();

        let result = self
            .forwarder
            .forward(
                &ctx.route,
                &parts,
                &ctx.upstream_path_and_query,
                std::mem::take(&mut ctx.forward_headers),
                peer,
                body,
            )
            .await;

        // A request refused before sending says nothing about the backend.
        let outcome = match &result {
            Ok(response) => Some(CallOutcome::from_status(response.status())),
            Err(ForwardError::InvalidPath) => None,
            Err(_) => Some(CallOutcome::Failure),
        };
        if let (Some(permit), Some(outcome)) = (permit, outcome) {
            permit.record(outcome);
        }

        result.map_err(|e| match e {
            ForwardError::Timeout => GatewayError::UpstreamTimeout(service),
            ForwardError::Connect(reason) => GatewayError::UpstreamUnavailable { service, reason },
            ForwardError::InvalidPath => {
                GatewayError::NoRouteMatch(ctx.upstream_path_and_query.clone())
            }
        })
    }

    /// Buffer the request body, refusing anything above the configured limit.
    async fn read_body(&self, headers: &HeaderMap, body: Body) -> GatewayResult<Bytes> {
        let declared = headers
            .get(CONTENT_LENGTH)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse::<u64>().ok());
        if declared.is_some_and(|len| len > self.max_body_size as u64) {
            return Err(GatewayError::PayloadTooLarge(self.max_body_size));
        }

        axum::body::to_bytes(body, self.max_body_size)
            .await
            .map_err(|e| {
                debug!(error = %e, "Failed to read request body");
                GatewayError::PayloadTooLarge(self.max_body_size)
            })
    }
}

fn merge_headers(target: &mut HeaderMap, extra: &HeaderMap) {
    for (name, value) in extra.iter() {
        target.insert(name.clone(), value.clone());
    }
}

fn finish(route: &str, started: Instant, response: Response) -> Response {
    let status = response.status();
    Span::current().record("status", status.as_u16());
    metrics::record_request(route, status.as_u16(), started.elapsed().as_secs_f64());
    response
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use async_trait::async_trait;
    use axum::http::StatusCode;
    use serde_json::{Value, json};

    use crate::breaker::BreakerRegistry;
    use crate::middleware::AuthGuard;
    use crate::proxy::standard_pipeline;
    use crate::ratelimit::{CounterStore, MemoryCounterStore, RateLimiter, StoreError};
    use crate::routing::{RoutingConfig, RoutingSnapshot};

    struct DownStore;

    #[async_trait]
    impl CounterStore for DownStore {
        async fn record_and_count(
            &self,
            _key: &str,
            _member: &str,
            _now: u64,
            _window_start: u64,
            _ttl: Duration,
        ) -> Result<u64, StoreError> {
            Err(StoreError::Unavailable("connection refused".to_string()))
        }
    }

    fn dispatcher_with_store(
        table: Arc<RoutingTable>,
        store: Arc<dyn CounterStore>,
        max_body_size: usize,
    ) -> Dispatcher {
        Dispatcher::new(
            table,
            standard_pipeline(
                AuthGuard::new("secret"),
                RateLimiter::new(store),
                Arc::new(BreakerRegistry::default()),
            ),
            Forwarder::new(Duration::from_secs(1)).unwrap(),
            TrustedProxyConfig::default(),
            max_body_size,
        )
    }

    fn dispatcher(table: Arc<RoutingTable>, max_body_size: usize) -> Dispatcher {
        dispatcher_with_store(table, Arc::new(MemoryCounterStore::new()), max_body_size)
    }

    /// Local backend answering 200 to everything and counting the hits.
    async fn counting_backend() -> (SocketAddr, Arc<AtomicUsize>) {
        let hits = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&hits);
        let app = axum::Router::new().fallback(move || {
            let counter = Arc::clone(&counter);
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                "ok"
            }
        });

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        (addr, hits)
    }

    fn get(path: &str) -> Request<Body> {
        Request::get(path).body(Body::empty()).unwrap()
    }

    fn table_with(json: &str) -> Arc<RoutingTable> {
        let table = Arc::new(RoutingTable::new());
        let cfg = RoutingConfig::from_json(json.as_bytes()).unwrap();
        table.publish(RoutingSnapshot::compile(&cfg, 1));
        table
    }

    const PUBLIC_ROUTE: &str = r#"{
        "services": { "svc": { "name": "svc", "url": "http://127.0.0.1:9" } },
        "routes": [ { "path_prefix": "/svc", "service_name": "svc" } ]
    }"#;

    #[tokio::test]
    async fn test_unconfigured_gateway_returns_503() {
        let d = dispatcher(Arc::new(RoutingTable::new()), 1024);
        let response = d
            .dispatch(Request::get("/anything").body(Body::empty()).unwrap())
            .await;
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    }

    #[tokio::test]
    async fn test_unmatched_path_returns_404() {
        let d = dispatcher(table_with(PUBLIC_ROUTE), 1024);
        let response = d
            .dispatch(Request::get("/svcx/1").body(Body::empty()).unwrap())
            .await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_declared_oversized_body_returns_413() {
        let d = dispatcher(table_with(PUBLIC_ROUTE), 8);
        let request = Request::post("/svc/upload")
            .header(CONTENT_LENGTH, "64")
            .body(Body::from(vec![0u8; 64]))
            .unwrap();
        assert_eq!(d.dispatch(request).await.status(), StatusCode::PAYLOAD_TOO_LARGE);
    }

    #[tokio::test]
    async fn test_undeclared_oversized_body_returns_413() {
        let d = dispatcher(table_with(PUBLIC_ROUTE), 8);
        let request = Request::post("/svc/upload")
            .body(Body::from(vec![0u8; 64]))
            .unwrap();
        assert_eq!(d.dispatch(request).await.status(), StatusCode::PAYLOAD_TOO_LARGE);
    }

    #[tokio::test]
    async fn test_dot_segments_cannot_escape_base_path() {
        let (backend, hits) = counting_backend().await;
        let table = table_with(
            &json!({
                "services": {
                    "users": { "name": "users", "url": format!("http://{backend}/public") }
                },
                "routes": [ { "path_prefix": "/pub", "service_name": "users" } ]
            })
            .to_string(),
        );
        let d = dispatcher(table, 1024);

        for path in [
            "/pub/../internal/secret",
            "/pub/%2e%2e/internal/secret",
            "/pub/%2E%2E/internal/secret",
            "/pub/./../internal",
        ] {
            let response = d.dispatch(get(path)).await;
            assert_eq!(response.status(), StatusCode::NOT_FOUND, "{path}");
        }
        assert_eq!(hits.load(Ordering::SeqCst), 0);

        assert_eq!(d.dispatch(get("/pub/docs")).await.status(), StatusCode::OK);
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_counter_store_failure_fails_closed() {
        let (backend, hits) = counting_backend().await;
        let doc = json!({
            "services": { "svc": { "name": "svc", "url": format!("http://{backend}") } },
            "routes": [ {
                "path_prefix": "/svc",
                "service_name": "svc",
                "middleware": { "rate_limit": { "tiers": {
                    "default": { "requests": 5, "window_seconds": 60 }
                } } }
            } ]
        })
        .to_string();

        let down = dispatcher_with_store(table_with(&doc), Arc::new(DownStore), 1024);
        let response = down.dispatch(get("/svc/orders")).await;
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        let body = axum::body::to_bytes(response.into_body(), 1024).await.unwrap();
        let body: Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(body["error"], "rate_limit_unavailable");
        assert_eq!(hits.load(Ordering::SeqCst), 0);

        // Same route with a working store does reach the backend.
        let up = dispatcher(table_with(&doc), 1024);
        assert_eq!(up.dispatch(get("/svc/orders")).await.status(), StatusCode::OK);
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_merge_headers_overrides() {
        let mut target = HeaderMap::new();
        target.insert("x-ratelimit-limit", "1".parse().unwrap());
        let mut extra = HeaderMap::new();
        extra.insert("x-ratelimit-limit", "5".parse().unwrap());

        merge_headers(&mut target, &extra);
        assert_eq!(target.get("x-ratelimit-limit").unwrap(), "5");
    }
}
