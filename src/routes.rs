//! Router assembly.
//!
//! # Middleware Stack
//!
//! ```text
//! Request
//!    │
//!    ▼
//! ┌──────────────────┐
//! │   Request ID     │ ← Accepts or assigns X-Request-Id
//! └────────┬─────────┘
//!          │
//!          ▼
//! ┌──────────────────┐
//! │     Tracing      │ ← One INFO line per response
//! └────────┬─────────┘
//!          │
//!          ▼
//!   /health, /ready   ── local handlers
//!   everything else   ── dispatcher (auth → rate limit → breaker → backend)
//! ```
//!
//! Auth, rate limiting and circuit breaking depend on the matched route, so
//! they run inside the dispatcher rather than as router layers.

use axum::Router;
use axum::body::Body;
use axum::http::Request;
use axum::routing::get;
use tower_http::LatencyUnit;
use tower_http::classify::{ServerErrorsAsFailures, SharedClassifier};
use tower_http::trace::{DefaultOnResponse, MakeSpan, TraceLayer};
use tracing::{Level, Span, info, info_span};

use crate::handlers;
use crate::middleware::{REQUEST_ID_HEADER, RequestIdLayer};
use crate::state::GatewayState;

/// Build the gateway router.
///
/// Serve it with `into_make_service_with_connect_info::<SocketAddr>()` so the
/// dispatcher can see the peer address for client identity and
/// `X-Forwarded-For`.
pub fn build_router(state: GatewayState) -> Router {
    info!(
        max_body_bytes = state.config.max_request_body_size,
        upstream_timeout = ?state.config.upstream_timeout,
        "Building gateway router"
    );

    Router::new()
        .route("/health", get(handlers::health_check))
        .route("/ready", get(handlers::readiness_check))
        .fallback(handlers::proxy)
        .layer(http_trace_layer())
        .layer(RequestIdLayer::new())
        .with_state(state)
}

/// Span per request carrying method, path and request id. Runs inside
/// `RequestIdLayer`, so the id is always present.
#[derive(Clone, Copy, Debug, Default)]
struct RequestSpan;

impl MakeSpan<Body> for RequestSpan {
    fn make_span(&mut self, request: &Request<Body>) -> Span {
        let request_id = request
            .headers()
            .get(&REQUEST_ID_HEADER)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("-");
        info_span!(
            "http_request",
            method = %request.method(),
            path = %request.uri().path(),
            request_id = %request_id,
        )
    }
}

fn http_trace_layer() -> TraceLayer<SharedClassifier<ServerErrorsAsFailures>, RequestSpan> {
    TraceLayer::new_for_http().make_span_with(RequestSpan).on_response(
        DefaultOnResponse::new()
            .level(Level::INFO)
            .latency_unit(LatencyUnit::Millis),
    )
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use std::io;
    use std::net::SocketAddr;
    use std::sync::{Arc, Mutex};

    use tracing_subscriber::fmt::MakeWriter;

    use crate::config::Config;
    use crate::ratelimit::MemoryCounterStore;
    use crate::source::MemorySource;

    /// Log sink shared between the subscriber and the test.
    #[derive(Clone, Default)]
    struct Captured(Arc<Mutex<Vec<u8>>>);

    impl Captured {
        fn text(&self) -> String {
            String::from_utf8_lossy(&self.0.lock().unwrap()).into_owned()
        }
    }

    impl io::Write for Captured {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    impl<'a> MakeWriter<'a> for Captured {
        type Writer = Captured;

        fn make_writer(&'a self) -> Self::Writer {
            self.clone()
        }
    }

    // Current-thread runtime: the spawned server shares the thread-local subscriber.
    #[tokio::test]
    async fn test_each_response_logged_at_info_with_request_id() {
        let captured = Captured::default();
        let subscriber = tracing_subscriber::fmt()
            .with_max_level(Level::INFO)
            .with_ansi(false)
            .with_writer(captured.clone())
            .finish();
        let _guard = tracing::subscriber::set_default(subscriber);

        let state = GatewayState::new(
            Config::default(),
            Arc::new(MemorySource::new()),
            Arc::new(MemoryCounterStore::new()),
        )
        .unwrap();
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let app = build_router(state);
        tokio::spawn(async move {
            axum::serve(
                listener,
                app.into_make_service_with_connect_info::<SocketAddr>(),
            )
            .await
            .unwrap();
        });

        let response = reqwest::Client::new()
            .get(format!("http://{addr}/ready"))
            .header("x-request-id", "log-line-42")
            .send()
            .await
            .unwrap();
        assert_eq!(response.status(), reqwest::StatusCode::SERVICE_UNAVAILABLE);

        let logs = captured.text();
        let line = logs
            .lines()
            .find(|l| l.contains("finished processing request"))
            .expect("no response log line at INFO");
        assert!(line.contains("INFO"), "{line}");
        assert!(line.contains("request_id=log-line-42"), "{line}");
        assert!(line.contains("method=GET"), "{line}");
        assert!(line.contains("path=/ready"), "{line}");
        assert!(line.contains("status=503"), "{line}");
        assert!(line.contains("latency="), "{line}");
    }
}
