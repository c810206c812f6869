//! Request ID middleware for cross-service tracing.
//!
//! Every request leaving the gateway, towards a backend or back to the
//! client, carries an `X-Request-Id`:
//!
//! 1. A well-formed client-supplied ID is kept
//! 2. Otherwise a UUIDv4 is generated
//! 3. The ID is written into the request headers, so the forwarder passes it
//!    to the backend unchanged
//! 4. The same ID is set on the response, including gateway-generated errors
//!
//! ```bash
//! curl -H "X-Request-Id: my-correlation-id" http://localhost:8080/api/users
//! ```

use std::task::{Context, Poll};

use axum::body::Body;
use axum::http::header::{HeaderName, HeaderValue};
use axum::http::{Request, Response};
use tower::{Layer, Service};
use tracing::{Span, debug};
use uuid::Uuid;

/// Header name for request ID.
pub static REQUEST_ID_HEADER: HeaderName = HeaderName::from_static("x-request-id");

/// Longest client-supplied ID we keep; longer ones are replaced.
const MAX_REQUEST_ID_LEN: usize = 128;

/// Request ID layer for Tower middleware stack.
#[derive(Clone, Default)]
pub struct RequestIdLayer;

impl RequestIdLayer {
    pub fn new() -> Self {
        Self
    }
}

impl<S> Layer<S> for RequestIdLayer {
    type Service = RequestIdService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        RequestIdService { inner }
    }
}

#[derive(Clone)]
pub struct RequestIdService<S> {
    inner: S,
}

impl<S> Service<Request<Body>> for RequestIdService<S>
where
    S: Service<Request<Body>, Response = Response<Body>> + Clone + Send + 'static,
    S::Future: Send,
{
    type Response = Response<Body>;
    type Error = S::Error;
    type Future = std::pin::Pin<
        Box<dyn std::future::Future<Output = Result<Self::Response, Self::Error>> + Send>,
    >;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, mut req: Request<Body>) -> Self::Future {
        let request_id = accept_or_generate(req.headers().get(&REQUEST_ID_HEADER));
        req.headers_mut()
            .insert(REQUEST_ID_HEADER.clone(), request_id.clone());

        if let Ok(id) = request_id.to_str() {
            Span::current().record("request_id", id);
            debug!(request_id = id, "Processing request");
        }

        // Drive the service that was polled ready, leave the clone for the next call.
        let clone = self.inner.clone();
        let mut inner = std::mem::replace(&mut self.inner, clone);

        Box::pin(async move {
            let mut response = inner.call(req).await?;
            response
                .headers_mut()
                .insert(REQUEST_ID_HEADER.clone(), request_id);
            Ok(response)
        })
    }
}

/// Keep a usable incoming ID, otherwise mint a UUIDv4.
fn accept_or_generate(incoming: Option<&HeaderValue>) -> HeaderValue {
    if let Some(value) = incoming
        && let Ok(text) = value.to_str()
        && is_acceptable(text)
    {
        return value.clone();
    }

    let generated = Uuid::new_v4().to_string();
    // A hyphenated UUID is always a valid header value.
    HeaderValue::from_str(&generated).unwrap_or_else(|_| HeaderValue::from_static("unknown"))
}

fn is_acceptable(id: &str) -> bool {
    !id.is_empty()
        && id.len() <= MAX_REQUEST_ID_LEN
        && id
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || matches!(b, b'-' | b'_' | b'.' | b':'))
}
