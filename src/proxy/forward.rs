//! Upstream HTTP forwarding.
//!
//! The request body is already buffered when it gets here; the response body
//! is streamed back to the client as the backend produces it.

use std::net::SocketAddr;
use std::time::Duration;

use axum::body::{Body, Bytes};
use axum::http::header::{CONNECTION, CONTENT_LENGTH, HOST};
use axum::http::request::Parts;
use axum::http::{HeaderMap, HeaderName, HeaderValue, Response};
use reqwest::Url;
use thiserror::Error;
use tracing::{debug, instrument};

use crate::error::USER_ID_HEADER;
use crate::routing::RouteEntry;

static X_FORWARDED_FOR: HeaderName = HeaderName::from_static("x-forwarded-for");
static X_FORWARDED_HOST: HeaderName = HeaderName::from_static("x-forwarded-host");
static X_FORWARDED_PROTO: HeaderName = HeaderName::from_static("x-forwarded-proto");

/// Connection-scoped headers that must not cross the proxy (RFC 9110 §7.6.1).
const HOP_BY_HOP: [&str; 8] = [
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

/// Why the backend produced no response.
#[derive(Debug, Error)]
pub enum ForwardError {
    #[error("upstream request timed out")]
    Timeout,

    #[error("upstream connection failed: {0}")]
    Connect(String),

    /// The path would resolve outside the backend's base path.
    #[error("request path contains dot segments")]
    InvalidPath,
}

/// Sends requests to backends over a shared connection pool.
#[derive(Clone)]
pub struct Forwarder {
    client: reqwest::Client,
}

impl Forwarder {
    /// `timeout` bounds the whole upstream exchange, body included.
    pub fn new(timeout: Duration) -> Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .redirect(reqwest::redirect::Policy::none())
            .build()?;
        Ok(Self { client })
    }

    /// Forward one request to `route`'s backend.
    ///
    /// `extra` holds headers set by the pipeline; they replace any
    /// client-supplied header with the same name.
    #[instrument(skip_all, fields(service = %route.service_name, path = %path_and_query))]
    pub async fn forward(
        &self,
        route: &RouteEntry,
        request: &Parts,
        path_and_query: &str,
        extra: HeaderMap,
        peer: Option<SocketAddr>,
        body: Bytes,
    ) -> Result<Response<Body>, ForwardError> {
        let url = upstream_url(&route.base_url, path_and_query).ok_or(ForwardError::InvalidPath)?;
        let headers = outgoing_headers(&request.headers, extra, peer);

        let upstream = self
            .client
            .request(request.method.clone(), url)
            .headers(headers)
            .body(body)
            .send()
            .await
            .map_err(|e| {
                debug!(error = %e, "Upstream request failed");
                if e.is_timeout() {
                    ForwardError::Timeout
                } else {
                    ForwardError::Connect(e.to_string())
                }
            })?;

        let status = upstream.status();
        let mut headers = upstream.headers().clone();
        strip_hop_by_hop(&mut headers);

        let mut response = Response::new(Body::from_stream(upstream.bytes_stream()));
        *response.status_mut() = status;
        *response.headers_mut() = headers;
        Ok(response)
    }
}

/// Join the backend base URL with the stripped request path. A base path such
/// as `http://svc/v1` is kept: `/users?x=1` becomes `http://svc/v1/users?x=1`.
///
/// `None` for paths with dot segments, which `Url` would resolve above the
/// base path.
fn upstream_url(base: &Url, path_and_query: &str) -> Option<Url> {
    let (path, query) = match path_and_query.split_once('?') {
        Some((path, query)) => (path, Some(query)),
        None => (path_and_query, None),
    };
    if has_dot_segment(path) {
        return None;
    }

    let mut url = base.clone();
    url.set_path(&format!("{}{}", base.path().trim_end_matches('/'), path));
    url.set_query(query);
    Some(url)
}

/// True if any segment of `path` is `.` or `..`, raw or percent-encoded.
/// Backslashes count as separators, as they do in `http` URLs.
pub(crate) fn has_dot_segment(path: &str) -> bool {
    path.split(['/', '\\']).any(|segment| {
        let decoded = segment.to_ascii_lowercase().replace("%2e", ".");
        decoded == "." || decoded == ".."
    })
}

fn outgoing_headers(
    incoming: &HeaderMap,
    extra: HeaderMap,
    peer: Option<SocketAddr>,
) -> HeaderMap {
    let mut headers = incoming.clone();
    strip_hop_by_hop(&mut headers);
    headers.remove(HOST);
    headers.remove(CONTENT_LENGTH);
    headers.remove(&USER_ID_HEADER);

    if let Some(host) = incoming.get(HOST) {
        headers.insert(X_FORWARDED_HOST.clone(), host.clone());
    }
    headers.insert(X_FORWARDED_PROTO.clone(), HeaderValue::from_static("http"));

    if let Some(peer) = peer {
        let chain = match incoming.get(&X_FORWARDED_FOR).and_then(|v| v.to_str().ok()) {
            Some(prior) if !prior.trim().is_empty() => format!("{prior}, {}", peer.ip()),
            _ => peer.ip().to_string(),
        };
        if let Ok(value) = HeaderValue::from_str(&chain) {
            headers.insert(X_FORWARDED_FOR.clone(), value);
        }
    }

    for (name, value) in extra.iter() {
        headers.insert(name.clone(), value.clone());
    }
    headers
}

/// Remove the fixed hop-by-hop set plus anything named in `Connection`.
fn strip_hop_by_hop(headers: &mut HeaderMap) {
    let listed: Vec<HeaderName> = headers
        .get_all(CONNECTION)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .filter_map(|name| HeaderName::from_bytes(name.trim().as_bytes()).ok())
        .collect();

    for name in listed {
        headers.remove(name);
    }
    for name in HOP_BY_HOP {
        headers.remove(name);
    }
}
