//! The ordered checks a request passes before it is forwarded.
//!
//! ```text
//!   ┌──────────┐    ┌─────────────┐    ┌────────────────┐
//!   │   Auth   │ ─► │ Rate Limit  │ ─► │ Circuit Breaker│ ─► forward
//!   └────┬─────┘    └──────┬──────┘    └───────┬────────┘
//!        ▼                 ▼                   ▼
//!       401               429 / 500           503
//! ```
//!
//! Stages share a [`RequestContext`]: auth sets the identity the limiter keys
//! on, the limiter adds response headers, the breaker leaves a permit for the
//! dispatcher to settle once the backend has answered.

use std::sync::Arc;

use async_trait::async_trait;
use axum::http::HeaderMap;
use axum::http::HeaderValue;
use axum::http::request::Parts;
use tracing::debug;

use crate::breaker::{BreakerRegistry, CallPermit};
use crate::error::{AuthError, GatewayError, GatewayResult, USER_ID_HEADER};
use crate::metrics;
use crate::middleware::{AuthGuard, Principal};
use crate::ratelimit::{Decision, RateLimiter, TIER_HEADER, select_tier_name};
use crate::routing::RouteEntry;

/// Per-request state threaded through the pipeline.
#[derive(Debug)]
pub struct RequestContext {
    pub route: Arc<RouteEntry>,
    /// Path and query sent to the backend.
    pub upstream_path_and_query: String,
    /// User id when authenticated, network address otherwise.
    pub identity: String,
    pub principal: Option<Principal>,
    /// Added to the forwarded request.
    pub forward_headers: HeaderMap,
    /// Added to whatever response the client receives.
    pub response_headers: HeaderMap,
    pub permit: Option<CallPermit>,
}

impl RequestContext {
    pub fn new(route: Arc<RouteEntry>, upstream_path_and_query: String, identity: String) -> Self {
        Self {
            route,
            upstream_path_and_query,
            identity,
            principal: None,
            forward_headers: HeaderMap::new(),
            response_headers: HeaderMap::new(),
            permit: None,
        }
    }
}

/// One step of the request pipeline. Returning an error short-circuits the
/// request with that error's response.
#[async_trait]
pub trait Stage: Send + Sync {
    fn name(&self) -> &'static str;

    async fn run(&self, ctx: &mut RequestContext, request: &Parts) -> GatewayResult<()>;
}

/// Verifies bearer tokens on routes that require them.
pub struct AuthStage {
    guard: AuthGuard,
}

impl AuthStage {
    pub fn new(guard: AuthGuard) -> Self {
        Self { guard }
    }
}

#[async_trait]
impl Stage for AuthStage {
    fn name(&self) -> &'static str {
        "auth"
    }

    async fn run(&self, ctx: &mut RequestContext, request: &Parts) -> GatewayResult<()> {
        if !ctx.route.auth_required {
            return Ok(());
        }

        let principal = self.guard.authenticate(&request.headers)?;
        let user_id =
            HeaderValue::from_str(&principal.user_id).map_err(|_| AuthError::MissingUserId)?;

        debug!(route = %ctx.route.path_prefix, user_id = %principal.user_id, "Authenticated");
        ctx.forward_headers.insert(USER_ID_HEADER.clone(), user_id);
        ctx.identity = principal.user_id.clone();
        ctx.principal = Some(principal);
        Ok(())
    }
}

/// Applies the route's tiered quota.
pub struct RateLimitStage {
    limiter: RateLimiter,
}

impl RateLimitStage {
    pub fn new(limiter: RateLimiter) -> Self {
        Self { limiter }
    }
}

#[async_trait]
impl Stage for RateLimitStage {
    fn name(&self) -> &'static str {
        "rate_limit"
    }

    async fn run(&self, ctx: &mut RequestContext, request: &Parts) -> GatewayResult<()> {
        let route = Arc::clone(&ctx.route);
        if route.tiers.is_empty() {
            return Ok(());
        }

        let claim = ctx.principal.as_ref().and_then(|p| p.tier.as_deref());
        let header = request
            .headers
            .get(&TIER_HEADER)
            .and_then(|v| v.to_str().ok());
        let tier = select_tier_name(claim, header);

        let decision = self
            .limiter
            .admit(&route.path_prefix, &ctx.identity, tier, &route.tiers)
            .await
            .map_err(|e| GatewayError::RateLimitStore(e.to_string()))?;

        match decision {
            Decision::Unmetered => Ok(()),
            Decision::Admitted(headers) => {
                headers.apply(&mut ctx.response_headers);
                Ok(())
            }
            Decision::Limited(headers) => {
                metrics::record_rate_limit_rejection(&route.path_prefix);
                Err(GatewayError::RateLimitExceeded {
                    route: route.path_prefix.clone(),
                    headers,
                })
            }
        }
    }
}

/// Fails fast when the route's backend is known to be down.
pub struct BreakerStage {
    registry: Arc<BreakerRegistry>,
}

impl BreakerStage {
    pub fn new(registry: Arc<BreakerRegistry>) -> Self {
        Self { registry }
    }
}

#[async_trait]
impl Stage for BreakerStage {
    fn name(&self) -> &'static str {
        "circuit_breaker"
    }

    async fn run(&self, ctx: &mut RequestContext, _request: &Parts) -> GatewayResult<()> {
        let breaker = self.registry.get_or_create(&ctx.route.service_name);
        ctx.permit = Some(breaker.try_acquire()?);
        Ok(())
    }
}

/// Auth, then rate limit, then circuit breaker.
pub fn standard_pipeline(
    guard: AuthGuard,
    limiter: RateLimiter,
    breakers: Arc<BreakerRegistry>,
) -> Vec<Box<dyn Stage>> {
    vec![
        Box::new(AuthStage::new(guard)),
        Box::new(RateLimitStage::new(limiter)),
        Box::new(BreakerStage::new(breakers)),
    ]
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    use axum::http::Request;
    use jsonwebtoken::{EncodingKey, Header, encode};
    use reqwest::Url;
    use serde_json::json;

    use crate::breaker::CircuitBreakerConfig;
    use crate::ratelimit::{MemoryCounterStore, TierLimit};

    const SECRET: &str = "stage-test-secret";

    fn route(auth_required: bool, tiers: &[(&str, u64, u64)]) -> Arc<RouteEntry> {
        Arc::new(RouteEntry {
            path_prefix: "/api".to_string(),
            service_name: "users".to_string(),
            base_url: Url::parse("http://users").unwrap(),
            auth_required,
            tiers: tiers
                .iter()
                .map(|(n, r, w)| {
                    (
                        n.to_string(),
                        TierLimit {
                            requests: *r,
                            window_seconds: *w,
                        },
                    )
                })
                .collect::<HashMap<_, _>>(),
        })
    }

    fn parts(headers: &[(&str, &str)]) -> Parts {
        let mut builder = Request::builder().uri("/api/x");
        for (k, v) in headers {
            builder = builder.header(*k, *v);
        }
        builder.body(()).unwrap().into_parts().0
    }

    fn token(claims: serde_json::Value) -> String {
        encode(
            &Header::default(),
            &claims,
            &EncodingKey::from_secret(SECRET.as_bytes()),
        )
        .unwrap()
    }

    #[tokio::test]
    async fn test_auth_stage_skips_public_routes() {
        let stage = AuthStage::new(AuthGuard::new(SECRET));
        let mut ctx = RequestContext::new(route(false, &[]), "/x".into(), "10.0.0.1".into());

        stage.run(&mut ctx, &parts(&[])).await.unwrap();
        assert!(ctx.principal.is_none());
        assert_eq!(ctx.identity, "10.0.0.1");
    }

    #[tokio::test]
    async fn test_auth_stage_sets_identity_and_header() {
        let stage = AuthStage::new(AuthGuard::new(SECRET));
        let mut ctx = RequestContext::new(route(true, &[]), "/x".into(), "10.0.0.1".into());
        let bearer = format!("Bearer {}", token(json!({ "user_id": "alice" })));

        stage
            .run(&mut ctx, &parts(&[("authorization", &bearer)]))
            .await
            .unwrap();
        assert_eq!(ctx.identity, "alice");
        assert_eq!(ctx.forward_headers.get(&USER_ID_HEADER).unwrap(), "alice");
    }

    #[tokio::test]
    async fn test_auth_stage_rejects_missing_token() {
        let stage = AuthStage::new(AuthGuard::new(SECRET));
        let mut ctx = RequestContext::new(route(true, &[]), "/x".into(), "10.0.0.1".into());

        let err = stage.run(&mut ctx, &parts(&[])).await.unwrap_err();
        assert!(matches!(err, GatewayError::Auth(AuthError::MissingHeader)));
    }

    #[tokio::test]
    async fn test_rate_limit_stage_uses_token_tier_over_header() {
        let stage = RateLimitStage::new(RateLimiter::new(Arc::new(MemoryCounterStore::new())));
        let mut ctx = RequestContext::new(
            route(true, &[("default", 1, 60), ("premium", 10, 60)]),
            "/x".into(),
            "alice".into(),
        );
        ctx.principal = Some(Principal {
            user_id: "alice".into(),
            tier: Some("premium".into()),
        });

        stage
            .run(&mut ctx, &parts(&[("x-user-tier", "default")]))
            .await
            .unwrap();
        assert_eq!(ctx.response_headers.get("x-ratelimit-limit").unwrap(), "10");
    }

    #[tokio::test]
    async fn test_rate_limit_stage_rejects_over_quota() {
        let stage = RateLimitStage::new(RateLimiter::new(Arc::new(MemoryCounterStore::new())));
        let request = parts(&[]);

        let context = || {
            RequestContext::new(route(false, &[("default", 1, 60)]), "/".into(), "ip".into())
        };

        let mut first = context();
        stage.run(&mut first, &request).await.unwrap();

        let mut second = context();
        let err = stage.run(&mut second, &request).await.unwrap_err();
        assert!(matches!(err, GatewayError::RateLimitExceeded { .. }));
    }

    #[tokio::test]
    async fn test_breaker_stage_leaves_permit_then_rejects_when_open() {
        let registry = Arc::new(BreakerRegistry::new(CircuitBreakerConfig::new(
            0,
            1,
            std::time::Duration::from_secs(30),
        )));
        let stage = BreakerStage::new(Arc::clone(&registry));
        let request = parts(&[]);

        let mut ctx = RequestContext::new(route(false, &[]), "/".into(), "ip".into());
        stage.run(&mut ctx, &request).await.unwrap();
        ctx.permit
            .take()
            .unwrap()
            .record(crate::breaker::CallOutcome::Failure);

        let mut next = RequestContext::new(route(false, &[]), "/".into(), "ip".into());
        let err = stage.run(&mut next, &request).await.unwrap_err();
        assert!(matches!(err, GatewayError::CircuitOpen(ref s) if s == "users"));
    }

    #[test]
    fn test_standard_pipeline_order() {
        let pipeline = standard_pipeline(
            AuthGuard::new(SECRET),
            RateLimiter::new(Arc::new(MemoryCounterStore::new())),
            Arc::new(BreakerRegistry::default()),
        );
        let names: Vec<_> = pipeline.iter().map(|s| s.name()).collect();
        assert_eq!(names, vec!["auth", "rate_limit", "circuit_breaker"]);
    }
}
