//! Distributed sliding-window rate limiting with per-route tiers.
//!
//! Each (route, identity) pair owns one window in the shared
//! [`CounterStore`], keyed `ratelimit:{route_prefix}:{identity}`. Every
//! request is recorded before the limit is checked, so rejected requests
//! also occupy the window until they age out. Gateway instances never cache
//! counts locally: the store's transactional batch is the only
//! synchronization.
//!
//! # Tier resolution
//!
//! A route declares named tiers. The tier for a request is looked up by name,
//! then falls back to `"default"`; when neither exists the request is
//! **unmetered** and passes without touching the store.

mod redis_store;
mod store;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use axum::http::{HeaderMap, HeaderName, HeaderValue};
use serde::Serialize;
use tracing::debug;

pub use redis_store::RedisCounterStore;
pub use store::{CounterStore, MemoryCounterStore, StoreError};

/// Tier used when neither the token nor the request names one.
pub const DEFAULT_TIER: &str = "default";

/// Request header naming the caller's tier when the token carries none.
pub static TIER_HEADER: HeaderName = HeaderName::from_static("x-user-tier");

static LIMIT_HEADER: HeaderName = HeaderName::from_static("x-ratelimit-limit");
static REMAINING_HEADER: HeaderName = HeaderName::from_static("x-ratelimit-remaining");
static RESET_HEADER: HeaderName = HeaderName::from_static("x-ratelimit-reset");

const NANOS_PER_SEC: u64 = 1_000_000_000;

/// Quota for one tier: at most `requests` per sliding `window_seconds`.
///
/// Both values are non-zero once compiled into a routing snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct TierLimit {
    pub requests: u64,
    pub window_seconds: u64,
}

impl TierLimit {
    pub fn window(&self) -> Duration {
        Duration::from_secs(self.window_seconds)
    }
}

/// Values for the `X-RateLimit-*` response headers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RateLimitHeaders {
    pub limit: u64,
    pub remaining: u64,
    /// Unix seconds at which the current window has fully elapsed.
    pub reset_epoch_secs: u64,
    /// Sent as `Retry-After` on 429 responses.
    pub retry_after_secs: u64,
}

impl RateLimitHeaders {
    /// Write `X-RateLimit-Limit`, `X-RateLimit-Remaining` and `X-RateLimit-Reset`.
    pub fn apply(&self, headers: &mut HeaderMap) {
        headers.insert(LIMIT_HEADER.clone(), HeaderValue::from(self.limit));
        headers.insert(REMAINING_HEADER.clone(), HeaderValue::from(self.remaining));
        headers.insert(RESET_HEADER.clone(), HeaderValue::from(self.reset_epoch_secs));
    }
}

/// Outcome of a rate-limit check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decision {
    /// No applicable tier; the request passes without being counted.
    Unmetered,
    /// Within quota.
    Admitted(RateLimitHeaders),
    /// Over quota; `remaining` is always zero.
    Limited(RateLimitHeaders),
}

/// Pick the tier name for a request: token claim, then the tier header,
/// then [`DEFAULT_TIER`].
pub fn select_tier_name<'a>(claim: Option<&'a str>, header: Option<&'a str>) -> &'a str {
    claim
        .or(header)
        .map(str::trim)
        .filter(|name| !name.is_empty())
        .unwrap_or(DEFAULT_TIER)
}

/// Look up `name`, falling back to the `"default"` tier.
pub fn resolve_tier<'a>(
    tiers: &'a HashMap<String, TierLimit>,
    name: &str,
) -> Option<(&'a str, &'a TierLimit)> {
    tiers
        .get_key_value(name)
        .or_else(|| tiers.get_key_value(DEFAULT_TIER))
        .map(|(k, v)| (k.as_str(), v))
}

/// Sliding-window limiter over a shared counter store.
#[derive(Clone)]
pub struct RateLimiter {
    store: Arc<dyn CounterStore>,
}

impl RateLimiter {
    pub fn new(store: Arc<dyn CounterStore>) -> Self {
        Self { store }
    }

    /// Check and record one request against the wall clock.
    ///
    /// # Errors
    ///
    /// Returns `StoreError` when the counter store cannot be reached. Callers
    /// fail closed on it.
    pub async fn admit(
        &self,
        route_prefix: &str,
        identity: &str,
        tier_name: &str,
        tiers: &HashMap<String, TierLimit>,
    ) -> Result<Decision, StoreError> {
        self.admit_at(unix_nanos(), route_prefix, identity, tier_name, tiers)
            .await
    }

    /// Same as [`admit`](Self::admit) with an explicit clock in unix nanoseconds.
    pub async fn admit_at(
        &self,
        now: u64,
        route_prefix: &str,
        identity: &str,
        tier_name: &str,
        tiers: &HashMap<String, TierLimit>,
    ) -> Result<Decision, StoreError> {
        let Some((resolved, tier)) = resolve_tier(tiers, tier_name) else {
            debug!(
                route = route_prefix,
                tier = tier_name,
                "No matching or default tier, request is unmetered"
            );
            return Ok(Decision::Unmetered);
        };

        let window_nanos = tier.window_seconds.saturating_mul(NANOS_PER_SEC);
        let window_start = now.saturating_sub(window_nanos);
        let key = format!("ratelimit:{route_prefix}:{identity}");
        let member = format!("{now}-{:016x}", rand::random::<u64>());

        let count = self
            .store
            .record_and_count(&key, &member, now, window_start, tier.window())
            .await?;

        let mut headers = RateLimitHeaders {
            limit: tier.requests,
            remaining: tier.requests.saturating_sub(count),
            reset_epoch_secs: now / NANOS_PER_SEC + tier.window_seconds,
            retry_after_secs: tier.window_seconds,
        };

        if count > tier.requests {
            headers.remaining = 0;
            debug!(
                route = route_prefix,
                identity,
                tier = resolved,
                count,
                limit = tier.requests,
                "Rate limit exceeded"
            );
            Ok(Decision::Limited(headers))
        } else {
            Ok(Decision::Admitted(headers))
        }
    }
}

fn unix_nanos() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| u64::try_from(d.as_nanos()).unwrap_or(u64::MAX))
        .unwrap_or_default()
}
