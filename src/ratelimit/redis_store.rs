//! Redis-backed counter store.

use std::time::Duration;

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use tracing::info;

use super::store::{CounterStore, StoreError};

/// Sorted-set sliding windows in Redis.
///
/// Each call runs `ZREMRANGEBYSCORE`, `ZADD`, `ZCARD` and `EXPIRE` inside one
/// `MULTI`/`EXEC` transaction. Gateway instances share counters through the
/// server, so there is no local state to keep consistent.
#[derive(Clone)]
pub struct RedisCounterStore {
    conn: ConnectionManager,
}

impl RedisCounterStore {
    /// Connect to `url` (e.g. `redis://localhost:6379`).
    ///
    /// The connection manager reconnects on its own after transient failures;
    /// calls made while it is down fail and are surfaced as `StoreError`.
    pub async fn connect(url: &str) -> Result<Self, StoreError> {
        let client =
            redis::Client::open(url).map_err(|e| StoreError::Unavailable(e.to_string()))?;
        let conn = ConnectionManager::new(client)
            .await
            .map_err(|e| StoreError::Unavailable(e.to_string()))?;
        info!("Connected to Redis counter store");
        Ok(Self { conn })
    }
}

#[async_trait]
impl CounterStore for RedisCounterStore {
    async fn record_and_count(
        &self,
        key: &str,
        member: &str,
        now: u64,
        window_start: u64,
        ttl: Duration,
    ) -> Result<u64, StoreError> {
        let mut conn = self.conn.clone();
        let ttl_secs = i64::try_from(ttl.as_secs()).unwrap_or(i64::MAX).max(1);

        let (count,): (u64,) = redis::pipe()
            .atomic()
            .zrembyscore(key, 0, window_start)
            .ignore()
            .zadd(key, member, now)
            .ignore()
            .zcard(key)
            .expire(key, ttl_secs)
            .ignore()
            .query_async(&mut conn)
            .await
            .map_err(|e| StoreError::Command(e.to_string()))?;

        Ok(count)
    }
}
