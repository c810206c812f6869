//! Sliding-window counter storage.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("counter store unavailable: {0}")]
    Unavailable(String),

    #[error("counter store command failed: {0}")]
    Command(String),
}

/// Shared storage for per-key request timestamps.
///
/// Implementations must run the whole operation as one atomic unit: no other
/// client may observe or modify the key between the trim and the count.
#[async_trait]
pub trait CounterStore: Send + Sync {
    /// Record `member` at score `now` under `key` and return how many members
    /// remain after discarding those scored in `[0, window_start]`.
    ///
    /// The key expires `ttl` after the last write.
    async fn record_and_count(
        &self,
        key: &str,
        member: &str,
        now: u64,
        window_start: u64,
        ttl: Duration,
    ) -> Result<u64, StoreError>;
}

struct WindowSet {
    /// (score, member), kept sorted by score.
    members: Vec<(u64, String)>,
    expires_at: Instant,
}

/// In-process counter store for tests and single-instance development.
///
/// State is lost on restart and not shared between gateway instances.
#[derive(Default)]
pub struct MemoryCounterStore {
    sets: Mutex<HashMap<String, WindowSet>>,
}

impl MemoryCounterStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CounterStore for MemoryCounterStore {
    async fn record_and_count(
        &self,
        key: &str,
        member: &str,
        now: u64,
        window_start: u64,
        ttl: Duration,
    ) -> Result<u64, StoreError> {
        let mut sets = self
            .sets
            .lock()
            .map_err(|_| StoreError::Unavailable("memory store lock poisoned".to_string()))?;

        let clock = Instant::now();
        sets.retain(|_, set| set.expires_at > clock);

        let set = sets.entry(key.to_string()).or_insert_with(|| WindowSet {
            members: Vec::new(),
            expires_at: clock + ttl,
        });

        set.members.retain(|(score, _)| *score > window_start);
        set.members.retain(|(_, m)| m != member);
        let at = set.members.partition_point(|(score, _)| *score <= now);
        set.members.insert(at, (now, member.to_string()));
        set.expires_at = clock + ttl;

        Ok(set.members.len() as u64)
    }
}
