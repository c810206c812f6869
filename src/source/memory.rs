use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::watch;

use super::{ConfigSource, KvEntry, SourceError};

#[derive(Debug, Default)]
struct Store {
    /// Store-wide index, bumped by every write.
    index: u64,
    entries: HashMap<String, KvEntry>,
}

impl Store {
    fn entry(&self, key: &str) -> KvEntry {
        self.entries.get(key).cloned().unwrap_or(KvEntry {
            version: self.index,
            value: None,
        })
    }
}

/// In-process config source with Consul-like versioning.
///
/// Every `put` or `delete` bumps a store-wide index and stamps the key with
/// it. Watchers wake through a `tokio::sync::watch` channel.
pub struct MemorySource {
    store: watch::Sender<Store>,
    wait: Duration,
}

impl MemorySource {
    pub fn new() -> Self {
        Self::with_wait(Duration::from_secs(30))
    }

    /// Bound how long `watch` blocks when nothing changes.
    pub fn with_wait(wait: Duration) -> Self {
        let (store, _) = watch::channel(Store::default());
        Self { store, wait }
    }

    /// Write `value` under `key`; returns the new version.
    pub fn put(&self, key: &str, value: impl Into<Vec<u8>>) -> u64 {
        self.write(key, Some(value.into()))
    }

    pub fn delete(&self, key: &str) -> u64 {
        self.write(key, None)
    }

    fn write(&self, key: &str, value: Option<Vec<u8>>) -> u64 {
        let mut version = 0;
        self.store.send_modify(|store| {
            store.index += 1;
            version = store.index;
            store
                .entries
                .insert(key.to_string(), KvEntry { version, value });
        });
        version
    }
}

impl Default for MemorySource {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ConfigSource for MemorySource {
    async fn get(&self, key: &str) -> Result<KvEntry, SourceError> {
        Ok(self.store.borrow().entry(key))
    }

    async fn watch(&self, key: &str, since_version: u64) -> Result<KvEntry, SourceError> {
        let mut rx = self.store.subscribe();
        let changed = rx.wait_for(|store| store.entry(key).version > since_version);

        match tokio::time::timeout(self.wait, changed).await {
            Ok(Ok(store)) => Ok(store.entry(key)),
            // The sender lives in `self`, so the channel cannot close here.
            Ok(Err(e)) => Err(SourceError::Transport(e.to_string())),
            Err(_elapsed) => Ok(self.store.borrow().entry(key)),
        }
    }
}
