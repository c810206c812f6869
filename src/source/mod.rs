//! Where the routing configuration comes from.
//!
//! A [`ConfigSource`] is a versioned key-value store supporting blocking
//! reads: [`watch`](ConfigSource::watch) parks until the key changes past a
//! given version or the source's wait bound elapses.

mod consul;
mod memory;

use async_trait::async_trait;
use thiserror::Error;

pub use consul::ConsulSource;
pub use memory::MemorySource;

/// Value of one key at one version.
///
/// `value` is `None` when the key does not exist; the version is still
/// meaningful so watchers can block past it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KvEntry {
    pub version: u64,
    pub value: Option<Vec<u8>>,
}

#[derive(Error, Debug)]
pub enum SourceError {
    #[error("config source request failed: {0}")]
    Transport(String),

    #[error("config source returned HTTP {0}")]
    Status(u16),

    #[error("config source response invalid: {0}")]
    Protocol(String),
}

#[async_trait]
pub trait ConfigSource: Send + Sync {
    /// Read `key` without blocking.
    async fn get(&self, key: &str) -> Result<KvEntry, SourceError>;

    /// Block until `key` changes past `since_version`, or until the source's
    /// wait bound elapses, in which case the current state is returned with a
    /// version that may equal `since_version`.
    async fn watch(&self, key: &str, since_version: u64) -> Result<KvEntry, SourceError>;
}
