//! Background task keeping the routing table in sync with the config source.

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use super::model::RoutingConfig;
use super::table::{RoutingSnapshot, RoutingTable};
use crate::error::GatewayError;
use crate::metrics;
use crate::source::{ConfigSource, KvEntry, SourceError};

/// Long-polls one key and republishes the routing table on every change.
///
/// A broken document is logged and skipped; the previous snapshot keeps
/// serving traffic. Transport errors are retried after a fixed backoff. The
/// loop only ends when its cancellation token fires.
pub struct ConfigWatcher {
    source: Arc<dyn ConfigSource>,
    table: Arc<RoutingTable>,
    key: String,
    backoff: Duration,
}

impl ConfigWatcher {
    pub fn new(
        source: Arc<dyn ConfigSource>,
        table: Arc<RoutingTable>,
        key: impl Into<String>,
        backoff: Duration,
    ) -> Self {
        Self {
            source,
            table,
            key: key.into(),
            backoff,
        }
    }

    /// One non-blocking read at startup.
    ///
    /// Returns the version to start watching from; `0` when the read failed,
    /// so the first watch returns immediately. Never fatal: the gateway starts
    /// unconfigured and the watcher fills the table in later.
    #[instrument(skip(self), fields(key = %self.key))]
    pub async fn load_initial(&self) -> u64 {
        match self.source.get(&self.key).await {
            Ok(entry) => {
                let version = entry.version;
                self.handle(entry);
                version
            }
            Err(e) => {
                let err = GatewayError::ConfigFetch(e.to_string());
                warn!(error = %err, "Initial configuration load failed, starting unconfigured");
                metrics::record_config_reload(metrics::reload::FETCH_ERROR);
                0
            }
        }
    }

    /// Watch until `cancel` fires, starting after version `last_seen`.
    pub async fn run(self, mut last_seen: u64, cancel: CancellationToken) {
        info!(key = %self.key, last_seen, "Config watcher started");

        loop {
            tokio::select! {
                biased;

                _ = cancel.cancelled() => {
                    debug!("Config watcher received cancellation signal");
                    break;
                }
                result = self.poll(last_seen) => match result {
                    Ok(version) => last_seen = version,
                    Err(e) => {
                        let err = GatewayError::ConfigFetch(e.to_string());
                        warn!(
                            error = %err,
                            backoff = ?self.backoff,
                            "Config watch failed, retrying"
                        );
                        metrics::record_config_reload(metrics::reload::FETCH_ERROR);

                        tokio::select! {
                            biased;
                            _ = cancel.cancelled() => break,
                            _ = tokio::time::sleep(self.backoff) => {}
                        }
                    }
                }
            }
        }

        debug!("Config watcher shutting down");
    }

    /// One blocking watch. Returns the version to resume from.
    async fn poll(&self, last_seen: u64) -> Result<u64, SourceError> {
        let entry = self.source.watch(&self.key, last_seen).await?;

        if entry.version < last_seen {
            warn!(
                version = entry.version,
                last_seen, "Config source index went backwards, re-reading from scratch"
            );
            return Ok(0);
        }
        if entry.version == last_seen {
            return Ok(last_seen);
        }

        let version = entry.version;
        self.handle(entry);
        Ok(version)
    }

    /// Apply a freshly read entry. Absent or unparsable values leave the
    /// current snapshot untouched.
    fn handle(&self, entry: KvEntry) {
        let Some(raw) = entry.value else {
            debug!(key = %self.key, version = entry.version, "Configuration key absent");
            return;
        };

        match RoutingConfig::from_json(&raw) {
            Ok(cfg) => {
                let snapshot = RoutingSnapshot::compile(&cfg, entry.version);
                if snapshot.len() < cfg.routes.len() {
                    warn!(
                        version = entry.version,
                        declared = cfg.routes.len(),
                        compiled = snapshot.len(),
                        "Some routes were dropped during compilation"
                    );
                }
                self.table.publish(snapshot);
                metrics::record_config_reload(metrics::reload::APPLIED);
            }
            Err(e) => {
                let err = GatewayError::ConfigParse(e);
                error!(
                    version = entry.version,
                    error = %err,
                    "Ignoring invalid configuration, keeping previous routes"
                );
                metrics::record_config_reload(metrics::reload::PARSE_ERROR);
            }
        }
    }
}
