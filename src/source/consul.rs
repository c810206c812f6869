//! Consul KV adapter using blocking queries.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::StatusCode;
use tracing::{debug, instrument};

use super::{ConfigSource, KvEntry, SourceError};

const INDEX_HEADER: &str = "x-consul-index";
const TOKEN_HEADER: &str = "x-consul-token";

/// Reads one key from the Consul HTTP API.
///
/// `watch` issues `GET /v1/kv/<key>?raw&index=<since>&wait=<n>s`, which Consul
/// holds open until the key's index moves past `since` or the wait elapses.
#[derive(Clone)]
pub struct ConsulSource {
    client: reqwest::Client,
    address: String,
    token: Option<String>,
    wait: Duration,
}

impl ConsulSource {
    /// Build a source for the agent at `address` (scheme included).
    ///
    /// # Errors
    ///
    /// Returns `SourceError::Transport` if the HTTP client cannot be built.
    pub fn new(
        address: impl Into<String>,
        token: Option<String>,
        wait: Duration,
    ) -> Result<Self, SourceError> {
        // Consul adds up to wait/16 of jitter before answering.
        let timeout = wait + wait / 16 + Duration::from_secs(10);
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| SourceError::Transport(e.to_string()))?;

        Ok(Self {
            client,
            address: address.into().trim_end_matches('/').to_string(),
            token,
            wait,
        })
    }

    async fn fetch(&self, key: &str, since: Option<u64>) -> Result<KvEntry, SourceError> {
        let url = format!("{}/v1/kv/{}?raw", self.address, key.trim_start_matches('/'));
        let mut request = self.client.get(&url);
        if let Some(index) = since {
            request = request.query(&[
                ("index", index.to_string()),
                ("wait", format!("{}s", self.wait.as_secs().max(1))),
            ]);
        }
        if let Some(token) = &self.token {
            request = request.header(TOKEN_HEADER, token);
        }

        let response = request
            .send()
            .await
            .map_err(|e| SourceError::Transport(e.to_string()))?;

        let status = response.status();
        let version = parse_index(response.headers())?;

        match status {
            StatusCode::OK => {
                let body = response
                    .bytes()
                    .await
                    .map_err(|e| SourceError::Transport(e.to_string()))?;
                Ok(KvEntry {
                    version,
                    value: Some(body.to_vec()),
                })
            }
            StatusCode::NOT_FOUND => Ok(KvEntry {
                version,
                value: None,
            }),
            other => Err(SourceError::Status(other.as_u16())),
        }
    }
}

/// Consul requires clients to treat an index below 1 as 1.
fn parse_index(headers: &reqwest::header::HeaderMap) -> Result<u64, SourceError> {
    let raw = headers
        .get(INDEX_HEADER)
        .ok_or_else(|| SourceError::Protocol("missing X-Consul-Index header".to_string()))?;
    let index = raw
        .to_str()
        .ok()
        .and_then(|s| s.trim().parse::<u64>().ok())
        .ok_or_else(|| SourceError::Protocol("unparsable X-Consul-Index header".to_string()))?;
    Ok(index.max(1))
}

#[async_trait]
impl ConfigSource for ConsulSource {
    #[instrument(skip(self), fields(address = %self.address))]
    async fn get(&self, key: &str) -> Result<KvEntry, SourceError> {
        self.fetch(key, None).await
    }

    #[instrument(skip(self), fields(address = %self.address))]
    async fn watch(&self, key: &str, since_version: u64) -> Result<KvEntry, SourceError> {
        let entry = self.fetch(key, Some(since_version)).await?;
        debug!(version = entry.version, present = entry.value.is_some(), "Consul watch returned");
        Ok(entry)
    }
}
