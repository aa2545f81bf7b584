//! Byte fetches with bounded retries.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::info;

use crate::retry::{RetryPolicy, retry_async};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FetchError {
    #[error("request to {url} timed out after {timeout_ms} ms")]
    Timeout { url: String, timeout_ms: u64 },
    #[error("{url} answered with status {status}")]
    Status { url: String, status: u16 },
    #[error("request to {url} failed: {reason}")]
    Transport { url: String, reason: String },
    /// Every attempt failed.
    #[error("upstream fetch of {url} failed after {attempts} attempts: {last}")]
    Upstream {
        url: String,
        attempts: u32,
        last: String,
    },
}

/// A single fetch attempt.
#[async_trait]
pub trait FetchTransport: Send + Sync {
    async fn fetch(&self, url: &str) -> Result<Vec<u8>, FetchError>;
}

/// Plain HTTP GET.
#[derive(Debug, Clone)]
pub struct HttpTransport {
    client: reqwest::Client,
}

impl HttpTransport {
    pub fn new(client: reqwest::Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl FetchTransport for HttpTransport {
    async fn fetch(&self, url: &str) -> Result<Vec<u8>, FetchError> {
        let transport = |e: reqwest::Error| FetchError::Transport {
            url: url.to_string(),
            reason: e.to_string(),
        };

        let resp = self.client.get(url).send().await.map_err(transport)?;
        let status = resp.status();
        if !status.is_success() {
            return Err(FetchError::Status {
                url: url.to_string(),
                status: status.as_u16(),
            });
        }
        Ok(resp.bytes().await.map_err(transport)?.to_vec())
    }
}

/// Fetches through a transport under a [`RetryPolicy`], bounding every attempt
/// by `attempt_timeout`.
#[derive(Clone)]
pub struct RetryFetcher {
    transport: Arc<dyn FetchTransport>,
    policy: RetryPolicy,
    attempt_timeout: Duration,
}

impl RetryFetcher {
    pub fn new(transport: Arc<dyn FetchTransport>, policy: RetryPolicy, attempt_timeout: Duration) -> Self {
        Self {
            transport,
            policy,
            attempt_timeout,
        }
    }

    pub async fn fetch(&self, url: &str) -> Result<Vec<u8>, FetchError> {
        let result = retry_async(&self.policy, "fetch", |_attempt| async move {
            match tokio::time::timeout(self.attempt_timeout, self.transport.fetch(url)).await {
                Ok(result) => result,
                Err(_) => Err(FetchError::Timeout {
                    url: url.to_string(),
                    timeout_ms: self.attempt_timeout.as_millis() as u64,
                }),
            }
        })
        .await;

        match result {
            Ok(bytes) => {
                info!(url, size = bytes.len(), "fetched payload");
                Ok(bytes)
            }
            Err(exhausted) => Err(FetchError::Upstream {
                url: url.to_string(),
                attempts: exhausted.attempts,
                last: exhausted.last_error.to_string(),
            }),
        }
    }
}
