//! External search capability.
//!
//! The provider is opaque to the rest of the relay: it takes a query and
//! returns content as text. [`HttpSearchProvider`] issues a `GET` against a
//! configured endpoint with the query in a configurable parameter, enforces
//! a fixed timeout, and refuses bodies larger than `max_body_bytes`.
//!
//! Every failure surfaces as [`RelayError::UpstreamSearch`] so callers can
//! fall back instead of crashing.

use anyhow::Result;
use async_trait::async_trait;
use std::time::Duration;
use tracing::debug;

use crate::config::SearchConfig;
use crate::error::RelayError;

/// A search backend queried by the ingress service.
#[async_trait]
pub trait SearchProvider: Send + Sync {
    async fn search(&self, query: &str) -> Result<String, RelayError>;
}

pub struct HttpSearchProvider {
    client: reqwest::Client,
    endpoint: String,
    query_param: String,
    max_body_bytes: usize,
}

impl HttpSearchProvider {
    pub fn new(config: &SearchConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;

        Ok(Self {
            client,
            endpoint: config.endpoint.clone(),
            query_param: config.query_param.clone(),
            max_body_bytes: config.max_body_bytes,
        })
    }
}

#[async_trait]
impl SearchProvider for HttpSearchProvider {
    async fn search(&self, query: &str) -> Result<String, RelayError> {
        let mut resp = self
            .client
            .get(&self.endpoint)
            .query(&[(self.query_param.as_str(), query)])
            .send()
            .await
            .map_err(describe)?;

        let status = resp.status();
        if !status.is_success() {
            return Err(RelayError::UpstreamSearch(format!(
                "provider returned HTTP {}",
                status.as_u16()
            )));
        }

        if let Some(len) = resp.content_length() {
            if len > self.max_body_bytes as u64 {
                return Err(oversized(self.max_body_bytes));
            }
        }

        let mut body = Vec::new();
        while let Some(chunk) = resp.chunk().await.map_err(describe)? {
            if body.len() + chunk.len() > self.max_body_bytes {
                return Err(oversized(self.max_body_bytes));
            }
            body.extend_from_slice(&chunk);
        }

        debug!(bytes = body.len(), "provider response read");
        Ok(String::from_utf8_lossy(&body).into_owned())
    }
}

fn describe(err: reqwest::Error) -> RelayError {
    if err.is_timeout() {
        RelayError::UpstreamSearch("provider timed out".to_string())
    } else {
        RelayError::UpstreamSearch(err.to_string())
    }
}

fn oversized(limit: usize) -> RelayError {
    RelayError::UpstreamSearch(format!("provider response exceeds {} bytes", limit))
}
