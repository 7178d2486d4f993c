//! Search Trigger: run an external search and publish its result.
//!
//! [`SearchTrigger`] is the in-process implementation used by the ingress
//! handler. [`RemoteTrigger`] drives a remote ingress service over HTTP and
//! is what an augmentor running in another process uses.
//!
//! Both implement [`Trigger`], which takes a caller-chosen identifier. The
//! caller registers its correlation wait for that identifier *before*
//! dispatching, so the result can never reach the correlator's reader ahead
//! of its slot.

use anyhow::Result;
use async_trait::async_trait;
use axum::http::StatusCode;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, instrument, warn};

use crate::broker::BrokerClient;
use crate::error::RelayError;
use crate::models::{SearchIdentifier, SearchResult, TriggerResponse};
use crate::search::SearchProvider;

/// Starts a search whose result will be published under `id`.
#[async_trait]
pub trait Trigger: Send + Sync {
    async fn dispatch(&self, id: &SearchIdentifier, query: &str) -> Result<(), RelayError>;
}

/// Reject empty queries before any external call is made.
pub fn validate_query(query: &str) -> Result<&str, RelayError> {
    let trimmed = query.trim();
    if trimmed.is_empty() {
        return Err(RelayError::Validation(
            "query parameter q must not be empty".to_string(),
        ));
    }
    Ok(trimmed)
}

pub struct SearchTrigger {
    provider: Arc<dyn SearchProvider>,
    broker: Arc<BrokerClient>,
}

impl SearchTrigger {
    pub fn new(provider: Arc<dyn SearchProvider>, broker: Arc<BrokerClient>) -> Self {
        Self { provider, broker }
    }

    /// Search for `query` under a freshly generated identifier.
    pub async fn trigger(&self, query: &str) -> Result<SearchIdentifier, RelayError> {
        let id = SearchIdentifier::generate();
        self.trigger_with_id(&id, query).await?;
        Ok(id)
    }

    /// Search for `query` and publish the result under `id`.
    ///
    /// A single publish attempt is made at this layer; the broker client's
    /// own retries and timeout bound it.
    #[instrument(skip(self, query), fields(search_id = %id))]
    pub async fn trigger_with_id(
        &self,
        id: &SearchIdentifier,
        query: &str,
    ) -> Result<(), RelayError> {
        let query = validate_query(query)?;

        let content = self.provider.search(query).await.inspect_err(|e| {
            warn!(error = %e, "external search failed");
        })?;

        let result = SearchResult {
            search_id: id.clone(),
            content,
        };
        let payload = result
            .to_payload()
            .map_err(|e| RelayError::BrokerPublish(format!("failed to encode result: {}", e)))?;

        self.broker
            .publish(self.broker.topic(), &payload)
            .await
            .inspect_err(|e| warn!(error = %e, "failed to publish search result"))?;

        info!(bytes = payload.len(), "search result published");
        Ok(())
    }
}

#[async_trait]
impl Trigger for SearchTrigger {
    async fn dispatch(&self, id: &SearchIdentifier, query: &str) -> Result<(), RelayError> {
        self.trigger_with_id(id, query).await
    }
}

/// HTTP client for a remote ingress service's `GET /search`.
pub struct RemoteTrigger {
    client: reqwest::Client,
    url: String,
}

impl RemoteTrigger {
    pub fn new(url: &str, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            url: url.to_string(),
        })
    }
}

#[async_trait]
impl Trigger for RemoteTrigger {
    #[instrument(skip(self, query), fields(search_id = %id))]
    async fn dispatch(&self, id: &SearchIdentifier, query: &str) -> Result<(), RelayError> {
        let query = validate_query(query)?;

        let resp = self
            .client
            .get(&self.url)
            .query(&[("q", query), ("search_id", id.as_str())])
            .send()
            .await
            .map_err(|e| RelayError::UpstreamSearch(format!("ingress unreachable: {}", e)))?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(classify_remote_failure(status, body));
        }

        let ack: TriggerResponse = resp
            .json()
            .await
            .map_err(|e| RelayError::UpstreamSearch(format!("malformed ingress reply: {}", e)))?;
        if &ack.search_id != id {
            return Err(RelayError::UpstreamSearch(format!(
                "ingress acknowledged {} instead of {}",
                ack.search_id, id
            )));
        }
        Ok(())
    }
}

fn classify_remote_failure(status: StatusCode, body: String) -> RelayError {
    match status {
        StatusCode::BAD_REQUEST => RelayError::Validation(body),
        StatusCode::TOO_MANY_REQUESTS => RelayError::RateLimited,
        StatusCode::BAD_GATEWAY => RelayError::UpstreamSearch(body),
        _ => RelayError::BrokerPublish(format!(
            "ingress returned HTTP {}: {}",
            status.as_u16(),
            body
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::BrokerSettings;

    struct FixedProvider(&'static str);

    #[async_trait]
    impl SearchProvider for FixedProvider {
        async fn search(&self, _query: &str) -> Result<String, RelayError> {
            Ok(self.0.to_string())
        }
    }

    struct FailingProvider;

    #[async_trait]
    impl SearchProvider for FailingProvider {
        async fn search(&self, _query: &str) -> Result<String, RelayError> {
            Err(RelayError::UpstreamSearch("provider timed out".to_string()))
        }
    }

    fn broker() -> Arc<BrokerClient> {
        BrokerClient::in_memory(BrokerSettings {
            topic: "search_results".to_string(),
            publish_timeout: Duration::from_secs(1),
            max_retries: 0,
            retry_backoff: Duration::from_millis(1),
        })
    }

    #[test]
    fn test_validate_query() {
        assert!(matches!(validate_query("  "), Err(RelayError::Validation(_))));
        assert_eq!(validate_query(" weather ").unwrap(), "weather");
    }

    #[tokio::test]
    async fn test_trigger_publishes_structured_result() {
        let broker = broker();
        let trigger = SearchTrigger::new(Arc::new(FixedProvider("sunny")), broker.clone());

        let id = trigger.trigger("weather").await.unwrap();

        let payload = broker
            .next_message(Duration::from_millis(100))
            .await
            .unwrap()
            .unwrap();
        let result = SearchResult::from_payload(&payload).unwrap();
        assert_eq!(result.search_id, id);
        assert_eq!(result.content, "sunny");
    }

    #[tokio::test]
    async fn test_empty_query_makes_no_external_call() {
        let broker = broker();
        let trigger = SearchTrigger::new(Arc::new(FailingProvider), broker.clone());
        let err = trigger.trigger("").await.unwrap_err();
        assert!(matches!(err, RelayError::Validation(_)));
    }

    #[tokio::test]
    async fn test_provider_failure_publishes_nothing() {
        let broker = broker();
        let trigger = SearchTrigger::new(Arc::new(FailingProvider), broker.clone());
        let err = trigger.trigger("weather").await.unwrap_err();
        assert!(matches!(err, RelayError::UpstreamSearch(_)));
        assert!(broker
            .next_message(Duration::from_millis(20))
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn test_publish_failure_surfaces_once() {
        let broker = broker();
        broker.close(Duration::from_millis(1)).await.unwrap();
        let trigger = SearchTrigger::new(Arc::new(FixedProvider("sunny")), broker);
        let err = trigger.trigger("weather").await.unwrap_err();
        assert!(err.is_publish_failure());
    }

    #[test]
    fn test_classify_remote_failure() {
        assert!(matches!(
            classify_remote_failure(StatusCode::TOO_MANY_REQUESTS, String::new()),
            RelayError::RateLimited
        ));
        assert!(matches!(
            classify_remote_failure(StatusCode::INTERNAL_SERVER_ERROR, String::new()),
            RelayError::BrokerPublish(_)
        ));
    }
}
