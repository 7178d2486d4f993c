//! Error taxonomy for the relay.
//!
//! Every failure a component can surface is one [`RelayError`] variant. The
//! HTTP layer maps variants to status codes via [`RelayError::code`] and
//! [`RelayError::status`]; the augmentor converts trigger failures into
//! fallback prompt text so transport errors never reach generation output.

use axum::http::StatusCode;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum RelayError {
    /// Bad input, user-correctable.
    #[error("invalid request: {0}")]
    Validation(String),

    /// External search provider failed, timed out, or returned an oversized body.
    #[error("upstream search failed: {0}")]
    UpstreamSearch(String),

    /// The broker rejected or failed to acknowledge a publish.
    #[error("broker publish failed: {0}")]
    BrokerPublish(String),

    /// No acknowledgment arrived within the publish timeout.
    #[error("broker publish timed out after {0:?}")]
    PublishTimeout(Duration),

    /// Outstanding publishes exceed the configured threshold.
    #[error("broker is saturated: {outstanding} publishes outstanding (threshold {threshold})")]
    BrokerCapacity { outstanding: usize, threshold: usize },

    /// The broker client has been closed and accepts no further work.
    #[error("broker client is closed")]
    BrokerClosed,

    /// No matching result arrived before the deadline.
    #[error("no search result arrived within {0:?}")]
    CorrelationTimeout(Duration),

    /// The caller or the process aborted the operation.
    #[error("operation canceled")]
    Canceled,

    /// Admission gate rejected the request.
    #[error("rate limit exceeded")]
    RateLimited,

    /// The underlying generation capability failed.
    #[error("generation failed: {0}")]
    Generation(String),

    /// Transport-level failure reading from the broker.
    #[error("broker read failed: {0}")]
    BrokerRead(String),
}

impl RelayError {
    /// Machine-readable error code used in HTTP error bodies.
    pub fn code(&self) -> &'static str {
        match self {
            RelayError::Validation(_) => "bad_request",
            RelayError::UpstreamSearch(_) => "upstream_search",
            RelayError::BrokerPublish(_)
            | RelayError::PublishTimeout(_)
            | RelayError::BrokerClosed => "broker_publish",
            RelayError::BrokerCapacity { .. } => "busy",
            RelayError::Canceled => "canceled",
            RelayError::RateLimited => "rate_limited",
            RelayError::CorrelationTimeout(_)
            | RelayError::Generation(_)
            | RelayError::BrokerRead(_) => "internal",
        }
    }

    pub fn status(&self) -> StatusCode {
        match self {
            RelayError::Validation(_) => StatusCode::BAD_REQUEST,
            RelayError::UpstreamSearch(_) => StatusCode::BAD_GATEWAY,
            RelayError::RateLimited => StatusCode::TOO_MANY_REQUESTS,
            RelayError::BrokerCapacity { .. } | RelayError::Canceled => {
                StatusCode::SERVICE_UNAVAILABLE
            }
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Whether this error came out of the publish path.
    #[cfg(test)]
    pub fn is_publish_failure(&self) -> bool {
        matches!(
            self,
            RelayError::BrokerPublish(_) | RelayError::PublishTimeout(_) | RelayError::BrokerClosed
        )
    }
}
