//! Core data models shared by the ingress service, the correlator, and the
//! generation augmentor.
//!
//! [`SearchResult`] is the canonical topic message: both the publisher and
//! the correlator's reader agree on its JSON form
//! `{"search_id": "...", "content": "..."}`.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Opaque token linking one trigger call to its eventual [`SearchResult`].
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SearchIdentifier(String);

impl SearchIdentifier {
    /// Generate a fresh random identifier (UUID v4).
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    /// Wrap a caller-supplied identifier.
    ///
    /// Returns `None` for blank input.
    pub fn parse(raw: &str) -> Option<Self> {
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            None
        } else {
            Some(Self(trimmed.to_string()))
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SearchIdentifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// An inbound search trigger. Not persisted.
#[derive(Debug, Clone, Deserialize)]
pub struct SearchRequest {
    #[serde(rename = "q", default)]
    pub query: String,
    /// Pre-registered identifier supplied by a caller that already holds a
    /// correlation wait for it.
    #[serde(default)]
    pub search_id: Option<String>,
}

/// The single topic message produced per successful external fetch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SearchResult {
    pub search_id: SearchIdentifier,
    pub content: String,
}

impl SearchResult {
    pub fn to_payload(&self) -> serde_json::Result<Vec<u8>> {
        serde_json::to_vec(self)
    }

    pub fn from_payload(payload: &[u8]) -> serde_json::Result<Self> {
        serde_json::from_slice(payload)
    }
}

/// JSON body returned by `GET /search` on success.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TriggerResponse {
    pub status: String,
    pub message: String,
    pub search_id: SearchIdentifier,
}

/// A generation request. The augmentor only ever rewrites `prompt`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GenerateRequest {
    pub model: String,
    pub prompt: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub system: Option<String>,
}

/// One streamed piece of generation output.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GenerateChunk {
    #[serde(default)]
    pub response: String,
    #[serde(default)]
    pub done: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generated_identifiers_are_unique() {
        let a = SearchIdentifier::generate();
        let b = SearchIdentifier::generate();
        assert_ne!(a, b);
        assert_eq!(a.as_str().len(), 36);
    }

    #[test]
    fn test_parse_rejects_blank() {
        assert!(SearchIdentifier::parse("   ").is_none());
        assert_eq!(SearchIdentifier::parse(" abc ").unwrap().as_str(), "abc");
    }

    #[test]
    fn test_search_result_wire_format() {
        let result = SearchResult {
            search_id: SearchIdentifier::parse("id-1").unwrap(),
            content: "sunny".to_string(),
        };
        let payload = result.to_payload().unwrap();
        let value: serde_json::Value = serde_json::from_slice(&payload).unwrap();
        assert_eq!(value["search_id"], "id-1");
        assert_eq!(value["content"], "sunny");
    }

    #[test]
    fn test_raw_provider_bytes_are_not_a_result() {
        assert!(SearchResult::from_payload(b"<html>sunny</html>").is_err());
    }

    #[test]
    fn test_chunk_defaults_missing_fields() {
        let chunk: GenerateChunk = serde_json::from_str(r#"{"response":"hi"}"#).unwrap();
        assert_eq!(chunk.response, "hi");
        assert!(!chunk.done);
    }
}
