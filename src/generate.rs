//! Ollama-compatible streaming generation.
//!
//! Calls `POST {endpoint}/api/generate` with `stream: true`. The response is
//! newline-delimited JSON; each line is one `{"response": "...", "done": bool}`
//! record and is forwarded to the sink as soon as it is complete.

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, instrument};

use crate::augment::{ChunkSink, Generator};
use crate::config::GenerationConfig;
use crate::models::{GenerateChunk, GenerateRequest};

pub struct OllamaGenerator {
    client: reqwest::Client,
    endpoint: String,
}

impl OllamaGenerator {
    pub fn new(config: &GenerationConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;
        Ok(Self {
            client,
            endpoint: config.endpoint.trim_end_matches('/').to_string(),
        })
    }
}

#[derive(Serialize)]
struct OllamaRequest<'a> {
    model: &'a str,
    prompt: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    system: Option<&'a str>,
    stream: bool,
}

#[derive(Deserialize)]
struct OllamaLine {
    #[serde(default)]
    response: String,
    #[serde(default)]
    done: bool,
    #[serde(default)]
    error: Option<String>,
}

#[async_trait]
impl Generator for OllamaGenerator {
    #[instrument(skip_all, fields(model = %request.model))]
    async fn generate(
        &self,
        request: GenerateRequest,
        on_chunk: &mut ChunkSink<'_>,
    ) -> Result<()> {
        let body = OllamaRequest {
            model: &request.model,
            prompt: &request.prompt,
            system: request.system.as_deref(),
            stream: true,
        };

        let mut resp = self
            .client
            .post(format!("{}/api/generate", self.endpoint))
            .json(&body)
            .send()
            .await
            .context("Failed to reach generation endpoint")?;

        let status = resp.status();
        if !status.is_success() {
            let text = resp.text().await.unwrap_or_default();
            bail!("generation endpoint returned HTTP {}: {}", status.as_u16(), text);
        }

        let mut lines = LineDecoder::default();
        while let Some(bytes) = resp
            .chunk()
            .await
            .context("Failed to read generation stream")?
        {
            for line in lines.push(&bytes) {
                forward(&line, on_chunk)?;
            }
        }
        if let Some(line) = lines.finish() {
            forward(&line, on_chunk)?;
        }

        debug!("generation stream complete");
        Ok(())
    }
}

fn forward(line: &str, on_chunk: &mut ChunkSink<'_>) -> Result<()> {
    let parsed: OllamaLine = serde_json::from_str(line)
        .with_context(|| format!("Malformed generation record: {}", line))?;
    if let Some(error) = parsed.error {
        bail!("generation failed: {}", error);
    }
    on_chunk(GenerateChunk {
        response: parsed.response,
        done: parsed.done,
    })
}

/// Splits a byte stream into complete, non-empty lines.
#[derive(Default)]
struct LineDecoder {
    buffer: Vec<u8>,
}

impl LineDecoder {
    fn push(&mut self, bytes: &[u8]) -> Vec<String> {
        self.buffer.extend_from_slice(bytes);
        let mut lines = Vec::new();
        while let Some(pos) = self.buffer.iter().position(|b| *b == b'\n') {
            let line: Vec<u8> = self.buffer.drain(..=pos).collect();
            let text = String::from_utf8_lossy(&line).trim().to_string();
            if !text.is_empty() {
                lines.push(text);
            }
        }
        lines
    }

    fn finish(&mut self) -> Option<String> {
        let text = String::from_utf8_lossy(&self.buffer).trim().to_string();
        self.buffer.clear();
        if text.is_empty() {
            None
        } else {
            Some(text)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{routing::post, Json, Router};

    #[test]
    fn test_lines_split_across_chunks() {
        let mut decoder = LineDecoder::default();
        assert!(decoder.push(b"{\"response\":\"he").is_empty());
        let lines = decoder.push(b"llo\"}\n{\"response\":\"x\"}\n\n{\"done\"");
        assert_eq!(lines, vec!["{\"response\":\"hello\"}", "{\"response\":\"x\"}"]);
        assert_eq!(decoder.finish().as_deref(), Some("{\"done\""));
        assert!(decoder.finish().is_none());
    }

    #[test]
    fn test_multibyte_characters_survive_chunk_boundaries() {
        let mut decoder = LineDecoder::default();
        let text = "{\"response\":\"晴\"}\n".as_bytes();
        assert!(decoder.push(&text[..15]).is_empty());
        let lines = decoder.push(&text[15..]);
        assert_eq!(lines, vec!["{\"response\":\"晴\"}"]);
    }

    #[test]
    fn test_error_record_fails() {
        let mut sink = |_c: GenerateChunk| -> Result<()> { Ok(()) };
        let err = forward(r#"{"error":"model not found"}"#, &mut sink).unwrap_err();
        assert!(err.to_string().contains("model not found"));
    }

    #[tokio::test]
    async fn test_streams_chunks_in_order() {
        let app = Router::new().route(
            "/api/generate",
            post(|Json(body): Json<serde_json::Value>| async move {
                assert_eq!(body["stream"], true);
                let prompt = body["prompt"].as_str().unwrap_or_default().to_string();
                format!(
                    "{{\"response\":\"echo: \",\"done\":false}}\n{{\"response\":{},\"done\":false}}\n{{\"response\":\"\",\"done\":true}}\n",
                    serde_json::to_string(&prompt).unwrap()
                )
            }),
        );
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        let generator = OllamaGenerator::new(&GenerationConfig {
            endpoint: format!("http://{}/", addr),
            ..GenerationConfig::default()
        })
        .unwrap();

        let mut chunks = Vec::new();
        let mut sink = |c: GenerateChunk| -> Result<()> {
            chunks.push(c);
            Ok(())
        };
        generator
            .generate(
                GenerateRequest {
                    model: "llama3".to_string(),
                    prompt: "hi".to_string(),
                    system: None,
                },
                &mut sink,
            )
            .await
            .unwrap();

        let text: String = chunks.iter().map(|c| c.response.as_str()).collect();
        assert_eq!(text, "echo: hi");
        assert!(chunks.last().unwrap().done);
    }
}
