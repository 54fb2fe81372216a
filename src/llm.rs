//! Hosted inference and embedding service clients
//!
//! The orchestration core depends only on the request/response contract:
//! non-streaming responses expose a `generation` string, streaming responses
//! are framed events carrying the same shape, embedding responses expose a
//! numeric vector. Uses a long-lived reqwest::Client for connection pooling.

use crate::config::Settings;
use crate::error::OrchestrationError;
use crate::Result;
use async_trait::async_trait;
use reqwest::Client;
use serde::Serialize;
use serde_json::Value;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// Seam for answer generation. Implementations must be network-failure-safe
/// at their boundary; callers decide how to degrade.
#[async_trait]
pub trait LanguageModel: Send + Sync {
    async fn generate(&self, prompt: &str) -> Result<String>;

    /// Token-by-token variant. Pieces go to `tx` as they arrive; the full
    /// accumulated text is returned. Default falls back to the blocking call
    /// when the backend has no streaming support.
    async fn generate_stream(&self, prompt: &str, tx: mpsc::Sender<String>) -> Result<String> {
        let text = self.generate(prompt).await?;
        if !text.is_empty() {
            let _ = tx.send(text.clone()).await;
        }
        Ok(text)
    }
}

/// Seam for text embedding. Vectors are L2-normalized before return.
#[async_trait]
pub trait Embedder: Send + Sync {
    async fn embed(&self, text: &str) -> Result<Vec<f32>>;
}

//
// ================= Inference client =================
//

#[derive(Debug, Serialize)]
struct GenerateRequest<'a> {
    prompt: &'a str,
    max_gen_len: u32,
    temperature: f32,
    top_p: f32,
}

/// Reusable inference client (connection-pooled).
pub struct InferenceClient {
    client: Client,
    base_url: String,
    model_id: String,
    max_gen_len: u32,
}

impl InferenceClient {
    pub fn new(settings: &Settings) -> Self {
        let client = Client::builder()
            .pool_idle_timeout(Duration::from_secs(90))
            .pool_max_idle_per_host(8)
            .timeout(settings.stage_timeout)
            .build()
            .expect("Failed to build HTTP client");

        Self {
            client,
            base_url: settings.inference_endpoint.trim_end_matches('/').to_string(),
            model_id: settings.model_id.clone(),
            max_gen_len: settings.max_gen_len,
        }
    }

    fn request_body<'a>(&self, prompt: &'a str) -> GenerateRequest<'a> {
        GenerateRequest {
            prompt,
            max_gen_len: self.max_gen_len,
            temperature: 0.2,
            top_p: 0.95,
        }
    }

    fn invoke_url(&self) -> Result<String> {
        if self.base_url.is_empty() {
            return Err(OrchestrationError::Unconfigured(
                "INFERENCE_ENDPOINT not configured".to_string(),
            ));
        }
        Ok(format!("{}/model/{}/invoke", self.base_url, self.model_id))
    }
}

/// Extract plain text from an inference response body.
/// Contract: top-level `{"generation": "..."}`. Empty on anything else.
pub(crate) fn parse_generation(raw: &str) -> String {
    if raw.is_empty() {
        return String::new();
    }
    match serde_json::from_str::<Value>(raw) {
        Ok(Value::Object(map)) => match map.get("generation") {
            Some(Value::String(s)) => s.clone(),
            Some(Value::Null) | None => String::new(),
            Some(other) => other.to_string(),
        },
        _ => String::new(),
    }
}

/// Append a streaming piece to accumulated text. Inserts a space only at a
/// word boundary the stream split without one: previous char is not space or
/// attaching punctuation, and the new piece starts a word (uppercase).
/// Conservative so subwords and acronyms are never split.
pub(crate) fn join_stream_piece(acc: &mut String, piece: &str) {
    if piece.is_empty() {
        return;
    }
    if acc.is_empty() {
        acc.push_str(piece);
        return;
    }
    const ATTACH_PUNCT: &str = ".,!?;:)\"'";
    let last = acc.chars().last().unwrap();
    let first = piece.chars().next().unwrap();
    let need_space = !last.is_whitespace()
        && !ATTACH_PUNCT.contains(last)
        && !first.is_whitespace()
        && !ATTACH_PUNCT.contains(first)
        && first.is_uppercase();
    if need_space {
        acc.push(' ');
    }
    acc.push_str(piece);
}

#[async_trait]
impl LanguageModel for InferenceClient {
    async fn generate(&self, prompt: &str) -> Result<String> {
        let url = self.invoke_url()?;

        debug!(model_id = %self.model_id, "Calling inference service");

        let response = self
            .client
            .post(&url)
            .json(&self.request_body(prompt))
            .send()
            .await
            .map_err(|e| OrchestrationError::Unavailable(format!("inference request: {}", e)))?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            warn!(%status, "Inference service error response");
            return Err(OrchestrationError::Unavailable(format!(
                "inference service returned {}: {}",
                status, body
            )));
        }

        let raw = response
            .text()
            .await
            .map_err(|e| OrchestrationError::Unavailable(format!("inference body: {}", e)))?;

        Ok(parse_generation(&raw))
    }

    async fn generate_stream(&self, prompt: &str, tx: mpsc::Sender<String>) -> Result<String> {
        let url = match self.invoke_url() {
            Ok(u) => format!("{}-with-response-stream", u),
            Err(e) => return Err(e),
        };

        debug!(model_id = %self.model_id, "Calling inference service (stream)");

        let mut response = self
            .client
            .post(&url)
            .json(&self.request_body(prompt))
            .send()
            .await
            .map_err(|e| OrchestrationError::Unavailable(format!("inference request: {}", e)))?;

        if !response.status().is_success() {
            // Streaming endpoint missing or unhappy: fall back to blocking.
            return self.generate(prompt).await;
        }

        let mut final_text = String::new();
        let mut buf = Vec::new();

        // Frames are newline-delimited JSON events carrying the `generation`
        // contract. Malformed or empty frames are skipped, never fatal.
        loop {
            let chunk = match response.chunk().await {
                Ok(Some(bytes)) => bytes,
                Ok(None) => break,
                Err(e) => {
                    warn!(error = %e, "Stream read error, keeping partial text");
                    break;
                }
            };
            buf.extend_from_slice(&chunk);
            while let Some(pos) = buf.iter().position(|&b| b == b'\n') {
                let frame: Vec<u8> = buf.drain(..=pos).collect();
                let line = String::from_utf8_lossy(&frame);
                let piece = parse_generation(line.trim());
                if !piece.is_empty() {
                    join_stream_piece(&mut final_text, &piece);
                    let _ = tx.send(piece).await;
                }
            }
        }
        // Trailing frame without newline terminator.
        if !buf.is_empty() {
            let line = String::from_utf8_lossy(&buf);
            let piece = parse_generation(line.trim());
            if !piece.is_empty() {
                join_stream_piece(&mut final_text, &piece);
                let _ = tx.send(piece).await;
            }
        }

        Ok(final_text.trim().to_string())
    }
}

//
// ================= Embedding client =================
//

/// Reusable embedding client. Vectors are L2-normalized before return so dot
/// products downstream are cosine similarities.
pub struct EmbeddingClient {
    client: Client,
    base_url: String,
    model_id: String,
}

impl EmbeddingClient {
    pub fn new(settings: &Settings) -> Self {
        let client = Client::builder()
            .pool_idle_timeout(Duration::from_secs(90))
            .pool_max_idle_per_host(8)
            .timeout(settings.stage_timeout)
            .build()
            .expect("Failed to build HTTP client");

        Self {
            client,
            base_url: settings.inference_endpoint.trim_end_matches('/').to_string(),
            model_id: settings.embedding_model_id.clone(),
        }
    }
}

/// L2-normalize in place. A zero vector is left untouched.
pub fn l2_normalize(vec: &mut [f32]) {
    let norm: f32 = vec.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm > 0.0 {
        for x in vec.iter_mut() {
            *x /= norm;
        }
    }
}

/// Pull a numeric vector out of an embedding response. Prefers `embedding`,
/// then `vector`, then the first list-of-numbers value.
fn extract_vector(parsed: &Value) -> Option<Vec<f32>> {
    let as_floats = |v: &Value| -> Option<Vec<f32>> {
        let arr = v.as_array()?;
        if arr.is_empty() {
            return None;
        }
        arr.iter()
            .map(|x| x.as_f64().map(|f| f as f32))
            .collect::<Option<Vec<f32>>>()
    };

    let obj = parsed.as_object()?;
    for key in ["embedding", "vector"] {
        if let Some(v) = obj.get(key).and_then(|v| as_floats(v)) {
            return Some(v);
        }
    }
    obj.values().find_map(as_floats)
}

#[async_trait]
impl Embedder for EmbeddingClient {
    async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        if text.trim().is_empty() {
            return Err(OrchestrationError::ParseFailure(
                "empty text for embedding".to_string(),
            ));
        }
        if self.base_url.is_empty() {
            return Err(OrchestrationError::Unconfigured(
                "INFERENCE_ENDPOINT not configured".to_string(),
            ));
        }

        let url = format!("{}/model/{}/invoke", self.base_url, self.model_id);
        let response = self
            .client
            .post(&url)
            .json(&serde_json::json!({ "inputText": text }))
            .send()
            .await
            .map_err(|e| OrchestrationError::Unavailable(format!("embedding request: {}", e)))?;

        if !response.status().is_success() {
            return Err(OrchestrationError::Unavailable(format!(
                "embedding service returned {}",
                response.status()
            )));
        }

        let parsed: Value = response
            .json()
            .await
            .map_err(|e| OrchestrationError::ParseFailure(format!("embedding body: {}", e)))?;

        let mut vec = extract_vector(&parsed).ok_or_else(|| {
            OrchestrationError::ParseFailure("no numeric vector in embedding response".to_string())
        })?;
        l2_normalize(&mut vec);
        Ok(vec)
    }
}

//
// ================= Test doubles =================
//
