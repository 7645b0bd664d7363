//! Gemini streaming adapter
//!
//! Speaks the Generative Language API: SSE for streaming generation, plain
//! JSON for the one-shot completion used by key validation and the internal
//! stream-failure fallback.

use std::sync::Arc;

use async_trait::async_trait;
use futures_util::StreamExt;
use reqwest::Client;
use serde::Deserialize;
use serde_json::json;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::error::GatewayError;

use super::LlmAdapter;

const GEMINI_BASE_URL: &str = "https://generativelanguage.googleapis.com/v1beta";
const DEFAULT_MODEL: &str = "gemini-1.5-flash";

/// Channel depth for streamed chunks.
const CHUNK_CHANNEL_SIZE: usize = 32;

#[derive(Clone)]
pub struct GeminiClient {
    client: Arc<Client>,
    api_key: String,
    model: String,
}

impl GeminiClient {
    pub fn new(api_key: impl Into<String>) -> Self {
        Self {
            client: Arc::new(Client::new()),
            api_key: api_key.into(),
            model: DEFAULT_MODEL.to_string(),
        }
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = model.into();
        self
    }

    fn request_body(prompt: &str) -> serde_json::Value {
        json!({
            "contents": [{
                "role": "user",
                "parts": [{ "text": prompt }]
            }]
        })
    }

    fn map_api_error(status: u16, body: &str) -> GatewayError {
        if status == 429 || body.to_lowercase().contains("quota") {
            GatewayError::Llm("API quota exceeded. Please check your billing and rate limits.".into())
        } else if status == 403 || status == 401 {
            GatewayError::Llm("API authentication failed. Please check your API key.".into())
        } else if status == 404 {
            GatewayError::Llm("Model not found. Please check the model name.".into())
        } else {
            GatewayError::Llm(format!("LLM API error ({status}): {body}"))
        }
    }

    /// Drive the SSE stream, forwarding text fragments into `tx` with
    /// backpressure. Returns how much text was forwarded plus the error
    /// that ended the stream, if any. Stops early (without error) if the
    /// receiver goes away.
    async fn stream_raw(
        &self,
        prompt: &str,
        tx: &mpsc::Sender<Result<String, GatewayError>>,
    ) -> (String, Option<GatewayError>) {
        let url = format!(
            "{GEMINI_BASE_URL}/models/{}:streamGenerateContent?alt=sse&key={}",
            self.model, self.api_key
        );

        let response = match self
            .client
            .post(&url)
            .json(&Self::request_body(prompt))
            .send()
            .await
        {
            Ok(response) => response,
            Err(e) => {
                return (
                    String::new(),
                    Some(GatewayError::Llm(format!(
                        "Failed to send streaming request: {e}"
                    ))),
                );
            }
        };

        if !response.status().is_success() {
            let status = response.status().as_u16();
            let body = response.text().await.unwrap_or_default();
            return (String::new(), Some(Self::map_api_error(status, &body)));
        }

        let mut stream = response.bytes_stream();
        let mut buffer = String::new();
        let mut accumulated = String::new();

        while let Some(chunk) = stream.next().await {
            let chunk = match chunk {
                Ok(chunk) => chunk,
                Err(e) => {
                    return (
                        accumulated,
                        Some(GatewayError::Llm(format!("Failed to read stream chunk: {e}"))),
                    );
                }
            };
            buffer.push_str(&String::from_utf8_lossy(&chunk));

            while let Some(newline_pos) = buffer.find('\n') {
                let line = buffer[..newline_pos].trim().to_string();
                buffer.drain(..=newline_pos);

                let Some(data) = line.strip_prefix("data: ") else {
                    continue;
                };
                if data == "[DONE]" {
                    continue;
                }
                match serde_json::from_str::<GenerateResponse>(data) {
                    Ok(parsed) => {
                        for text in parsed.text_parts() {
                            accumulated.push_str(&text);
                            if tx.send(Ok(text)).await.is_err() {
                                // Receiver dropped (cancelled); stop reading
                                return (accumulated, None);
                            }
                        }
                    }
                    Err(e) => debug!("skipping unparsable SSE line: {e}"),
                }
            }
        }

        (accumulated, None)
    }
}

#[derive(Debug, Deserialize)]
struct GenerateResponse {
    #[serde(default)]
    candidates: Vec<Candidate>,
}

#[derive(Debug, Deserialize)]
struct Candidate {
    #[serde(default)]
    content: Option<CandidateContent>,
}

#[derive(Debug, Deserialize)]
struct CandidateContent {
    #[serde(default)]
    parts: Vec<Part>,
}

#[derive(Debug, Deserialize)]
struct Part {
    #[serde(default)]
    text: Option<String>,
}

impl GenerateResponse {
    fn text_parts(&self) -> Vec<String> {
        self.candidates
            .iter()
            .filter_map(|c| c.content.as_ref())
            .flat_map(|c| c.parts.iter())
            .filter_map(|p| p.text.clone())
            .filter(|t| !t.is_empty())
            .collect()
    }
}

#[async_trait]
impl LlmAdapter for GeminiClient {
    async fn stream_response(
        &self,
        prompt: &str,
    ) -> Result<mpsc::Receiver<Result<String, GatewayError>>, GatewayError> {
        let (tx, rx) = mpsc::channel(CHUNK_CHANNEL_SIZE);
        let this = self.clone();
        let prompt = prompt.to_string();

        tokio::spawn(async move {
            let (accumulated, stream_err) = this.stream_raw(&prompt, &tx).await;

            if !accumulated.trim().is_empty() {
                // Partial output after an error is the consumer's call;
                // resending the full text would duplicate what already
                // streamed, so only the error is surfaced
                match stream_err {
                    None => {
                        info!(chars = accumulated.len(), "LLM streaming response completed");
                    }
                    Some(e) => {
                        error!("LLM stream ended early after partial output: {e}");
                        let _ = tx.send(Err(e)).await;
                    }
                }
                return;
            }

            // Nothing streamed: retry once non-streaming before failing
            if let Some(ref e) = stream_err {
                error!("LLM streaming failed: {e}");
            } else {
                warn!("empty streaming response, falling back to non-streaming");
            }
            match this.complete(&prompt).await {
                Ok(text) => {
                    info!("non-streaming fallback succeeded");
                    let _ = tx.send(Ok(text)).await;
                }
                Err(fallback_err) => {
                    let _ = tx.send(Err(stream_err.unwrap_or(fallback_err))).await;
                }
            }
        });

        Ok(rx)
    }

    async fn complete(&self, prompt: &str) -> Result<String, GatewayError> {
        let url = format!(
            "{GEMINI_BASE_URL}/models/{}:generateContent?key={}",
            self.model, self.api_key
        );

        let response = self
            .client
            .post(&url)
            .json(&Self::request_body(prompt))
            .send()
            .await
            .map_err(|e| GatewayError::Llm(format!("Failed to send request: {e}")))?;

        if !response.status().is_success() {
            let status = response.status().as_u16();
            let body = response.text().await.unwrap_or_default();
            return Err(Self::map_api_error(status, &body));
        }

        let parsed: GenerateResponse = response
            .json()
            .await
            .map_err(|e| GatewayError::Llm(format!("Failed to parse response: {e}")))?;

        let text = parsed.text_parts().join("");
        if text.trim().is_empty() {
            return Err(GatewayError::Llm("Empty response text from LLM".into()));
        }
        Ok(text.trim().to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_text_parts_extraction() {
        let raw = r#"{
            "candidates": [{
                "content": { "parts": [{ "text": "Hello" }, { "text": " world" }] }
            }]
        }"#;
        let parsed: GenerateResponse = serde_json::from_str(raw).unwrap();
        assert_eq!(parsed.text_parts(), vec!["Hello", " world"]);
    }

    #[test]
    fn test_text_parts_tolerates_missing_fields() {
        let parsed: GenerateResponse = serde_json::from_str(r#"{"candidates":[{}]}"#).unwrap();
        assert!(parsed.text_parts().is_empty());
    }

    #[test]
    fn test_error_mapping() {
        let err = GeminiClient::map_api_error(429, "slow down");
        assert!(err.to_string().contains("quota"));
        let err = GeminiClient::map_api_error(403, "bad key");
        assert!(err.to_string().contains("authentication"));
        let err = GeminiClient::map_api_error(404, "gone");
        assert!(err.to_string().contains("Model not found"));
    }
}
