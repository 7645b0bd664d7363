//! Non-streaming TTS fallback
//!
//! One HTTP round-trip that renders the whole response and returns a URL to
//! the audio file. The fallback reuses the session's voice id but the
//! vendor's default style parameters; the streaming voice-config frame does
//! not apply here.

use reqwest::Client;
use serde::Deserialize;
use serde_json::json;
use tracing::info;

use crate::error::GatewayError;

const MURF_GENERATE_URL: &str = "https://api.murf.ai/v1/speech/generate";

#[derive(Clone)]
pub struct MurfHttpTts {
    client: Client,
    api_key: String,
    voice_id: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GenerateResponse {
    #[serde(default)]
    audio_file: Option<String>,
}

impl MurfHttpTts {
    pub fn new(api_key: impl Into<String>, voice_id: impl Into<String>) -> Self {
        Self {
            client: Client::new(),
            api_key: api_key.into(),
            voice_id: voice_id.into(),
        }
    }

    /// Render `text` as a single audio file and return its URL.
    pub async fn generate_speech(&self, text: &str, format: &str) -> Result<String, GatewayError> {
        info!(chars = text.len(), "generating fallback speech");

        let body = json!({
            "voiceId": self.voice_id,
            "text": text,
            "format": format,
        });

        let response = self
            .client
            .post(MURF_GENERATE_URL)
            .header("api-key", &self.api_key)
            .json(&body)
            .send()
            .await
            .map_err(|e| GatewayError::Tts(format!("Fallback TTS request failed: {e}")))?;

        if !response.status().is_success() {
            let status = response.status();
            let text = response.text().await.unwrap_or_default();
            return Err(GatewayError::Tts(format!(
                "Fallback TTS error ({status}): {text}"
            )));
        }

        let parsed: GenerateResponse = response
            .json()
            .await
            .map_err(|e| GatewayError::Tts(format!("Failed to parse fallback TTS response: {e}")))?;

        parsed
            .audio_file
            .filter(|url| !url.is_empty())
            .ok_or_else(|| GatewayError::Tts("Fallback TTS returned no audio URL".into()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_response_parsing() {
        let parsed: GenerateResponse =
            serde_json::from_str(r#"{"audioFile":"https://cdn.example/a.mp3"}"#).unwrap();
        assert_eq!(parsed.audio_file.as_deref(), Some("https://cdn.example/a.mp3"));

        let parsed: GenerateResponse = serde_json::from_str("{}").unwrap();
        assert!(parsed.audio_file.is_none());
    }
}
