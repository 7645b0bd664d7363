//! Gateway error kinds
//!
//! Typed errors for the failure classes that must surface to the client as
//! distinct frames. Call sites that don't cross the client boundary use
//! `anyhow` directly; these kinds exist so the orchestrator can pick the
//! right frame and fallback sentence.

use std::time::Duration;
use thiserror::Error;

/// Errors the orchestrator and adapters can surface
#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("API keys missing for {0}")]
    ApiKeysMissing(&'static str),

    #[error("file error: {0}")]
    File(String),

    #[error("no speech detected")]
    NoSpeech,

    #[error("speech-to-text error: {0}")]
    Stt(String),

    #[error("language model error: {0}")]
    Llm(String),

    #[error("text-to-speech error: {0}")]
    Tts(String),

    #[error("exceeded active context limit")]
    ContextLimitExceeded,

    #[error("timed out after {0:?}")]
    Timeout(Duration),

    #[error("{0}")]
    General(String),
}

impl GatewayError {
    /// Stable kind tag for logs and status payloads
    pub fn kind(&self) -> &'static str {
        match self {
            GatewayError::ApiKeysMissing(_) => "api_keys_missing",
            GatewayError::File(_) => "file_error",
            GatewayError::NoSpeech => "no_speech",
            GatewayError::Stt(_) => "stt_error",
            GatewayError::Llm(_) => "llm_error",
            GatewayError::Tts(_) => "tts_error",
            GatewayError::ContextLimitExceeded => "context_limit_exceeded",
            GatewayError::Timeout(_) => "timeout",
            GatewayError::General(_) => "general_error",
        }
    }

    /// Human-readable sentence sent to the client when this error ends an
    /// utterance without audio.
    pub fn spoken_fallback(&self) -> &'static str {
        match self {
            GatewayError::ApiKeysMissing(_) => {
                "Please configure your API keys in settings before using the voice agent."
            }
            GatewayError::NoSpeech => "I didn't catch that. Could you say it again?",
            GatewayError::Stt(_) => "I had trouble hearing you. Please try again.",
            GatewayError::Llm(_) => {
                "I encountered an error while generating the response. Please try again."
            }
            GatewayError::Tts(_) | GatewayError::ContextLimitExceeded => {
                "I generated a response but couldn't speak it. Please try again."
            }
            GatewayError::Timeout(_) => "That took too long. Please try again.",
            GatewayError::File(_) | GatewayError::General(_) => {
                "Something went wrong. Please try again."
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_tags() {
        assert_eq!(GatewayError::Llm("x".into()).kind(), "llm_error");
        assert_eq!(GatewayError::ContextLimitExceeded.kind(), "context_limit_exceeded");
        assert_eq!(
            GatewayError::Timeout(Duration::from_secs(45)).kind(),
            "timeout"
        );
    }

    #[test]
    fn test_display_carries_detail() {
        let err = GatewayError::Tts("socket closed".into());
        assert!(err.to_string().contains("socket closed"));
    }
}
