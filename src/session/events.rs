//! Server-to-client frames
//!
//! Every frame is JSON with a `type` tag and a `timestamp`; type-specific
//! fields ride alongside. The enum is the single source of truth for the
//! wire names, so a typo'd event type cannot compile.

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::search::SearchResult;

/// One frame sent to the client over its WebSocket.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerEvent {
    AudioStreamReady {
        message: String,
        session_id: String,
        transcription_enabled: bool,
    },
    AudioChunkReceived {
        chunk_number: u64,
        total_bytes: u64,
    },
    CommandResponse {
        message: String,
        status: String,
    },
    PartialTranscript {
        text: String,
    },
    FinalTranscript {
        text: String,
    },
    QueryQueued {
        message: String,
        query: String,
        queue_position: usize,
        session_id: String,
    },
    WebSearchStart {
        message: String,
        query: String,
    },
    WebSearchComplete {
        message: String,
        results: Vec<SearchResult>,
    },
    WebSearchError {
        message: String,
    },
    LlmStreamingStart {
        message: String,
        user_message: String,
        web_search_enabled: bool,
    },
    LlmStreamingChunk {
        chunk: String,
        accumulated_length: usize,
    },
    ResponseSaved {
        message: String,
        response_length: usize,
    },
    LlmStreamingComplete {
        message: String,
        complete_response: String,
        total_length: usize,
        audio_chunks_received: u32,
        total_audio_size: usize,
        session_id: String,
        response_id: String,
        session_ready: bool,
    },
    LlmStreamingError {
        message: String,
    },
    TtsStreamingStart {
        message: String,
    },
    TtsAudioChunk {
        audio_base64: String,
        chunk_number: u32,
        chunk_size: usize,
        total_size: usize,
        is_final: bool,
    },
    TtsStatus {
        data: serde_json::Value,
    },
    TtsTimeoutWarning {
        timeout_count: u32,
        max_timeouts: u32,
    },
    TtsStreamingTimeout {
        message: String,
    },
    TtsFallbackAudio {
        audio_url: String,
        message: String,
        response_id: String,
    },
    TtsStreamingError {
        message: String,
    },
    AudioStop {
        message: String,
        session_id: String,
    },
    SessionReset {
        message: String,
        session_id: String,
    },
    ApiKeysRequired {
        message: String,
        transcript: String,
    },
    ApiKeysUpdated {
        success: bool,
        message: String,
        streaming_ready: bool,
    },
    PersonaUpdated {
        persona: String,
        message: String,
    },
    WebSearchUpdated {
        enabled: bool,
        message: String,
    },
    WebSearchToggled {
        enabled: bool,
        message: String,
    },
}

/// Wire envelope: the event's own fields flattened next to a timestamp.
#[derive(Debug, Serialize)]
struct Envelope<'a> {
    #[serde(flatten)]
    event: &'a ServerEvent,
    timestamp: DateTime<Utc>,
}

impl ServerEvent {
    /// Serialize with the send-time timestamp attached.
    pub fn to_frame(&self) -> String {
        let envelope = Envelope {
            event: self,
            timestamp: Utc::now(),
        };
        serde_json::to_string(&envelope).unwrap_or_else(|_| {
            // Serialization of these enums cannot fail in practice; keep a
            // well-formed frame either way.
            r#"{"type":"general_error","message":"event serialization failed"}"#.to_string()
        })
    }
}
