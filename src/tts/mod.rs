//! Text-to-speech adapter
//!
//! The streaming backend is a stateful vendor WebSocket over which the
//! gateway opens ephemeral contexts; the upstream enforces a hard cap on
//! concurrent contexts, so every context must be closed on success, error,
//! cancellation, and teardown alike. A non-streaming HTTP path serves as
//! the single-shot fallback when streaming dies mid-response.

pub mod fallback;
pub mod murf;

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::error::GatewayError;

/// Upstream-allocated handle bracketing one synthesis request.
pub type ContextId = String;

/// Events produced while audio streams back for one context.
#[derive(Debug, Clone)]
pub enum TtsEvent {
    AudioChunk {
        audio_base64: String,
        chunk_number: u32,
        chunk_size: usize,
        total_size: usize,
        is_final: bool,
    },
    /// One receive window elapsed with no frame. The consumer decides how
    /// many of these to tolerate.
    Timeout,
    /// Non-audio upstream frame, forwarded for observability.
    Status(serde_json::Value),
    Error(String),
}

/// Streaming TTS interface.
#[async_trait]
pub trait TtsAdapter: Send + Sync {
    /// Connect (or reconnect) the shared upstream socket.
    async fn ensure_connected(&self) -> Result<(), GatewayError>;

    /// Number of contexts this adapter currently tracks as open.
    async fn active_contexts(&self) -> usize;

    /// Best-effort close of every tracked context.
    async fn clear_all_contexts(&self);

    /// Allocate a fresh context: clears tracked contexts if the budget is
    /// tight, sends the voice configuration, and waits briefly for the ack
    /// (non-fatal on timeout). Retries once with a new id if the upstream
    /// reports its context limit.
    async fn open_context(&self) -> Result<ContextId, GatewayError>;

    /// Send the full text with the end-of-input marker and start streaming
    /// audio events for the context.
    async fn start_synthesis(
        &self,
        context: &str,
        text: &str,
    ) -> Result<mpsc::Receiver<TtsEvent>, GatewayError>;

    /// Best-effort close of one context.
    async fn close_context(&self, context: &str);

    /// One-shot non-streaming synthesis; returns a URL to the rendered
    /// audio. Used at most once per utterance as the fallback path.
    async fn fallback_synthesize(&self, text: &str) -> Result<String, GatewayError>;
}
