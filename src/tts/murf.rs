//! Streaming TTS over the Murf WebSocket
//!
//! One upstream socket is shared by every session in the process. Writes go
//! through the writer half behind a mutex; reads are serialized through the
//! reader half behind its own mutex, since concurrent `recv` on this socket
//! is not allowed. Contexts are tracked locally and cleared aggressively:
//! the upstream cap is small, so any tracked context is closed before a new
//! one is opened.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use serde_json::json;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, Mutex};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::GatewayError;

use super::fallback::MurfHttpTts;
use super::{ContextId, TtsAdapter, TtsEvent};

const MURF_WS_URL: &str = "wss://api.murf.ai/v1/speech/stream-input";

/// Receive window for one upstream frame while streaming audio.
const RECV_TIMEOUT: Duration = Duration::from_secs(30);

/// Wait for voice-config / context-clear acknowledgements.
const ACK_TIMEOUT: Duration = Duration::from_secs(3);

const EVENT_CHANNEL_SIZE: usize = 64;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type WsWriter = SplitSink<WsStream, Message>;
type WsReader = SplitStream<WsStream>;

enum RecvOutcome {
    Frame(serde_json::Value),
    Timeout,
    Closed,
}

struct MurfInner {
    api_key: String,
    voice_id: String,
    writer: Mutex<Option<WsWriter>>,
    reader: Mutex<Option<WsReader>>,
    active: std::sync::Mutex<HashSet<String>>,
    fallback: MurfHttpTts,
}

/// Streaming Murf adapter. Cheap to clone; all state is shared.
#[derive(Clone)]
pub struct MurfTts {
    inner: Arc<MurfInner>,
}

impl MurfTts {
    pub fn new(api_key: impl Into<String>, voice_id: impl Into<String>) -> Self {
        let api_key = api_key.into();
        let voice_id = voice_id.into();
        Self {
            inner: Arc::new(MurfInner {
                fallback: MurfHttpTts::new(api_key.clone(), voice_id.clone()),
                api_key,
                voice_id,
                writer: Mutex::new(None),
                reader: Mutex::new(None),
                active: std::sync::Mutex::new(HashSet::new()),
            }),
        }
    }

    pub fn voice_id(&self) -> &str {
        &self.inner.voice_id
    }
}

impl MurfInner {
    async fn connect(&self) -> Result<(), GatewayError> {
        let mut writer = self.writer.lock().await;
        let mut reader = self.reader.lock().await;
        if writer.is_some() && reader.is_some() {
            return Ok(());
        }

        let url = format!(
            "{MURF_WS_URL}?api-key={}&sample_rate=44100&channel_type=MONO&format=WAV",
            self.api_key
        );
        let (stream, _) = connect_async(url)
            .await
            .map_err(|e| GatewayError::Tts(format!("Failed to connect to TTS WebSocket: {e}")))?;
        info!("connected to TTS WebSocket");

        let (write_half, read_half) = stream.split();
        *writer = Some(write_half);
        *reader = Some(read_half);
        Ok(())
    }

    async fn drop_connection(&self) {
        *self.writer.lock().await = None;
        *self.reader.lock().await = None;
    }

    async fn send_json(&self, value: &serde_json::Value) -> Result<(), GatewayError> {
        let mut writer = self.writer.lock().await;
        let Some(sink) = writer.as_mut() else {
            return Err(GatewayError::Tts("TTS WebSocket not connected".into()));
        };
        if let Err(e) = sink.send(Message::text(value.to_string())).await {
            *writer = None;
            drop(writer);
            *self.reader.lock().await = None;
            return Err(GatewayError::Tts(format!("TTS send failed: {e}")));
        }
        Ok(())
    }

    /// Receive one JSON frame. The reader mutex is held for the duration of
    /// the call, which is what serializes concurrent receivers.
    async fn recv_frame(&self, timeout: Duration) -> RecvOutcome {
        let mut reader = self.reader.lock().await;
        let Some(source) = reader.as_mut() else {
            return RecvOutcome::Closed;
        };
        let deadline = Instant::now() + timeout;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return RecvOutcome::Timeout;
            }
            match tokio::time::timeout(remaining, source.next()).await {
                Err(_) => return RecvOutcome::Timeout,
                Ok(None) => {
                    *reader = None;
                    return RecvOutcome::Closed;
                }
                Ok(Some(Err(e))) => {
                    warn!("TTS WebSocket receive error: {e}");
                    *reader = None;
                    return RecvOutcome::Closed;
                }
                Ok(Some(Ok(Message::Text(text)))) => match serde_json::from_str(text.as_str()) {
                    Ok(value) => return RecvOutcome::Frame(value),
                    Err(_) => continue,
                },
                Ok(Some(Ok(Message::Close(_)))) => {
                    *reader = None;
                    return RecvOutcome::Closed;
                }
                // Pings and binary frames are not part of the protocol
                Ok(Some(Ok(_))) => continue,
            }
        }
    }

    fn track(&self, context_id: &str) {
        self.active.lock().unwrap().insert(context_id.to_string());
    }

    fn untrack(&self, context_id: &str) {
        self.active.lock().unwrap().remove(context_id);
    }

    fn tracked(&self) -> Vec<String> {
        self.active.lock().unwrap().iter().cloned().collect()
    }

    /// Best-effort clear of one context: send the clear frame, wait briefly
    /// for the ack, forget the id either way.
    async fn clear_context(&self, context_id: &str) {
        let clear_msg = json!({ "context_id": context_id, "clear": true });
        info!(context_id, "clearing TTS context");
        if self.send_json(&clear_msg).await.is_ok() {
            match self.recv_frame(ACK_TIMEOUT).await {
                RecvOutcome::Frame(data) => debug!(context_id, ?data, "context clear response"),
                RecvOutcome::Timeout => {
                    warn!(context_id, "timeout waiting for context clear acknowledgment");
                }
                RecvOutcome::Closed => warn!(context_id, "connection closed during context clear"),
            }
        }
        self.untrack(context_id);
    }
}

fn new_context_id() -> String {
    let hex = Uuid::new_v4().simple().to_string();
    format!("ctx_{}", &hex[..8])
}

#[async_trait]
impl TtsAdapter for MurfTts {
    async fn ensure_connected(&self) -> Result<(), GatewayError> {
        self.inner.connect().await
    }

    async fn active_contexts(&self) -> usize {
        self.inner.active.lock().unwrap().len()
    }

    async fn clear_all_contexts(&self) {
        let tracked = self.inner.tracked();
        if tracked.is_empty() {
            return;
        }
        info!(count = tracked.len(), "clearing all active TTS contexts");
        for context_id in tracked {
            self.inner.clear_context(&context_id).await;
        }
        self.inner.active.lock().unwrap().clear();
    }

    async fn open_context(&self) -> Result<ContextId, GatewayError> {
        self.ensure_connected().await?;

        // The upstream cap is tight; never hold more than one context open
        if !self.inner.tracked().is_empty() {
            self.clear_all_contexts().await;
        }

        let mut attempts = 0;
        loop {
            attempts += 1;
            let context_id = new_context_id();
            let voice_config = json!({
                "voice_config": {
                    "voiceId": self.inner.voice_id,
                    "style": "Conversational",
                    "rate": 0,
                    "pitch": 0,
                    "variation": 1,
                },
                "context_id": context_id,
            });
            info!(context_id, "sending voice config");
            self.inner.send_json(&voice_config).await?;

            match self.inner.recv_frame(ACK_TIMEOUT).await {
                RecvOutcome::Frame(data) => {
                    if let Some(error) = data.get("error").and_then(|e| e.as_str()) {
                        if error.contains("Exceeded Active context limit") {
                            warn!("context limit exceeded, clearing all contexts");
                            self.clear_all_contexts().await;
                            if attempts < 2 {
                                continue;
                            }
                            return Err(GatewayError::ContextLimitExceeded);
                        }
                        return Err(GatewayError::Tts(error.to_string()));
                    }
                    debug!(context_id, ?data, "voice config acknowledged");
                }
                RecvOutcome::Timeout => {
                    warn!(context_id, "voice config acknowledgment timeout, continuing anyway");
                }
                RecvOutcome::Closed => {
                    return Err(GatewayError::Tts(
                        "TTS connection closed during voice config".into(),
                    ));
                }
            }

            self.inner.track(&context_id);
            return Ok(context_id);
        }
    }

    async fn start_synthesis(
        &self,
        context: &str,
        text: &str,
    ) -> Result<mpsc::Receiver<TtsEvent>, GatewayError> {
        // `end: true` closes the context upstream as soon as the final
        // audio chunk has been emitted
        let text_msg = json!({
            "context_id": context,
            "text": text,
            "end": true,
        });
        info!(context, chars = text.len(), "sending text for synthesis");
        self.inner.send_json(&text_msg).await?;

        let (tx, rx) = mpsc::channel(EVENT_CHANNEL_SIZE);
        let inner = Arc::clone(&self.inner);
        let context = context.to_string();

        tokio::spawn(async move {
            let mut chunk_number: u32 = 0;
            let mut total_size: usize = 0;

            loop {
                match inner.recv_frame(RECV_TIMEOUT).await {
                    RecvOutcome::Frame(data) => {
                        if let Some(audio) = data.get("audio").and_then(|a| a.as_str()) {
                            chunk_number += 1;
                            total_size += audio.len();
                            let is_final =
                                data.get("final").and_then(|f| f.as_bool()).unwrap_or(false);
                            let event = TtsEvent::AudioChunk {
                                audio_base64: audio.to_string(),
                                chunk_number,
                                chunk_size: audio.len(),
                                total_size,
                                is_final,
                            };
                            if tx.send(event).await.is_err() {
                                break;
                            }
                            if is_final {
                                info!(
                                    context,
                                    chunks = chunk_number,
                                    total_size,
                                    "received final audio chunk"
                                );
                                inner.untrack(&context);
                                break;
                            }
                        } else if let Some(error) = data.get("error").and_then(|e| e.as_str()) {
                            let _ = tx.send(TtsEvent::Error(error.to_string())).await;
                            break;
                        } else if tx.send(TtsEvent::Status(data)).await.is_err() {
                            break;
                        }
                    }
                    RecvOutcome::Timeout => {
                        if tx.send(TtsEvent::Timeout).await.is_err() {
                            break;
                        }
                    }
                    RecvOutcome::Closed => {
                        let _ = tx
                            .send(TtsEvent::Error("TTS connection closed unexpectedly".into()))
                            .await;
                        inner.drop_connection().await;
                        break;
                    }
                }
            }
        });

        Ok(rx)
    }

    async fn close_context(&self, context: &str) {
        self.inner.clear_context(context).await;
    }

    async fn fallback_synthesize(&self, text: &str) -> Result<String, GatewayError> {
        self.inner.fallback.generate_speech(text, "MP3").await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_context_ids_are_fresh() {
        let a = new_context_id();
        let b = new_context_id();
        assert!(a.starts_with("ctx_"));
        assert_eq!(a.len(), "ctx_".len() + 8);
        assert_ne!(a, b);
    }

    #[tokio::test]
    async fn test_context_tracking() {
        let tts = MurfTts::new("key", "en-IN-aarav");
        tts.inner.track("ctx_aaaa");
        tts.inner.track("ctx_bbbb");
        assert_eq!(tts.active_contexts().await, 2);
        tts.inner.untrack("ctx_aaaa");
        assert_eq!(tts.active_contexts().await, 1);
    }

    #[tokio::test]
    async fn test_send_without_connection_errors() {
        let tts = MurfTts::new("key", "en-IN-aarav");
        let err = tts.inner.send_json(&json!({"x": 1})).await.unwrap_err();
        assert!(err.to_string().contains("not connected"));
    }
}
