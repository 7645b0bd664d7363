//! AssemblyAI streaming transcription adapter
//!
//! Client audio bytes are relayed to the vendor socket verbatim; turn
//! frames come back as partial transcripts until `end_of_turn` marks the
//! final one.

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use serde_json::json;
use tokio::sync::mpsc;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, warn};

use crate::error::GatewayError;

use super::{SttAdapter, SttSession, TranscriptEvent};

const ASSEMBLYAI_WS_URL: &str = "wss://streaming.assemblyai.com/v3/ws";
const DEFAULT_SAMPLE_RATE: u32 = 16_000;

const AUDIO_CHANNEL_SIZE: usize = 64;
const EVENT_CHANNEL_SIZE: usize = 32;

pub struct AssemblyAiStt {
    api_key: String,
    sample_rate: u32,
}

impl AssemblyAiStt {
    pub fn new(api_key: impl Into<String>) -> Self {
        Self {
            api_key: api_key.into(),
            sample_rate: DEFAULT_SAMPLE_RATE,
        }
    }

    pub fn with_sample_rate(mut self, sample_rate: u32) -> Self {
        self.sample_rate = sample_rate;
        self
    }
}

#[async_trait]
impl SttAdapter for AssemblyAiStt {
    async fn start_stream(
        &self,
    ) -> Result<(SttSession, mpsc::Receiver<TranscriptEvent>), GatewayError> {
        let url = format!(
            "{ASSEMBLYAI_WS_URL}?sample_rate={}&format_turns=true",
            self.sample_rate
        );
        let mut request = url
            .into_client_request()
            .map_err(|e| GatewayError::Stt(format!("Invalid STT URL: {e}")))?;
        let auth = self
            .api_key
            .parse()
            .map_err(|_| GatewayError::Stt("Invalid STT API key".into()))?;
        request.headers_mut().insert("Authorization", auth);

        let (stream, _) = connect_async(request)
            .await
            .map_err(|e| GatewayError::Stt(format!("Failed to connect to STT WebSocket: {e}")))?;
        info!("connected to STT WebSocket");

        let (mut writer, mut reader) = stream.split();
        let (audio_tx, mut audio_rx) = mpsc::channel::<Vec<u8>>(AUDIO_CHANNEL_SIZE);
        let (event_tx, event_rx) = mpsc::channel::<TranscriptEvent>(EVENT_CHANNEL_SIZE);

        let task = tokio::spawn(async move {
            loop {
                tokio::select! {
                    chunk = audio_rx.recv() => {
                        match chunk {
                            Some(bytes) => {
                                if let Err(e) = writer.send(Message::binary(bytes)).await {
                                    warn!("STT audio send failed: {e}");
                                    break;
                                }
                            }
                            None => {
                                // Caller is done streaming; ask the vendor
                                // to flush and terminate the turn
                                let terminate = json!({ "type": "Terminate" });
                                let _ = writer.send(Message::text(terminate.to_string())).await;
                                break;
                            }
                        }
                    }
                    frame = reader.next() => {
                        match frame {
                            Some(Ok(Message::Text(text))) => {
                                let Ok(value) = serde_json::from_str::<serde_json::Value>(text.as_str()) else {
                                    continue;
                                };
                                match value.get("type").and_then(|t| t.as_str()) {
                                    Some("Turn") => {
                                        let transcript = value
                                            .get("transcript")
                                            .and_then(|t| t.as_str())
                                            .unwrap_or_default();
                                        if transcript.trim().is_empty() {
                                            continue;
                                        }
                                        let is_final = value
                                            .get("end_of_turn")
                                            .and_then(|e| e.as_bool())
                                            .unwrap_or(false);
                                        let event = TranscriptEvent {
                                            text: transcript.to_string(),
                                            is_final,
                                        };
                                        if event_tx.send(event).await.is_err() {
                                            break;
                                        }
                                    }
                                    Some("Begin") => debug!("STT stream began"),
                                    Some("Termination") => {
                                        info!("STT stream terminated by vendor");
                                        break;
                                    }
                                    other => debug!(?other, "ignoring STT frame"),
                                }
                            }
                            Some(Ok(Message::Close(_))) | None => {
                                info!("STT WebSocket closed");
                                break;
                            }
                            Some(Ok(_)) => {}
                            Some(Err(e)) => {
                                warn!("STT WebSocket error: {e}");
                                break;
                            }
                        }
                    }
                }
            }
        });

        Ok((SttSession::new(audio_tx, task), event_rx))
    }
}
