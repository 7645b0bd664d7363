//! Client audio WebSocket
//!
//! One socket per browser client: binary frames are raw microphone audio
//! relayed into the STT stream, text frames are JSON control messages (or
//! the plain `start_streaming` / `stop_streaming` commands bracketing the
//! audio). Outbound frames go through a dedicated sender task so any part
//! of the pipeline can reach the client via the connection manager.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Query, State};
use axum::response::Response;
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::keys::ApiKeys;
use crate::session::events::ServerEvent;
use crate::stt::{SttSession, TranscriptDeduper};

use super::ServerState;

/// Outbound queue depth per client.
const OUTBOUND_CHANNEL_SIZE: usize = 64;

/// Every Nth binary chunk gets an acknowledgement frame.
const CHUNK_ACK_INTERVAL: u64 = 10;

#[derive(Debug, Deserialize)]
#[serde(tag = "type")]
enum ClientMessage {
    #[serde(rename = "session_id")]
    SessionBind {
        session_id: Option<String>,
        persona: Option<String>,
        web_search_enabled: Option<bool>,
    },
    #[serde(rename = "persona_update")]
    PersonaUpdate { persona: String },
    #[serde(rename = "web_search_update")]
    WebSearchUpdate {
        #[serde(alias = "web_search_enabled")]
        enabled: bool,
    },
    #[serde(rename = "web_search_toggle")]
    WebSearchToggle { enabled: bool },
    #[serde(rename = "api_keys_update")]
    ApiKeysUpdate { api_keys: ApiKeys },
}

/// The live STT stream plus the task forwarding its transcripts.
struct SttLink {
    session: SttSession,
    forward_task: JoinHandle<()>,
}

impl SttLink {
    fn shutdown(self) {
        self.session.stop();
        self.forward_task.abort();
    }
}

pub async fn ws_handler(
    ws: WebSocketUpgrade,
    Query(params): Query<HashMap<String, String>>,
    State(state): State<ServerState>,
) -> Response {
    ws.on_upgrade(move |socket| handle_audio_stream(socket, state, params))
}

async fn handle_audio_stream(
    socket: WebSocket,
    state: ServerState,
    params: HashMap<String, String>,
) {
    let connection_id = Uuid::new_v4().to_string();
    let initial_session = params
        .get("session_id")
        .cloned()
        .unwrap_or_else(|| Uuid::new_v4().to_string());
    // Shared with the STT forward task; rebind control messages swap it
    let current_session = Arc::new(Mutex::new(initial_session.clone()));

    let (mut ws_tx, mut ws_rx) = socket.split();
    let (outbound_tx, mut outbound_rx) = mpsc::channel::<String>(OUTBOUND_CHANNEL_SIZE);

    let sender_task = tokio::spawn(async move {
        while let Some(frame) = outbound_rx.recv().await {
            if ws_tx.send(Message::Text(frame.into())).await.is_err() {
                break;
            }
        }
    });

    state.connections.register(&connection_id, outbound_tx);
    state
        .orchestrator
        .bind_session(&initial_session, &connection_id, None, None);

    // Raw audio is teed to a temp file for the cleanup endpoint to reap
    let audio_path = temp_audio_path(&initial_session);
    let mut audio_file = tokio::fs::File::create(&audio_path).await.ok();

    let mut stt = start_stt(&state, &connection_id, &current_session).await;

    state
        .connections
        .send_event(
            &connection_id,
            &ServerEvent::AudioStreamReady {
                message: "Audio streaming endpoint ready. Send binary audio data.".into(),
                session_id: initial_session.clone(),
                transcription_enabled: stt.is_some(),
            },
        )
        .await;

    let mut chunk_count: u64 = 0;
    let mut total_bytes: u64 = 0;

    while let Some(Ok(message)) = ws_rx.next().await {
        match message {
            Message::Binary(data) => {
                chunk_count += 1;
                total_bytes += data.len() as u64;
                if let Some(file) = audio_file.as_mut() {
                    if let Err(e) = file.write_all(&data).await {
                        warn!("failed to write audio to temp file: {e}");
                        audio_file = None;
                    }
                }
                if let Some(link) = &stt {
                    link.session.send_audio(data.to_vec()).await;
                }
                if chunk_count % CHUNK_ACK_INTERVAL == 0 {
                    state
                        .connections
                        .send_event(
                            &connection_id,
                            &ServerEvent::AudioChunkReceived {
                                chunk_number: chunk_count,
                                total_bytes,
                            },
                        )
                        .await;
                }
            }
            Message::Text(text) => {
                match serde_json::from_str::<ClientMessage>(&text) {
                    Ok(control) => {
                        handle_control(&state, &connection_id, &current_session, &mut stt, control)
                            .await;
                    }
                    Err(_) => {
                        // Plain-text commands bracketing the audio stream
                        match text.as_str() {
                            "start_streaming" => {
                                state
                                    .connections
                                    .send_event(
                                        &connection_id,
                                        &ServerEvent::CommandResponse {
                                            message:
                                                "Ready to receive audio chunks with real-time transcription"
                                                    .into(),
                                            status: "streaming_ready".into(),
                                        },
                                    )
                                    .await;
                            }
                            "stop_streaming" => {
                                state
                                    .connections
                                    .send_event(
                                        &connection_id,
                                        &ServerEvent::CommandResponse {
                                            message: "Stopping audio stream".into(),
                                            status: "streaming_stopped".into(),
                                        },
                                    )
                                    .await;
                                break;
                            }
                            other => debug!(command = other, "unrecognized text frame"),
                        }
                    }
                }
            }
            Message::Close(_) => {
                info!(connection = %connection_id, "client closed WebSocket");
                break;
            }
            _ => {}
        }
    }

    // Teardown. The connection leaves the live set first so that any
    // in-flight cancellation's audio_stop becomes a no-op (the socket is
    // gone, there is nobody to stop).
    state.connections.remove(&connection_id);
    let session_id = current_session.lock().unwrap().clone();
    state.orchestrator.on_disconnect(&session_id).await;
    if let Some(link) = stt.take() {
        link.shutdown();
    }
    sender_task.abort();
    if let Err(e) = tokio::fs::remove_file(&audio_path).await {
        debug!("temp audio cleanup failed: {e}");
    }
}

async fn handle_control(
    state: &ServerState,
    connection_id: &str,
    current_session: &Arc<Mutex<String>>,
    stt: &mut Option<SttLink>,
    control: ClientMessage,
) {
    let session_id = current_session.lock().unwrap().clone();
    match control {
        ClientMessage::SessionBind {
            session_id: new_session,
            persona,
            web_search_enabled,
        } => {
            let mut bound = session_id.clone();
            if let Some(new_session) = new_session {
                if new_session != session_id {
                    state
                        .orchestrator
                        .rebind_session(&session_id, &new_session, connection_id)
                        .await;
                    *current_session.lock().unwrap() = new_session.clone();
                    bound = new_session;
                }
            }
            if let Some(persona) = persona {
                state.orchestrator.set_persona(&bound, &persona);
            }
            if let Some(enabled) = web_search_enabled {
                state.orchestrator.set_web_search(&bound, enabled);
            }
        }
        ClientMessage::PersonaUpdate { persona } => {
            state.orchestrator.set_persona(&session_id, &persona);
            state
                .connections
                .send_event(
                    connection_id,
                    &ServerEvent::PersonaUpdated {
                        message: format!("Persona updated to {persona}"),
                        persona,
                    },
                )
                .await;
        }
        ClientMessage::WebSearchUpdate { enabled } => {
            state.orchestrator.set_web_search(&session_id, enabled);
            state
                .connections
                .send_event(
                    connection_id,
                    &ServerEvent::WebSearchUpdated {
                        enabled,
                        message: format!(
                            "Web search {}",
                            if enabled { "enabled" } else { "disabled" }
                        ),
                    },
                )
                .await;
        }
        ClientMessage::WebSearchToggle { enabled } => {
            state.orchestrator.set_web_search(&session_id, enabled);
            state
                .connections
                .send_event(
                    connection_id,
                    &ServerEvent::WebSearchToggled {
                        enabled,
                        message: format!(
                            "Web search {}",
                            if enabled { "enabled" } else { "disabled" }
                        ),
                    },
                )
                .await;
        }
        ClientMessage::ApiKeysUpdate { api_keys } => {
            // Safer re-provisioning order: cancel in-flight work and drain
            // queues, swap adapters, then restart the transcription stream
            let success = state.provision_keys(&api_keys).await;
            if let Some(link) = stt.take() {
                link.shutdown();
            }
            if success {
                *stt = start_stt(state, connection_id, current_session).await;
            }
            let streaming_ready = stt.is_some();
            info!(success, streaming_ready, "API keys updated");
            state
                .connections
                .send_event(
                    connection_id,
                    &ServerEvent::ApiKeysUpdated {
                        success,
                        message: if success {
                            "API keys updated successfully".into()
                        } else {
                            "Failed to update API keys".into()
                        },
                        streaming_ready,
                    },
                )
                .await;
        }
    }
}

/// Open the transcription stream and spawn the task that forwards its
/// transcripts: partials straight to the client, finals through the
/// advisory near-duplicate filter into the orchestrator.
async fn start_stt(
    state: &ServerState,
    connection_id: &str,
    current_session: &Arc<Mutex<String>>,
) -> Option<SttLink> {
    let adapter = state.adapters.read().await.stt.clone()?;
    match adapter.start_stream().await {
        Ok((session, mut events)) => {
            let connections = Arc::clone(&state.connections);
            let orchestrator = Arc::clone(&state.orchestrator);
            let connection_id = connection_id.to_string();
            let current_session = Arc::clone(current_session);

            let forward_task = tokio::spawn(async move {
                let mut deduper = TranscriptDeduper::default();
                while let Some(event) = events.recv().await {
                    if event.is_final {
                        connections
                            .send_event(
                                &connection_id,
                                &ServerEvent::FinalTranscript {
                                    text: event.text.clone(),
                                },
                            )
                            .await;
                        if deduper.should_forward(&event.text) {
                            let session_id = current_session.lock().unwrap().clone();
                            orchestrator.on_final_transcript(&session_id, &event.text).await;
                        }
                    } else {
                        connections
                            .send_event(
                                &connection_id,
                                &ServerEvent::PartialTranscript { text: event.text },
                            )
                            .await;
                    }
                }
            });

            Some(SttLink {
                session,
                forward_task,
            })
        }
        Err(e) => {
            error!("failed to start transcription stream: {e}");
            None
        }
    }
}

pub fn temp_audio_path(session_id: &str) -> PathBuf {
    std::env::temp_dir().join(format!("voxgate_{session_id}.wav"))
}
