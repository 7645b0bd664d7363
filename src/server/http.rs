//! HTTP surface
//!
//! Everything next to the WebSocket: pages, health, history, key
//! validation, and the debug endpoints. All handlers are thin wrappers over
//! the shared state; the pipeline itself never depends on them.

use axum::extract::{Path, Query, State};
use axum::response::Html;
use axum::Json;
use serde::Deserialize;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::time::{Duration, SystemTime};
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::keys::ApiKeys;
use crate::llm::gemini::GeminiClient;
use crate::llm::LlmAdapter;
use crate::tts::TtsEvent;

use super::ServerState;

/// Temp audio files older than this are reaped by the cleanup endpoint.
const TEMP_AUDIO_MAX_AGE: Duration = Duration::from_secs(3600);

pub async fn home() -> Html<&'static str> {
    Html(
        r#"<!DOCTYPE html>
<html>
<head>
    <title>VoxGate</title>
    <meta charset="utf-8">
</head>
<body>
    <h1>VoxGate - Voice Agent Gateway</h1>
    <p>Open <a href="/chat">/chat</a> to start a voice session.</p>
    <p>WebSocket endpoint: <code>/ws/audio</code></p>
</body>
</html>"#,
    )
}

pub async fn chat_page(Query(params): Query<HashMap<String, String>>) -> Html<String> {
    let session_id = params
        .get("session_id")
        .cloned()
        .unwrap_or_else(|| Uuid::new_v4().to_string());
    Html(format!(
        r#"<!DOCTYPE html>
<html>
<head>
    <title>VoxGate Chat</title>
    <meta charset="utf-8">
</head>
<body data-session-id="{session_id}">
    <h1>VoxGate Session</h1>
    <p>Session: <code>{session_id}</code></p>
    <p>Connect your client to <code>/ws/audio?session_id={session_id}</code></p>
</body>
</html>"#
    ))
}

pub async fn backend_status(State(state): State<ServerState>) -> Json<Value> {
    let adapters = state.adapters.read().await;
    Json(json!({
        "status": "healthy",
        "services": {
            "llm": adapters.llm.is_some(),
            "stt": adapters.stt.is_some(),
            "tts": adapters.tts.is_some(),
            "web_search": adapters.search.is_some(),
            "database": true,
        },
        "timestamp": chrono::Utc::now().to_rfc3339(),
    }))
}

pub async fn list_sessions(State(state): State<ServerState>) -> Json<Value> {
    match state.history.sessions().await {
        Ok(sessions) => Json(json!({
            "success": true,
            "total_count": sessions.len(),
            "sessions": sessions,
        })),
        Err(e) => {
            error!("failed to list sessions: {e}");
            Json(json!({
                "success": false,
                "sessions": [],
                "total_count": 0,
                "error": e.to_string(),
            }))
        }
    }
}

pub async fn get_history(
    State(state): State<ServerState>,
    Path(session_id): Path<String>,
) -> Json<Value> {
    match state.history.history(&session_id).await {
        Ok(messages) => Json(json!({
            "success": true,
            "session_id": session_id,
            "message_count": messages.len(),
            "messages": messages,
        })),
        Err(e) => {
            error!("failed to load history for {session_id}: {e}");
            Json(json!({
                "success": false,
                "session_id": session_id,
                "messages": [],
                "message_count": 0,
            }))
        }
    }
}

pub async fn delete_history(
    State(state): State<ServerState>,
    Path(session_id): Path<String>,
) -> Json<Value> {
    match state.history.clear(&session_id).await {
        Ok(true) => {
            info!(session_id, "chat history cleared");
            Json(json!({
                "success": true,
                "message": format!("Chat history cleared for session {session_id}"),
            }))
        }
        Ok(false) => Json(json!({
            "success": false,
            "message": format!("No chat history for session {session_id}"),
        })),
        Err(e) => {
            error!("failed to clear history for {session_id}: {e}");
            Json(json!({ "success": false, "message": e.to_string() }))
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct WebSearchRequest {
    #[serde(default)]
    query: String,
}

pub async fn web_search(
    State(state): State<ServerState>,
    Json(request): Json<WebSearchRequest>,
) -> Json<Value> {
    let query = request.query.trim().to_string();
    if query.is_empty() {
        return Json(json!({
            "success": false,
            "query": query,
            "results": [],
            "error_message": "Search query cannot be empty",
        }));
    }

    let Some(search) = state.adapters.read().await.search.clone() else {
        return Json(json!({
            "success": false,
            "query": query,
            "results": [],
            "error_message": "Web search service is not available. Please check the search API key.",
        }));
    };

    match search.search(&query, 3).await {
        Ok(results) => Json(json!({
            "success": true,
            "query": query,
            "results": results,
        })),
        Err(e) => Json(json!({
            "success": false,
            "query": query,
            "results": [],
            "error_message": e.to_string(),
        })),
    }
}

pub async fn validate_keys(Json(keys): Json<ApiKeys>) -> Json<Value> {
    let mut results = serde_json::Map::new();

    // The LLM key gets a live probe; the others are checked for presence
    // only (their streaming endpoints have no cheap validation call)
    let gemini = if keys.gemini.is_empty() {
        json!({ "valid": false, "message": "API key required" })
    } else {
        let client = GeminiClient::new(keys.gemini.clone());
        match client.complete("test").await {
            Ok(_) => json!({ "valid": true, "message": "Valid" }),
            Err(e) => {
                let mut message = e.to_string();
                message.truncate(100);
                json!({ "valid": false, "message": format!("Invalid: {message}") })
            }
        }
    };
    results.insert("gemini".into(), gemini);

    results.insert(
        "assemblyai".into(),
        if keys.assemblyai.is_empty() {
            json!({ "valid": false, "message": "API key required" })
        } else {
            json!({ "valid": true, "message": "Valid" })
        },
    );
    results.insert(
        "murf".into(),
        if keys.murf.is_empty() {
            json!({ "valid": false, "message": "API key required" })
        } else {
            json!({ "valid": true, "message": "Valid" })
        },
    );
    results.insert(
        "tavily".into(),
        if keys.tavily.is_empty() {
            json!({ "valid": true, "message": "Optional - not provided" })
        } else {
            json!({ "valid": true, "message": "Valid" })
        },
    );

    let all_valid = results
        .iter()
        .filter(|(name, _)| name.as_str() != "tavily")
        .all(|(_, result)| result["valid"] == json!(true));

    Json(json!({
        "success": true,
        "validation_results": results,
        "all_valid": all_valid,
    }))
}

pub async fn cleanup_temp_audio() -> Json<Value> {
    let mut removed = Vec::new();
    let temp_dir = std::env::temp_dir();
    match std::fs::read_dir(&temp_dir) {
        Ok(entries) => {
            for entry in entries.flatten() {
                let name = entry.file_name().to_string_lossy().to_string();
                if !(name.starts_with("voxgate_") && name.ends_with(".wav")) {
                    continue;
                }
                let stale = entry
                    .metadata()
                    .and_then(|m| m.modified())
                    .map(|modified| {
                        SystemTime::now()
                            .duration_since(modified)
                            .unwrap_or_default()
                            > TEMP_AUDIO_MAX_AGE
                    })
                    .unwrap_or(false);
                if stale {
                    if std::fs::remove_file(entry.path()).is_ok() {
                        info!(file = %name, "removed stale temp audio file");
                        removed.push(name);
                    }
                }
            }
        }
        Err(e) => {
            warn!("failed to scan temp directory: {e}");
            return Json(json!({ "success": false, "error": e.to_string() }));
        }
    }
    Json(json!({ "success": true, "removed_files": removed }))
}

pub async fn websocket_status(State(state): State<ServerState>) -> Json<Value> {
    let sessions = state.orchestrator.sessions().debug_snapshot();
    Json(json!({
        "active_connections": state.connections.connection_count(),
        "session_count": sessions.len(),
        "sessions": sessions,
    }))
}

#[derive(Debug, Deserialize)]
pub struct TestTtsRequest {
    #[serde(default = "default_test_text")]
    text: String,
}

fn default_test_text() -> String {
    "This is a voice gateway test.".to_string()
}

/// Drive one synthesis through the streaming TTS path, without a session.
pub async fn test_tts(
    State(state): State<ServerState>,
    Json(request): Json<TestTtsRequest>,
) -> Json<Value> {
    let Some(tts) = state.adapters.read().await.tts.clone() else {
        return Json(json!({ "success": false, "error": "TTS service not configured" }));
    };

    let run = async {
        tts.ensure_connected().await?;
        let context = tts.open_context().await?;
        let mut events = tts.start_synthesis(&context, &request.text).await?;

        let mut chunks: u32 = 0;
        let mut total_size: usize = 0;
        while let Some(event) = events.recv().await {
            match event {
                TtsEvent::AudioChunk {
                    chunk_number,
                    total_size: running_total,
                    is_final,
                    ..
                } => {
                    chunks = chunk_number;
                    total_size = running_total;
                    if is_final {
                        break;
                    }
                }
                TtsEvent::Error(e) => {
                    tts.close_context(&context).await;
                    return Err(crate::error::GatewayError::Tts(e));
                }
                TtsEvent::Timeout => {
                    tts.close_context(&context).await;
                    return Err(crate::error::GatewayError::Tts("TTS test timed out".into()));
                }
                TtsEvent::Status(_) => {}
            }
        }
        tts.close_context(&context).await;
        Ok::<_, crate::error::GatewayError>((chunks, total_size))
    };

    match tokio::time::timeout(state.config.pipeline.tts_total_timeout(), run).await {
        Ok(Ok((chunks, total_size))) => Json(json!({
            "success": true,
            "chunks": chunks,
            "total_size": total_size,
        })),
        Ok(Err(e)) => Json(json!({ "success": false, "error": e.to_string() })),
        Err(_) => Json(json!({ "success": false, "error": "TTS test timed out" })),
    }
}
