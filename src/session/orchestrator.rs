//! Session orchestrator
//!
//! One instance serves every session in the process. For each session it
//! runs the per-utterance state machine
//! `Idle -> Preparing -> LLMStreaming -> TTSStreaming -> Finalizing -> Idle`
//! with a FIFO queue in front and a duplicate guard at the gate. Processing
//! is serial within a session and parallel across sessions; TTS streaming
//! runs as a supervised child task that cancellation paths can abort.
//!
//! The invariants this file is responsible for:
//! - at most one utterance per session is ever in the processing phase
//! - each accepted utterance yields audio at most once (streaming final
//!   chunk or fallback URL, never both)
//! - the response buffer never survives into the next utterance
//! - every opened TTS context is closed on success, error, cancellation,
//!   and teardown

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use tokio::sync::RwLock;
use tokio::time::timeout;
use tracing::{debug, error, info, warn};

use crate::error::GatewayError;
use crate::history::HistoryStore;
use crate::keys::Adapters;
use crate::llm::{build_prompt, LlmAdapter};
use crate::search::format_results_for_prompt;
use crate::server::connection::ConnectionManager;
use crate::session::duplicate::normalize;
use crate::session::events::ServerEvent;
use crate::session::playback::PlaybackPhase;
use crate::session::{SessionEntry, SessionTable, Utterance, MIN_UTTERANCE_CHARS};
use crate::tts::{TtsAdapter, TtsEvent};
use crate::types::Role;

pub use crate::config::PipelineConfig;

/// Maximum web results folded into the prompt.
const WEB_SEARCH_MAX_RESULTS: usize = 3;

/// What happened to one utterance after it entered Preparing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum UtteranceOutcome {
    Completed,
    Failed,
    Cancelled,
}

/// Terminal state of the TTS child task.
enum TtsChildOutcome {
    Completed { chunks: u32, total_size: usize },
    TimedOut,
    Failed(String),
    /// The event stream ended without a final chunk.
    Closed,
    /// The playback phase flipped to forbidden under us.
    Cancelled,
}

/// Result of one streaming synthesis attempt.
enum TtsStreamResult {
    Completed { chunks: u32, total_size: usize },
    Cancelled,
}

pub struct Orchestrator {
    sessions: SessionTable,
    connections: Arc<ConnectionManager>,
    adapters: Arc<RwLock<Adapters>>,
    history: Arc<dyn HistoryStore>,
    config: PipelineConfig,
}

impl Orchestrator {
    pub fn new(
        connections: Arc<ConnectionManager>,
        adapters: Arc<RwLock<Adapters>>,
        history: Arc<dyn HistoryStore>,
        config: PipelineConfig,
    ) -> Self {
        Self {
            sessions: SessionTable::new(),
            connections,
            adapters,
            history,
            config,
        }
    }

    pub fn sessions(&self) -> &SessionTable {
        &self.sessions
    }

    // ─── Session lifecycle ───────────────────────────────────────

    /// Bind (or create) a session for a connection, optionally applying the
    /// persona and web-search flag sent alongside the bind.
    pub fn bind_session(
        &self,
        session_id: &str,
        connection: &str,
        persona: Option<String>,
        web_search_enabled: Option<bool>,
    ) -> Arc<SessionEntry> {
        let entry = self.sessions.get_or_create(session_id, connection);
        {
            let mut state = entry.lock();
            if let Some(persona) = persona {
                state.persona = persona;
            }
            if let Some(enabled) = web_search_enabled {
                state.web_search_enabled = enabled;
            }
        }
        entry
    }

    /// Rebind a connection to a different session id. The old session's
    /// in-flight work is cancelled and its TTS context closed.
    pub async fn rebind_session(
        &self,
        old_session_id: &str,
        new_session_id: &str,
        connection: &str,
    ) {
        if old_session_id == new_session_id {
            return;
        }
        info!(old_session_id, new_session_id, "rebinding connection to new session");
        if let Some(old) = self.sessions.get(old_session_id) {
            self.cancel_inflight(&old, "session rebind", false).await;
        }
        self.bind_session(new_session_id, connection, None, None);
    }

    pub fn set_persona(&self, session_id: &str, persona: &str) {
        if let Some(entry) = self.sessions.get(session_id) {
            let mut state = entry.lock();
            if state.persona != persona {
                info!(session_id, from = %state.persona, to = persona, "persona updated");
                state.persona = persona.to_string();
            }
        }
    }

    pub fn set_web_search(&self, session_id: &str, enabled: bool) {
        if let Some(entry) = self.sessions.get(session_id) {
            entry.lock().web_search_enabled = enabled;
            info!(session_id, enabled, "web search flag updated");
        }
    }

    /// Tear a session down. Idempotent: only the caller that actually
    /// removes the entry runs the release work, so concurrent disconnects
    /// release exactly once.
    pub async fn on_disconnect(&self, session_id: &str) {
        let Some(entry) = self.sessions.remove(session_id) else {
            return;
        };
        info!(session_id, "releasing session state");
        self.cancel_inflight(&entry, "client disconnect", true).await;
    }

    /// Cancel in-flight work on every session (used when adapters are about
    /// to be swapped for new keys). Queues are drained unprocessed.
    pub async fn cancel_all_sessions(&self, reason: &str) {
        for entry in self.sessions.all() {
            self.cancel_inflight(&entry, reason, true).await;
        }
    }

    // ─── Transcript intake ───────────────────────────────────────

    /// Entry point for finalized transcripts. Returns immediately: the
    /// decision (discard / duplicate / queue / process) happens under a
    /// brief lock and actual processing runs in a spawned task.
    pub async fn on_final_transcript(self: &Arc<Self>, session_id: &str, text: &str) {
        let text = text.trim();
        if text.chars().filter(|c| !c.is_whitespace()).count() < MIN_UTTERANCE_CHARS {
            info!(%text, "discarding short transcript");
            return;
        }
        let Some(entry) = self.sessions.get(session_id) else {
            warn!(session_id, "transcript for unknown session");
            return;
        };
        let connection = entry.lock().connection.clone();

        if !self.adapters.read().await.ready() {
            warn!(session_id, "API keys not configured, cannot process transcript");
            self.connections
                .send_event(
                    &connection,
                    &ServerEvent::ApiKeysRequired {
                        message: "Please configure your API keys in settings before using the voice agent"
                            .into(),
                        transcript: text.to_string(),
                    },
                )
                .await;
            return;
        }

        enum Decision {
            Duplicate,
            Queued(usize),
            Process(Utterance),
        }

        let decision = {
            let mut state = entry.lock();
            if state.is_duplicate(text) {
                Decision::Duplicate
            } else if state.processing {
                let utterance =
                    Utterance::new(text, state.persona.clone(), state.web_search_enabled);
                state.queue.push_back(utterance);
                Decision::Queued(state.queue.len())
            } else {
                state.processing = true;
                state.processing_since = Some(Instant::now());
                state.cancelled = false;
                Decision::Process(Utterance::new(
                    text,
                    state.persona.clone(),
                    state.web_search_enabled,
                ))
            }
        };

        match decision {
            Decision::Duplicate => {
                info!(session_id, query = %text, "duplicate query rejected");
            }
            Decision::Queued(position) => {
                info!(session_id, query = %text, position, "query queued");
                self.connections
                    .send_event(
                        &connection,
                        &ServerEvent::QueryQueued {
                            message: format!("Query added to queue (position {position})"),
                            query: text.to_string(),
                            queue_position: position,
                            session_id: session_id.to_string(),
                        },
                    )
                    .await;
            }
            Decision::Process(utterance) => {
                let this = Arc::clone(self);
                let entry = Arc::clone(&entry);
                tokio::spawn(async move {
                    this.process_loop(entry, utterance).await;
                });
            }
        }
    }

    /// Serial per-session worker: process one utterance, then drain the
    /// queue FIFO until empty or cancelled.
    async fn process_loop(self: Arc<Self>, entry: Arc<SessionEntry>, first: Utterance) {
        let mut current = Some(first);
        while let Some(utterance) = current.take() {
            {
                let mut state = entry.lock();
                state.processing = true;
                state.processing_since = Some(Instant::now());
            }

            self.process_utterance(&entry, &utterance).await;

            let mut state = entry.lock();
            if state.cancelled {
                state.processing = false;
                state.processing_since = None;
                return;
            }
            current = state.next_unique();
            if current.is_none() {
                state.processing = false;
                state.processing_since = None;
            }
        }
    }

    // ─── Per-utterance state machine ─────────────────────────────

    async fn process_utterance(&self, entry: &Arc<SessionEntry>, utterance: &Utterance) {
        let session_id = entry.id.clone();
        info!(%session_id, query = %utterance.text, persona = %utterance.persona, "processing utterance");

        // A previous stuck utterance may have left a TTS child running if
        // the safety sweep unblocked this session; preempt it first
        self.cancel_lingering_tts(entry).await;

        // Preparing: fresh response identity, empty buffer, phase reset
        let response_id = make_response_id(&session_id, &utterance.text);
        let connection = {
            let mut state = entry.lock();
            state.current_query = Some(utterance.text.clone());
            state.response_id = Some(response_id.clone());
            state.response_buffer.clear();
            state.phase = PlaybackPhase::None;
            state.connection.clone()
        };

        let outcome = self
            .run_pipeline(entry, utterance, &connection, &response_id)
            .await;

        // Terminal bookkeeping, unconditionally: the buffer must not
        // survive into the next utterance and the playback phase must
        // forbid any late audio
        {
            let mut state = entry.lock();
            state.response_buffer.clear();
            state.phase.advance(PlaybackPhase::Cleared);
            if outcome != UtteranceOutcome::Cancelled {
                state.guard.record_completed(normalize(&utterance.text));
            }
            state.reset_utterance_state();
        }

        info!(%session_id, ?outcome, "utterance finished");
    }

    async fn run_pipeline(
        &self,
        entry: &Arc<SessionEntry>,
        utterance: &Utterance,
        connection: &str,
        response_id: &str,
    ) -> UtteranceOutcome {
        let session_id = entry.id.clone();
        let text = utterance.text.as_str();

        let (llm, tts, search) = {
            let adapters = self.adapters.read().await;
            (
                adapters.llm.clone(),
                adapters.tts.clone(),
                adapters.search.clone(),
            )
        };
        let (Some(llm), Some(tts)) = (llm, tts) else {
            // Keys were pulled between intake and processing
            self.connections
                .send_event(
                    connection,
                    &ServerEvent::ApiKeysRequired {
                        message: "Please configure your API keys in settings before using the voice agent"
                            .into(),
                        transcript: text.to_string(),
                    },
                )
                .await;
            return UtteranceOutcome::Failed;
        };

        // Chat history: load before appending so the prompt does not
        // include the current question twice
        let chat_history = match self.history.history(&session_id).await {
            Ok(history) => history,
            Err(e) => {
                error!("chat history load failed: {e}");
                Vec::new()
            }
        };
        if let Err(e) = self.history.append(&session_id, Role::User, text).await {
            error!("failed to save user message: {e}");
        }

        // Optional web search
        let mut web_context = None;
        if utterance.web_search_enabled {
            if let Some(search) = search {
                self.connections
                    .send_event(
                        connection,
                        &ServerEvent::WebSearchStart {
                            message: format!("Searching the web for: {text}"),
                            query: text.to_string(),
                        },
                    )
                    .await;
                match search.search(text, WEB_SEARCH_MAX_RESULTS).await {
                    Ok(results) if !results.is_empty() => {
                        web_context = Some(format_results_for_prompt(&results, true));
                        self.connections
                            .send_event(
                                connection,
                                &ServerEvent::WebSearchComplete {
                                    message: format!("Found {} web results", results.len()),
                                    results,
                                },
                            )
                            .await;
                    }
                    Ok(_) => {
                        warn!(%session_id, "no web search results found");
                    }
                    Err(e) => {
                        error!("web search error: {e}");
                        self.connections
                            .send_event(
                                connection,
                                &ServerEvent::WebSearchError {
                                    message: format!("Web search failed: {e}"),
                                },
                            )
                            .await;
                    }
                }
            } else {
                debug!(%session_id, "web search enabled but no search adapter configured");
            }
        }

        // LLMStreaming
        self.connections
            .send_event(
                connection,
                &ServerEvent::LlmStreamingStart {
                    message: "LLM is generating response...".into(),
                    user_message: text.to_string(),
                    web_search_enabled: utterance.web_search_enabled,
                },
            )
            .await;
        entry.lock().phase.advance(PlaybackPhase::LlmOnly);

        let prompt = build_prompt(text, &chat_history, &utterance.persona, web_context.as_deref());
        let accumulated = match self.run_llm_stream(entry, connection, &llm, &prompt).await {
            Ok(accumulated) => accumulated,
            Err(e) => {
                error!("LLM streaming failed: {e}");
                self.connections
                    .send_event(
                        connection,
                        &ServerEvent::LlmStreamingError {
                            message: format!("Error generating LLM response: {e}"),
                        },
                    )
                    .await;
                self.send_session_reset(connection, &session_id, "Session ready for next query")
                    .await;
                return UtteranceOutcome::Failed;
            }
        };

        if entry.lock().cancelled {
            return UtteranceOutcome::Cancelled;
        }

        // Persist the assistant message as soon as generation completes,
        // before any audio work can fail
        match self
            .history
            .append(&session_id, Role::Assistant, &accumulated)
            .await
        {
            Ok(()) => {
                self.connections
                    .send_event(
                        connection,
                        &ServerEvent::ResponseSaved {
                            message: "Assistant response saved to history".into(),
                            response_length: accumulated.len(),
                        },
                    )
                    .await;
            }
            Err(e) => error!("failed to save assistant response: {e}"),
        }

        // TTSStreaming
        let (audio_chunks, total_audio_size, cancelled) = self
            .run_tts_phase(entry, connection, &tts, &accumulated, response_id)
            .await;
        if cancelled {
            return UtteranceOutcome::Cancelled;
        }

        // Finalizing
        self.connections
            .send_event(
                connection,
                &ServerEvent::LlmStreamingComplete {
                    message: "LLM response and TTS streaming completed".into(),
                    complete_response: accumulated.clone(),
                    total_length: accumulated.len(),
                    audio_chunks_received: audio_chunks,
                    total_audio_size,
                    session_id: session_id.clone(),
                    response_id: response_id.to_string(),
                    session_ready: true,
                },
            )
            .await;
        self.send_session_reset(connection, &session_id, "Session ready for next query")
            .await;

        UtteranceOutcome::Completed
    }

    async fn run_llm_stream(
        &self,
        entry: &Arc<SessionEntry>,
        connection: &str,
        llm: &Arc<dyn LlmAdapter>,
        prompt: &str,
    ) -> Result<String, GatewayError> {
        let mut chunks = llm.stream_response(prompt).await?;
        let mut accumulated = String::new();

        while let Some(item) = chunks.recv().await {
            match item {
                Ok(chunk) => {
                    accumulated.push_str(&chunk);
                    {
                        let mut state = entry.lock();
                        state.response_buffer.push_str(&chunk);
                        if state.cancelled {
                            return Ok(accumulated);
                        }
                    }
                    self.connections
                        .send_event(
                            connection,
                            &ServerEvent::LlmStreamingChunk {
                                chunk,
                                accumulated_length: accumulated.len(),
                            },
                        )
                        .await;
                }
                Err(e) => {
                    if accumulated.trim().is_empty() {
                        return Err(e);
                    }
                    // Partial output exists: speak what we have
                    warn!(
                        chars = accumulated.len(),
                        "LLM stream errored after partial output, continuing: {e}"
                    );
                    break;
                }
            }
        }

        if accumulated.trim().is_empty() {
            return Err(GatewayError::Llm("Empty response from LLM stream".into()));
        }
        Ok(accumulated)
    }

    /// Run streaming synthesis with the fallback policy. Returns
    /// (audio chunks, total audio size, cancelled).
    async fn run_tts_phase(
        &self,
        entry: &Arc<SessionEntry>,
        connection: &str,
        tts: &Arc<dyn TtsAdapter>,
        response_text: &str,
        response_id: &str,
    ) -> (u32, usize, bool) {
        // Replay guard: if audio already happened (or a concurrent path is
        // mid-TTS), skip straight to Finalizing
        {
            let mut state = entry.lock();
            if state.cancelled {
                return (0, 0, true);
            }
            if state.phase.tts_started() {
                warn!(
                    session_id = %entry.id,
                    phase = state.phase.as_str(),
                    "preventing TTS replay, phase already advanced"
                );
                return (0, 0, false);
            }
            state.phase.advance(PlaybackPhase::TtsActive);
        }

        match self.stream_tts(entry, connection, tts, response_text).await {
            Ok(TtsStreamResult::Completed { chunks, total_size }) => (chunks, total_size, false),
            Ok(TtsStreamResult::Cancelled) => (0, 0, true),
            Err(e) => {
                let cancelled = entry.lock().cancelled;
                if cancelled {
                    return (0, 0, true);
                }
                error!("TTS streaming failed: {e}");
                self.attempt_fallback(entry, connection, tts, &e, response_id)
                    .await;
                (0, 0, false)
            }
        }
    }

    /// One streaming synthesis attempt: open a context, send the full text,
    /// forward audio from a supervised child task under the wall-clock
    /// budget.
    async fn stream_tts(
        &self,
        entry: &Arc<SessionEntry>,
        connection: &str,
        tts: &Arc<dyn TtsAdapter>,
        response_text: &str,
    ) -> Result<TtsStreamResult, GatewayError> {
        tts.ensure_connected().await?;

        self.connections
            .send_event(
                connection,
                &ServerEvent::TtsStreamingStart {
                    message: "Starting TTS streaming...".into(),
                },
            )
            .await;

        let context = tts.open_context().await?;
        entry.lock().tts_context = Some(context.clone());

        let events = tts.start_synthesis(&context, response_text).await;
        let mut events = match events {
            Ok(events) => events,
            Err(e) => {
                tts.close_context(&context).await;
                entry.lock().tts_context = None;
                return Err(e);
            }
        };

        let connections = Arc::clone(&self.connections);
        let child_entry = Arc::clone(entry);
        let child_connection = connection.to_string();
        let max_timeouts = self.config.tts_max_timeouts;

        let mut child = tokio::spawn(async move {
            let mut chunks: u32 = 0;
            let mut total_size: usize = 0;
            let mut timeouts: u32 = 0;

            while let Some(event) = events.recv().await {
                match event {
                    TtsEvent::AudioChunk {
                        audio_base64,
                        chunk_number,
                        chunk_size,
                        total_size: running_total,
                        is_final,
                    } => {
                        if child_entry.lock().phase.audio_forbidden() {
                            return TtsChildOutcome::Cancelled;
                        }
                        chunks = chunk_number;
                        total_size = running_total;
                        connections
                            .send_event(
                                &child_connection,
                                &ServerEvent::TtsAudioChunk {
                                    audio_base64,
                                    chunk_number,
                                    chunk_size,
                                    total_size: running_total,
                                    is_final,
                                },
                            )
                            .await;
                        if is_final {
                            // The single-playback tripwire: mark played and
                            // drop the buffer in the same critical section
                            let mut state = child_entry.lock();
                            state.phase.advance(PlaybackPhase::Played);
                            state.response_buffer.clear();
                            state.phase.advance(PlaybackPhase::Cleared);
                            return TtsChildOutcome::Completed { chunks, total_size };
                        }
                    }
                    TtsEvent::Timeout => {
                        timeouts += 1;
                        warn!(timeouts, max_timeouts, "TTS receive timeout");
                        connections
                            .send_event(
                                &child_connection,
                                &ServerEvent::TtsTimeoutWarning {
                                    timeout_count: timeouts,
                                    max_timeouts,
                                },
                            )
                            .await;
                        if timeouts >= max_timeouts {
                            return TtsChildOutcome::TimedOut;
                        }
                    }
                    TtsEvent::Status(data) => {
                        connections
                            .send_event(&child_connection, &ServerEvent::TtsStatus { data })
                            .await;
                    }
                    TtsEvent::Error(e) => return TtsChildOutcome::Failed(e),
                }
            }
            TtsChildOutcome::Closed
        });

        entry.lock().tts_abort = Some(child.abort_handle());

        let outcome = match timeout(self.config.tts_total_timeout(), &mut child).await {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(join_error)) => {
                if join_error.is_cancelled() {
                    TtsChildOutcome::Cancelled
                } else {
                    TtsChildOutcome::Failed("TTS task panicked".into())
                }
            }
            Err(_elapsed) => {
                // Prompt cancellation: abort and await before anything else
                // touches this session
                child.abort();
                let _ = child.await;
                TtsChildOutcome::TimedOut
            }
        };

        entry.lock().tts_abort = None;

        // Close the context on every path. After a successful final chunk
        // the upstream already freed it; the clear is a harmless no-op then.
        tts.close_context(&context).await;
        entry.lock().tts_context = None;

        match outcome {
            TtsChildOutcome::Completed { chunks, total_size } => {
                Ok(TtsStreamResult::Completed { chunks, total_size })
            }
            TtsChildOutcome::Cancelled => Ok(TtsStreamResult::Cancelled),
            TtsChildOutcome::TimedOut => {
                Err(GatewayError::Timeout(self.config.tts_total_timeout()))
            }
            TtsChildOutcome::Failed(e) => Err(GatewayError::Tts(e)),
            TtsChildOutcome::Closed => {
                Err(GatewayError::Tts("No audio response received from TTS service".into()))
            }
        }
    }

    /// Exactly one fallback attempt per utterance, and only while nothing
    /// has been played. Any outcome forecloses further replay.
    async fn attempt_fallback(
        &self,
        entry: &Arc<SessionEntry>,
        connection: &str,
        tts: &Arc<dyn TtsAdapter>,
        cause: &GatewayError,
        response_id: &str,
    ) {
        if matches!(cause, GatewayError::Timeout(_)) {
            self.connections
                .send_event(
                    connection,
                    &ServerEvent::TtsStreamingTimeout {
                        message: "TTS streaming timed out, attempting fallback...".into(),
                    },
                )
                .await;
        }

        let buffered = {
            let state = entry.lock();
            if state.phase.audio_forbidden() {
                None
            } else {
                let text = state.response_buffer.trim().to_string();
                (!text.is_empty()).then_some(text)
            }
        };

        let Some(text) = buffered else {
            warn!(
                session_id = %entry.id,
                "skipping fallback TTS: response already played or buffer empty"
            );
            self.foreclose_replay(entry);
            return;
        };

        match tts.fallback_synthesize(&text).await {
            Ok(audio_url) => {
                info!(session_id = %entry.id, "fallback audio generated");
                self.connections
                    .send_event(
                        connection,
                        &ServerEvent::TtsFallbackAudio {
                            audio_url,
                            message: "Using fallback audio generation due to streaming failure"
                                .into(),
                            response_id: response_id.to_string(),
                        },
                    )
                    .await;
                let mut state = entry.lock();
                state.phase.advance(PlaybackPhase::Played);
                state.response_buffer.clear();
                state.phase.advance(PlaybackPhase::Cleared);
            }
            Err(fallback_error) => {
                error!("fallback TTS failed: {fallback_error}");
                self.connections
                    .send_event(
                        connection,
                        &ServerEvent::TtsStreamingError {
                            message: format!(
                                "Both streaming and fallback TTS failed: {cause}"
                            ),
                        },
                    )
                    .await;
                self.foreclose_replay(entry);
            }
        }
    }

    /// Drop the buffer and advance the phase so no later path can emit
    /// audio for this response.
    fn foreclose_replay(&self, entry: &Arc<SessionEntry>) {
        let mut state = entry.lock();
        state.response_buffer.clear();
        state.phase.advance(PlaybackPhase::Played);
        state.phase.advance(PlaybackPhase::Cleared);
    }

    async fn send_session_reset(&self, connection: &str, session_id: &str, message: &str) {
        self.connections
            .send_event(
                connection,
                &ServerEvent::SessionReset {
                    message: message.to_string(),
                    session_id: session_id.to_string(),
                },
            )
            .await;
    }

    // ─── Cancellation ────────────────────────────────────────────

    /// Abort a TTS child left behind by a stuck utterance (safety-reset
    /// preemption path). No-op when nothing lingers.
    async fn cancel_lingering_tts(&self, entry: &Arc<SessionEntry>) {
        let (abort, context, connection) = {
            let mut state = entry.lock();
            (
                state.tts_abort.take(),
                state.tts_context.take(),
                state.connection.clone(),
            )
        };
        if abort.is_none() && context.is_none() {
            return;
        }
        info!(session_id = %entry.id, "preempting lingering TTS task");
        if let Some(handle) = abort {
            handle.abort();
        }
        if let Some(context) = context {
            if let Some(tts) = self.adapters.read().await.tts.clone() {
                tts.close_context(&context).await;
            }
        }
        self.connections
            .send_event(
                &connection,
                &ServerEvent::AudioStop {
                    message: "Stopping previous audio for new query".into(),
                    session_id: entry.id.clone(),
                },
            )
            .await;
    }

    /// Cancel the in-flight utterance: abort the TTS child, close the open
    /// context, clear the buffer, tell the client to stop playback. With
    /// `drain_queue` the pending queue is dropped unprocessed.
    pub async fn cancel_inflight(&self, entry: &Arc<SessionEntry>, reason: &str, drain_queue: bool) {
        info!(session_id = %entry.id, reason, "cancelling in-flight work");
        let (abort, context, connection) = {
            let mut state = entry.lock();
            state.cancelled = true;
            state.response_buffer.clear();
            state.phase.advance(PlaybackPhase::Cleared);
            if drain_queue {
                state.queue.clear();
            }
            (
                state.tts_abort.take(),
                state.tts_context.take(),
                state.connection.clone(),
            )
        };
        if let Some(handle) = abort {
            handle.abort();
        }
        if let Some(context) = context {
            if let Some(tts) = self.adapters.read().await.tts.clone() {
                tts.close_context(&context).await;
            }
        }
        // No-ops when the socket is already gone (disconnect path)
        self.connections
            .send_event(
                &connection,
                &ServerEvent::AudioStop {
                    message: "Stopping audio playback".into(),
                    session_id: entry.id.clone(),
                },
            )
            .await;
    }

    // ─── Safety sweep ────────────────────────────────────────────

    /// Background task that unsticks sessions whose processing flag has
    /// outlived progress. Queues survive so the next intake can drain them.
    pub fn spawn_safety_sweep(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let this = Arc::clone(self);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(this.config.sweep_interval());
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // The first tick fires immediately; skip it
            interval.tick().await;
            loop {
                interval.tick().await;
                this.safety_reset_stuck_sessions();
            }
        })
    }

    /// One sweep pass, extracted for tests.
    pub fn safety_reset_stuck_sessions(&self) {
        let stuck_after = self.config.stuck_after();
        for entry in self.sessions.all() {
            let mut state = entry.lock();
            if !state.processing {
                continue;
            }
            let stuck = state
                .processing_since
                .map(|since| since.elapsed() > stuck_after)
                .unwrap_or(true);
            if stuck {
                warn!(
                    session_id = %entry.id,
                    queue = state.queue.len(),
                    "session stuck in processing state, force-resetting"
                );
                state.processing = false;
                state.processing_since = None;
                state.response_buffer.clear();
                state.current_query = None;
                state.response_id = None;
                state.phase = PlaybackPhase::None;
                // Queue intentionally untouched: the next intake drains it
            }
        }
    }
}

fn make_response_id(session_id: &str, text: &str) -> String {
    let mut hasher = DefaultHasher::new();
    text.hash(&mut hasher);
    format!(
        "{session_id}_{}_{:016x}",
        Utc::now().timestamp_millis(),
        hasher.finish()
    )
}
