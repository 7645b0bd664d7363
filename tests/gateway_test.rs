//! End-to-end pipeline tests with scripted adapters
//!
//! The orchestrator runs against in-process LLM/STT/TTS stand-ins so the
//! full event flow (queueing, duplicate suppression, playback guarantee,
//! context cleanup, teardown) can be observed frame by frame.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::{mpsc, RwLock};

use voxgate::config::PipelineConfig;
use voxgate::error::GatewayError;
use voxgate::history::{HistoryStore, InMemoryHistory};
use voxgate::keys::Adapters;
use voxgate::llm::LlmAdapter;
use voxgate::server::connection::ConnectionManager;
use voxgate::session::orchestrator::Orchestrator;
use voxgate::stt::{SttAdapter, SttSession, TranscriptEvent};
use voxgate::tts::{ContextId, TtsAdapter, TtsEvent};

// ─── Scripted adapters ───────────────────────────────────────────

struct ScriptedLlm {
    chunks: Vec<String>,
    chunk_delay: Duration,
    fail: bool,
}

impl ScriptedLlm {
    fn ok(chunks: &[&str]) -> Self {
        Self {
            chunks: chunks.iter().map(|c| c.to_string()).collect(),
            chunk_delay: Duration::from_millis(5),
            fail: false,
        }
    }

    fn slow(chunks: &[&str], delay: Duration) -> Self {
        Self {
            chunks: chunks.iter().map(|c| c.to_string()).collect(),
            chunk_delay: delay,
            fail: false,
        }
    }

    fn failing() -> Self {
        Self {
            chunks: Vec::new(),
            chunk_delay: Duration::ZERO,
            fail: true,
        }
    }
}

#[async_trait]
impl LlmAdapter for ScriptedLlm {
    async fn stream_response(
        &self,
        _prompt: &str,
    ) -> Result<mpsc::Receiver<Result<String, GatewayError>>, GatewayError> {
        if self.fail {
            return Err(GatewayError::Llm("scripted LLM failure".into()));
        }
        let (tx, rx) = mpsc::channel(8);
        let chunks = self.chunks.clone();
        let delay = self.chunk_delay;
        tokio::spawn(async move {
            for chunk in chunks {
                if tx.send(Ok(chunk)).await.is_err() {
                    return;
                }
                tokio::time::sleep(delay).await;
            }
        });
        Ok(rx)
    }

    async fn complete(&self, _prompt: &str) -> Result<String, GatewayError> {
        if self.fail {
            return Err(GatewayError::Llm("scripted LLM failure".into()));
        }
        Ok(self.chunks.join(""))
    }
}

struct DummyStt;

#[async_trait]
impl SttAdapter for DummyStt {
    async fn start_stream(
        &self,
    ) -> Result<(SttSession, mpsc::Receiver<TranscriptEvent>), GatewayError> {
        let (audio_tx, mut audio_rx) = mpsc::channel::<Vec<u8>>(8);
        let (_event_tx, event_rx) = mpsc::channel(8);
        let task = tokio::spawn(async move { while audio_rx.recv().await.is_some() {} });
        Ok((SttSession::new(audio_tx, task), event_rx))
    }
}

#[derive(Clone, Copy, PartialEq)]
enum TtsMode {
    /// Emit N audio chunks, the last with is_final.
    Stream(u32),
    /// Emit receive-timeout events until the consumer gives up.
    Timeouts,
    /// Emit a terminal error immediately.
    Fail,
    /// Emit nothing until far beyond the pipeline budget.
    Hang,
}

#[derive(Clone)]
struct ScriptedTts {
    mode: Arc<Mutex<TtsMode>>,
    fallback_ok: Arc<AtomicBool>,
    active: Arc<Mutex<HashSet<String>>>,
    opened: Arc<AtomicUsize>,
    fallback_calls: Arc<AtomicUsize>,
}

impl ScriptedTts {
    fn new(mode: TtsMode, fallback_ok: bool) -> Self {
        Self {
            mode: Arc::new(Mutex::new(mode)),
            fallback_ok: Arc::new(AtomicBool::new(fallback_ok)),
            active: Arc::new(Mutex::new(HashSet::new())),
            opened: Arc::new(AtomicUsize::new(0)),
            fallback_calls: Arc::new(AtomicUsize::new(0)),
        }
    }

    fn streaming(chunks: u32) -> Self {
        Self::new(TtsMode::Stream(chunks), true)
    }

    fn active_count(&self) -> usize {
        self.active.lock().unwrap().len()
    }
}

#[async_trait]
impl TtsAdapter for ScriptedTts {
    async fn ensure_connected(&self) -> Result<(), GatewayError> {
        Ok(())
    }

    async fn active_contexts(&self) -> usize {
        self.active_count()
    }

    async fn clear_all_contexts(&self) {
        self.active.lock().unwrap().clear();
    }

    async fn open_context(&self) -> Result<ContextId, GatewayError> {
        let id = format!("tctx_{}", self.opened.fetch_add(1, Ordering::SeqCst));
        self.active.lock().unwrap().insert(id.clone());
        Ok(id)
    }

    async fn start_synthesis(
        &self,
        context: &str,
        _text: &str,
    ) -> Result<mpsc::Receiver<TtsEvent>, GatewayError> {
        let mode = *self.mode.lock().unwrap();
        let (tx, rx) = mpsc::channel(32);
        let context = context.to_string();
        let active = Arc::clone(&self.active);

        tokio::spawn(async move {
            match mode {
                TtsMode::Stream(chunks) => {
                    for i in 1..=chunks {
                        let is_final = i == chunks;
                        let event = TtsEvent::AudioChunk {
                            audio_base64: "QUJDRA==".into(),
                            chunk_number: i,
                            chunk_size: 8,
                            total_size: 8 * i as usize,
                            is_final,
                        };
                        if tx.send(event).await.is_err() {
                            return;
                        }
                        tokio::time::sleep(Duration::from_millis(5)).await;
                    }
                    // Upstream frees the context on the final chunk
                    active.lock().unwrap().remove(&context);
                }
                TtsMode::Timeouts => {
                    for _ in 0..4 {
                        if tx.send(TtsEvent::Timeout).await.is_err() {
                            return;
                        }
                        tokio::time::sleep(Duration::from_millis(5)).await;
                    }
                }
                TtsMode::Fail => {
                    let _ = tx
                        .send(TtsEvent::Error("scripted synthesis failure".into()))
                        .await;
                }
                TtsMode::Hang => {
                    tokio::time::sleep(Duration::from_secs(60)).await;
                }
            }
        });

        Ok(rx)
    }

    async fn close_context(&self, context: &str) {
        self.active.lock().unwrap().remove(context);
    }

    async fn fallback_synthesize(&self, _text: &str) -> Result<String, GatewayError> {
        self.fallback_calls.fetch_add(1, Ordering::SeqCst);
        if self.fallback_ok.load(Ordering::SeqCst) {
            Ok("https://cdn.example/fallback.mp3".into())
        } else {
            Err(GatewayError::Tts("scripted fallback failure".into()))
        }
    }
}

// ─── Harness ─────────────────────────────────────────────────────

struct Harness {
    orchestrator: Arc<Orchestrator>,
    connections: Arc<ConnectionManager>,
    tts: ScriptedTts,
    frames: mpsc::Receiver<String>,
}

async fn harness(llm: ScriptedLlm, tts: ScriptedTts) -> Harness {
    harness_with_adapters(
        Adapters {
            llm: Some(Arc::new(llm)),
            stt: Some(Arc::new(DummyStt)),
            tts: Some(Arc::new(tts.clone())),
            search: None,
        },
        tts,
    )
    .await
}

async fn harness_with_adapters(adapters: Adapters, tts: ScriptedTts) -> Harness {
    let connections = Arc::new(ConnectionManager::new());
    let adapters = Arc::new(RwLock::new(adapters));
    let history: Arc<dyn HistoryStore> = Arc::new(InMemoryHistory::new());
    let config = PipelineConfig {
        tts_total_timeout_secs: 2,
        tts_max_timeouts: 2,
        sweep_interval_secs: 1,
        stuck_after_secs: 0,
    };
    let orchestrator = Arc::new(Orchestrator::new(
        Arc::clone(&connections),
        adapters,
        history,
        config,
    ));

    let (tx, frames) = mpsc::channel(256);
    connections.register("conn-1", tx);
    orchestrator.bind_session("s1", "conn-1", None, None);

    Harness {
        orchestrator,
        connections,
        tts,
        frames,
    }
}

/// Collect frames until `stop_type` has been seen `stop_count` times (or
/// the deadline passes).
async fn collect_frames(
    frames: &mut mpsc::Receiver<String>,
    stop_type: &str,
    stop_count: usize,
    max: Duration,
) -> Vec<Value> {
    let mut out = Vec::new();
    let mut seen = 0;
    let deadline = tokio::time::Instant::now() + max;
    loop {
        let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
        if remaining.is_zero() {
            break;
        }
        match tokio::time::timeout(remaining, frames.recv()).await {
            Ok(Some(frame)) => {
                let value: Value = serde_json::from_str(&frame).expect("frame is JSON");
                let frame_type = value["type"].as_str().unwrap_or("").to_string();
                out.push(value);
                if frame_type == stop_type {
                    seen += 1;
                    if seen >= stop_count {
                        break;
                    }
                }
            }
            _ => break,
        }
    }
    out
}

fn types_of(frames: &[Value]) -> Vec<String> {
    frames
        .iter()
        .map(|f| f["type"].as_str().unwrap_or("").to_string())
        .collect()
}

fn count_type(frames: &[Value], frame_type: &str) -> usize {
    frames
        .iter()
        .filter(|f| f["type"] == frame_type)
        .count()
}

fn index_of(types: &[String], frame_type: &str) -> usize {
    types
        .iter()
        .position(|t| t == frame_type)
        .unwrap_or_else(|| panic!("no {frame_type} frame in {types:?}"))
}

fn final_audio_count(frames: &[Value]) -> usize {
    frames
        .iter()
        .filter(|f| f["type"] == "tts_audio_chunk" && f["is_final"] == true)
        .count()
}

// ─── Scenarios ───────────────────────────────────────────────────

#[tokio::test]
async fn test_single_utterance_event_order() {
    let mut h = harness(ScriptedLlm::ok(&["Hello", " there!"]), ScriptedTts::streaming(3)).await;

    h.orchestrator.on_final_transcript("s1", "hello world").await;
    let frames = collect_frames(&mut h.frames, "session_reset", 1, Duration::from_secs(3)).await;
    let types = types_of(&frames);

    // Client-visible ordering guarantee
    let start = index_of(&types, "llm_streaming_start");
    let chunk = index_of(&types, "llm_streaming_chunk");
    let saved = index_of(&types, "response_saved");
    let tts_start = index_of(&types, "tts_streaming_start");
    let audio = index_of(&types, "tts_audio_chunk");
    let complete = index_of(&types, "llm_streaming_complete");
    let reset = index_of(&types, "session_reset");
    assert!(start < chunk && chunk < saved && saved < tts_start);
    assert!(tts_start < audio && audio < complete && complete < reset);

    // P1: exactly one final audio chunk, no fallback
    assert_eq!(final_audio_count(&frames), 1);
    assert_eq!(count_type(&frames, "tts_fallback_audio"), 0);

    let complete_frame = &frames[complete];
    assert_eq!(complete_frame["complete_response"], "Hello there!");
    assert_eq!(complete_frame["session_ready"], true);
    assert!(complete_frame["response_id"].as_str().unwrap().starts_with("s1_"));

    // P4: no context left behind
    assert_eq!(h.tts.active_count(), 0);
}

#[tokio::test]
async fn test_duplicate_while_processing_is_rejected() {
    let mut h = harness(
        ScriptedLlm::slow(&["slow", " answer"], Duration::from_millis(150)),
        ScriptedTts::streaming(1),
    )
    .await;

    h.orchestrator.on_final_transcript("s1", "hello world").await;
    tokio::time::sleep(Duration::from_millis(30)).await;
    // Normalizes identically to the in-flight query: rejected, not queued
    h.orchestrator.on_final_transcript("s1", "Hello, world!").await;

    let frames = collect_frames(&mut h.frames, "session_reset", 1, Duration::from_secs(3)).await;
    assert_eq!(count_type(&frames, "llm_streaming_start"), 1);
    assert_eq!(count_type(&frames, "query_queued"), 0);
    assert_eq!(final_audio_count(&frames), 1);
}

#[tokio::test]
async fn test_fifo_queue_processes_in_order() {
    let mut h = harness(
        ScriptedLlm::slow(&["answer"], Duration::from_millis(100)),
        ScriptedTts::streaming(1),
    )
    .await;

    h.orchestrator.on_final_transcript("s1", "what time is it").await;
    tokio::time::sleep(Duration::from_millis(30)).await;
    h.orchestrator.on_final_transcript("s1", "tell me a joke").await;

    let frames = collect_frames(&mut h.frames, "session_reset", 2, Duration::from_secs(5)).await;

    // Second query was queued at position 1
    let queued: Vec<&Value> = frames.iter().filter(|f| f["type"] == "query_queued").collect();
    assert_eq!(queued.len(), 1);
    assert_eq!(queued[0]["query"], "tell me a joke");
    assert_eq!(queued[0]["queue_position"], 1);

    // P2: starts emit in enqueue order
    let starts: Vec<&Value> = frames
        .iter()
        .filter(|f| f["type"] == "llm_streaming_start")
        .collect();
    assert_eq!(starts.len(), 2);
    assert_eq!(starts[0]["user_message"], "what time is it");
    assert_eq!(starts[1]["user_message"], "tell me a joke");

    // Distinct response ids
    let completes: Vec<&Value> = frames
        .iter()
        .filter(|f| f["type"] == "llm_streaming_complete")
        .collect();
    assert_eq!(completes.len(), 2);
    assert_ne!(completes[0]["response_id"], completes[1]["response_id"]);
}

#[tokio::test]
async fn test_duplicate_after_completion_is_suppressed() {
    let mut h = harness(ScriptedLlm::ok(&["answer"]), ScriptedTts::streaming(1)).await;

    h.orchestrator.on_final_transcript("s1", "hello world").await;
    let frames = collect_frames(&mut h.frames, "session_reset", 1, Duration::from_secs(3)).await;
    assert_eq!(count_type(&frames, "llm_streaming_start"), 1);

    // P3: the repeat inside the 15 s window produces nothing
    h.orchestrator.on_final_transcript("s1", "Hello world").await;
    let frames = collect_frames(&mut h.frames, "llm_streaming_start", 1, Duration::from_millis(300)).await;
    assert_eq!(count_type(&frames, "llm_streaming_start"), 0);
}

#[tokio::test]
async fn test_short_transcripts_are_discarded() {
    let mut h = harness(ScriptedLlm::ok(&["answer"]), ScriptedTts::streaming(1)).await;

    h.orchestrator.on_final_transcript("s1", "a").await;
    h.orchestrator.on_final_transcript("s1", " ok ").await;

    let frames = collect_frames(&mut h.frames, "llm_streaming_start", 1, Duration::from_millis(300)).await;
    assert!(frames.is_empty(), "short transcripts produced frames: {frames:?}");
}

#[tokio::test]
async fn test_tts_timeout_falls_back_exactly_once() {
    let mut h = harness(
        ScriptedLlm::ok(&["the answer"]),
        ScriptedTts::new(TtsMode::Timeouts, true),
    )
    .await;

    h.orchestrator.on_final_transcript("s1", "what time is it").await;
    let frames = collect_frames(&mut h.frames, "session_reset", 1, Duration::from_secs(5)).await;

    assert_eq!(count_type(&frames, "tts_timeout_warning"), 2);
    assert_eq!(count_type(&frames, "tts_streaming_timeout"), 1);
    assert_eq!(count_type(&frames, "tts_fallback_audio"), 1);
    assert_eq!(final_audio_count(&frames), 0);
    assert_eq!(h.tts.fallback_calls.load(Ordering::SeqCst), 1);

    // The session recovers
    assert_eq!(count_type(&frames, "session_reset"), 1);
    assert_eq!(h.tts.active_count(), 0);
}

#[tokio::test]
async fn test_tts_failure_with_failed_fallback_is_terminal() {
    let mut h = harness(
        ScriptedLlm::ok(&["the answer"]),
        ScriptedTts::new(TtsMode::Fail, false),
    )
    .await;

    h.orchestrator.on_final_transcript("s1", "what time is it").await;
    let frames = collect_frames(&mut h.frames, "session_reset", 1, Duration::from_secs(5)).await;

    // P1: zero audio with a terminal error frame, never two answers
    assert_eq!(count_type(&frames, "tts_streaming_error"), 1);
    assert_eq!(count_type(&frames, "tts_fallback_audio"), 0);
    assert_eq!(final_audio_count(&frames), 0);
    assert_eq!(count_type(&frames, "session_reset"), 1);
    assert_eq!(h.tts.active_count(), 0);

    // The next utterance proceeds normally
    *h.tts.mode.lock().unwrap() = TtsMode::Stream(1);
    h.orchestrator.on_final_transcript("s1", "tell me a joke").await;
    let frames = collect_frames(&mut h.frames, "session_reset", 1, Duration::from_secs(3)).await;
    assert_eq!(count_type(&frames, "llm_streaming_start"), 1);
    assert_eq!(final_audio_count(&frames), 1);
}

#[tokio::test]
async fn test_llm_failure_resets_session() {
    let mut h = harness(ScriptedLlm::failing(), ScriptedTts::streaming(1)).await;

    h.orchestrator.on_final_transcript("s1", "hello world").await;
    let frames = collect_frames(&mut h.frames, "session_reset", 1, Duration::from_secs(3)).await;

    assert_eq!(count_type(&frames, "llm_streaming_error"), 1);
    assert_eq!(count_type(&frames, "tts_streaming_start"), 0);
    assert_eq!(count_type(&frames, "session_reset"), 1);
    assert_eq!(final_audio_count(&frames), 0);
}

#[tokio::test]
async fn test_disconnect_releases_state_idempotently() {
    let mut h = harness(
        ScriptedLlm::ok(&["the answer"]),
        ScriptedTts::new(TtsMode::Hang, true),
    )
    .await;

    h.orchestrator.on_final_transcript("s1", "hello world").await;
    // Wait for the TTS phase to open its context
    let _ = collect_frames(&mut h.frames, "tts_streaming_start", 1, Duration::from_secs(3)).await;

    // The socket disappears first, then teardown runs (twice, concurrently)
    h.connections.remove("conn-1");
    tokio::join!(
        h.orchestrator.on_disconnect("s1"),
        h.orchestrator.on_disconnect("s1"),
    );

    // P5: exactly one release, session gone
    assert_eq!(h.orchestrator.sessions().len(), 0);

    // P4: the context is closed server-side despite the hang (the worst
    // case is the full streaming budget elapsing before the close runs)
    let deadline = Instant::now() + Duration::from_secs(4);
    while h.tts.active_count() > 0 && Instant::now() < deadline {
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert_eq!(h.tts.active_count(), 0);

    // audio_stop was not deliverable: the socket was already gone
    let frames = collect_frames(&mut h.frames, "audio_stop", 1, Duration::from_millis(200)).await;
    assert_eq!(count_type(&frames, "audio_stop"), 0);
}

#[tokio::test]
async fn test_safety_reset_unsticks_session() {
    let mut h = harness(ScriptedLlm::ok(&["answer"]), ScriptedTts::streaming(1)).await;

    // Wedge the session: processing flagged with no worker attached
    {
        let entry = h.orchestrator.sessions().get("s1").unwrap();
        let mut state = entry.lock();
        state.processing = true;
        state.processing_since = Some(Instant::now());
    }
    tokio::time::sleep(Duration::from_millis(20)).await;

    // P6: the sweep clears the flag (stuck threshold is zero here)
    h.orchestrator.safety_reset_stuck_sessions();
    {
        let entry = h.orchestrator.sessions().get("s1").unwrap();
        assert!(!entry.lock().processing);
    }

    // ...and the next utterance processes normally
    h.orchestrator.on_final_transcript("s1", "hello world").await;
    let frames = collect_frames(&mut h.frames, "session_reset", 1, Duration::from_secs(3)).await;
    assert_eq!(count_type(&frames, "llm_streaming_start"), 1);
}

#[tokio::test]
async fn test_locked_gateway_requires_keys() {
    let tts = ScriptedTts::streaming(1);
    let mut h = harness_with_adapters(Adapters::locked(), tts).await;

    h.orchestrator.on_final_transcript("s1", "hello world").await;
    let frames =
        collect_frames(&mut h.frames, "api_keys_required", 1, Duration::from_secs(2)).await;

    assert_eq!(count_type(&frames, "api_keys_required"), 1);
    assert_eq!(count_type(&frames, "llm_streaming_start"), 0);
    assert_eq!(frames[0]["transcript"], "hello world");
}
