//! Per-session state and the session table
//!
//! One entry per client session. The table itself is read-mostly; each
//! entry's mutable state sits behind its own mutex, taken only for brief
//! critical sections (enqueue, flag flips, snapshot). Anything that awaits
//! must first drop the guard.

pub mod duplicate;
pub mod events;
pub mod orchestrator;
pub mod playback;

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Instant;

use serde::Serialize;
use tokio::task::AbortHandle;

use duplicate::{normalize, DuplicateGuard};
use playback::PlaybackPhase;

/// Utterances shorter than this (non-whitespace chars) are discarded.
pub const MIN_UTTERANCE_CHARS: usize = 3;

/// A finalized transcript waiting to be (or being) processed. Immutable
/// after creation; persona and web-search flag are captured at enqueue time.
#[derive(Debug, Clone)]
pub struct Utterance {
    pub text: String,
    pub persona: String,
    pub web_search_enabled: bool,
    pub captured_at: Instant,
}

impl Utterance {
    pub fn new(text: impl Into<String>, persona: impl Into<String>, web_search_enabled: bool) -> Self {
        Self {
            text: text.into(),
            persona: persona.into(),
            web_search_enabled,
            captured_at: Instant::now(),
        }
    }
}

/// Mutable per-session state, guarded by the entry's mutex.
#[derive(Debug)]
pub struct SessionState {
    /// Connection id this session currently speaks through.
    pub connection: String,
    pub persona: String,
    pub web_search_enabled: bool,
    /// True from dequeue until the utterance's terminal outcome.
    pub processing: bool,
    /// Refreshed when each utterance starts; the safety sweeper compares
    /// against this to spot stuck sessions.
    pub processing_since: Option<Instant>,
    pub queue: VecDeque<Utterance>,
    /// Raw text of the utterance currently in the processing phase.
    pub current_query: Option<String>,
    pub response_id: Option<String>,
    pub response_buffer: String,
    pub phase: PlaybackPhase,
    /// Open upstream TTS context, if any.
    pub tts_context: Option<String>,
    /// Abort handle for the in-flight TTS child task.
    pub tts_abort: Option<AbortHandle>,
    /// Set by cancellation paths so the processing loop stops draining.
    pub cancelled: bool,
    pub guard: DuplicateGuard,
}

impl SessionState {
    fn new(connection: String) -> Self {
        Self {
            connection,
            persona: "developer".to_string(),
            web_search_enabled: false,
            processing: false,
            processing_since: None,
            queue: VecDeque::new(),
            current_query: None,
            response_id: None,
            response_buffer: String::new(),
            phase: PlaybackPhase::None,
            tts_context: None,
            tts_abort: None,
            cancelled: false,
            guard: DuplicateGuard::default(),
        }
    }

    /// The three duplicate rules: currently-processing query, queued
    /// queries, recently-completed queries. Empty normalizations are
    /// always duplicates.
    pub fn is_duplicate(&self, text: &str) -> bool {
        let candidate = normalize(text);
        if candidate.is_empty() {
            return true;
        }
        if let Some(current) = &self.current_query {
            if normalize(current) == candidate {
                return true;
            }
        }
        if self.queue.iter().any(|u| normalize(&u.text) == candidate) {
            return true;
        }
        self.guard.recently_completed(&candidate)
    }

    /// Pop the next queued utterance, skipping anything that became a
    /// duplicate while it sat in the queue.
    pub fn next_unique(&mut self) -> Option<Utterance> {
        while let Some(candidate) = self.queue.pop_front() {
            let normalized = normalize(&candidate.text);
            if normalized.is_empty() || self.guard.recently_completed(&normalized) {
                tracing::info!(query = %candidate.text, "skipping queued duplicate");
                continue;
            }
            return Some(candidate);
        }
        None
    }

    /// Drop everything tied to the current utterance. Queue and duplicate
    /// memory survive.
    pub fn reset_utterance_state(&mut self) {
        self.current_query = None;
        self.response_id = None;
        self.response_buffer.clear();
        self.phase = PlaybackPhase::None;
        self.tts_context = None;
        self.tts_abort = None;
    }
}

/// One session: id plus locked state.
#[derive(Debug)]
pub struct SessionEntry {
    pub id: String,
    state: Mutex<SessionState>,
}

impl SessionEntry {
    pub fn lock(&self) -> std::sync::MutexGuard<'_, SessionState> {
        self.state.lock().unwrap()
    }
}

/// Point-in-time view of a session for the debug endpoint and sweeper logs.
#[derive(Debug, Clone, Serialize)]
pub struct SessionDebug {
    pub session_id: String,
    pub processing: bool,
    pub queue_length: usize,
    pub phase: &'static str,
    pub has_tts_context: bool,
}

/// All live sessions, keyed by session id.
#[derive(Debug, Default)]
pub struct SessionTable {
    inner: RwLock<HashMap<String, Arc<SessionEntry>>>,
}

impl SessionTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fetch an existing session or create one bound to `connection`.
    pub fn get_or_create(&self, session_id: &str, connection: &str) -> Arc<SessionEntry> {
        if let Some(entry) = self.get(session_id) {
            entry.lock().connection = connection.to_string();
            return entry;
        }
        let mut map = self.inner.write().unwrap();
        map.entry(session_id.to_string())
            .or_insert_with(|| {
                Arc::new(SessionEntry {
                    id: session_id.to_string(),
                    state: Mutex::new(SessionState::new(connection.to_string())),
                })
            })
            .clone()
    }

    pub fn get(&self, session_id: &str) -> Option<Arc<SessionEntry>> {
        self.inner.read().unwrap().get(session_id).cloned()
    }

    /// Remove and return the session. The second concurrent caller gets
    /// `None`, which is what makes disconnect teardown idempotent.
    pub fn remove(&self, session_id: &str) -> Option<Arc<SessionEntry>> {
        self.inner.write().unwrap().remove(session_id)
    }

    pub fn all(&self) -> Vec<Arc<SessionEntry>> {
        self.inner.read().unwrap().values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.inner.read().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn debug_snapshot(&self) -> Vec<SessionDebug> {
        self.all()
            .into_iter()
            .map(|entry| {
                let state = entry.lock();
                SessionDebug {
                    session_id: entry.id.clone(),
                    processing: state.processing,
                    queue_length: state.queue.len(),
                    phase: state.phase.as_str(),
                    has_tts_context: state.tts_context.is_some(),
                }
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_duplicate_against_current_query() {
        let table = SessionTable::new();
        let entry = table.get_or_create("s1", "c1");
        {
            let mut state = entry.lock();
            state.current_query = Some("Hello, world!".to_string());
        }
        assert!(entry.lock().is_duplicate("hello world"));
        assert!(!entry.lock().is_duplicate("goodbye world"));
    }

    #[test]
    fn test_duplicate_against_queue() {
        let table = SessionTable::new();
        let entry = table.get_or_create("s1", "c1");
        entry
            .lock()
            .queue
            .push_back(Utterance::new("tell me a joke", "developer", false));
        assert!(entry.lock().is_duplicate("Tell me a joke."));
    }

    #[test]
    fn test_duplicate_against_recent_completions() {
        let table = SessionTable::new();
        let entry = table.get_or_create("s1", "c1");
        entry.lock().guard.record_completed("what time is it".into());
        assert!(entry.lock().is_duplicate("What time is it?"));
    }

    #[test]
    fn test_next_unique_skips_raced_duplicates() {
        let table = SessionTable::new();
        let entry = table.get_or_create("s1", "c1");
        {
            let mut state = entry.lock();
            state.queue.push_back(Utterance::new("first question", "developer", false));
            state.queue.push_back(Utterance::new("second question", "developer", false));
            state.guard.record_completed("first question".into());
        }
        let next = entry.lock().next_unique().unwrap();
        assert_eq!(next.text, "second question");
        assert!(entry.lock().next_unique().is_none());
    }

    #[test]
    fn test_remove_is_idempotent() {
        let table = SessionTable::new();
        table.get_or_create("s1", "c1");
        assert!(table.remove("s1").is_some());
        assert!(table.remove("s1").is_none());
    }

    #[test]
    fn test_get_or_create_rebinds_connection() {
        let table = SessionTable::new();
        table.get_or_create("s1", "c1");
        let entry = table.get_or_create("s1", "c2");
        assert_eq!(entry.lock().connection, "c2");
        assert_eq!(table.len(), 1);
    }
}
