//! Speech-to-text adapter
//!
//! Audio bytes in, ordered partial/final transcripts out. The front-end also
//! carries an advisory near-duplicate filter that absorbs ASR flutter (the
//! same sentence finalized twice within a few seconds); the orchestrator's
//! duplicate rules remain authoritative.

pub mod assemblyai;

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::debug;

use crate::error::GatewayError;
use crate::session::duplicate::{normalize, word_jaccard};

/// A transcription result, partial or finalized. Monotonic per stream.
#[derive(Debug, Clone)]
pub struct TranscriptEvent {
    pub text: String,
    pub is_final: bool,
}

/// Handle to one live transcription stream.
pub struct SttSession {
    audio_tx: mpsc::Sender<Vec<u8>>,
    task: JoinHandle<()>,
}

impl SttSession {
    pub fn new(audio_tx: mpsc::Sender<Vec<u8>>, task: JoinHandle<()>) -> Self {
        Self { audio_tx, task }
    }

    /// Forward one chunk of client audio. Never blocks the caller for long;
    /// a full channel means the vendor is behind and the chunk is dropped.
    pub async fn send_audio(&self, chunk: Vec<u8>) {
        if self.audio_tx.try_send(chunk).is_err() {
            debug!("STT audio channel full, dropping chunk");
        }
    }

    /// Tear the stream down.
    pub fn stop(&self) {
        self.task.abort();
    }
}

impl Drop for SttSession {
    fn drop(&mut self) {
        self.task.abort();
    }
}

#[async_trait]
pub trait SttAdapter: Send + Sync {
    /// Open a transcription stream; transcripts arrive on the returned
    /// channel until the session is stopped or the upstream ends it.
    async fn start_stream(
        &self,
    ) -> Result<(SttSession, mpsc::Receiver<TranscriptEvent>), GatewayError>;
}

/// Advisory near-duplicate filter on finalized transcripts: a final whose
/// word set overlaps a recent final at Jaccard >= threshold is suppressed.
#[derive(Debug)]
pub struct TranscriptDeduper {
    recent: VecDeque<(String, Instant)>,
    window: Duration,
    threshold: f64,
}

impl Default for TranscriptDeduper {
    fn default() -> Self {
        Self::new(Duration::from_secs(8), 0.6)
    }
}

impl TranscriptDeduper {
    pub fn new(window: Duration, threshold: f64) -> Self {
        Self {
            recent: VecDeque::new(),
            window,
            threshold,
        }
    }

    /// Returns whether the transcript should be forwarded; accepted
    /// transcripts are remembered for the window.
    pub fn should_forward(&mut self, text: &str) -> bool {
        let normalized = normalize(text);
        if normalized.is_empty() {
            return false;
        }
        while let Some((_, at)) = self.recent.front() {
            if at.elapsed() >= self.window {
                self.recent.pop_front();
            } else {
                break;
            }
        }
        let near_duplicate = self
            .recent
            .iter()
            .any(|(prev, _)| word_jaccard(prev, &normalized) >= self.threshold);
        if near_duplicate {
            debug!(%text, "suppressing near-duplicate transcript");
            return false;
        }
        self.recent.push_back((normalized, Instant::now()));
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_deduper_passes_distinct_transcripts() {
        let mut deduper = TranscriptDeduper::default();
        assert!(deduper.should_forward("what time is it"));
        assert!(deduper.should_forward("tell me a joke"));
    }

    #[test]
    fn test_deduper_suppresses_flutter() {
        let mut deduper = TranscriptDeduper::default();
        assert!(deduper.should_forward("what time is it now"));
        // Same words minus one: Jaccard 4/5 = 0.8
        assert!(!deduper.should_forward("what time is it"));
    }

    #[test]
    fn test_deduper_window_expiry() {
        let mut deduper = TranscriptDeduper::new(Duration::from_millis(0), 0.6);
        assert!(deduper.should_forward("hello there"));
        // Window already expired, so the repeat passes
        assert!(deduper.should_forward("hello there"));
    }

    #[test]
    fn test_deduper_rejects_empty() {
        let mut deduper = TranscriptDeduper::default();
        assert!(!deduper.should_forward("  ...  "));
    }
}
