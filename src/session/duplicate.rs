//! Duplicate utterance detection
//!
//! ASR front-ends love to emit the same finalized sentence twice. Three
//! checks keep a repeat from ever reaching the LLM: the currently-processing
//! query, everything sitting in the FIFO queue, and a bounded set of
//! recently-completed utterances. The first two live on the session state;
//! this module owns normalization and the recent-set.

use std::collections::{HashSet, VecDeque};
use std::time::{Duration, Instant};

/// How many completed utterances are remembered for the repeat check.
pub const RECENT_CAPACITY: usize = 8;

/// Window during which a repeat of a completed utterance is rejected.
pub const REPEAT_WINDOW: Duration = Duration::from_secs(15);

/// Normalize text for duplicate comparison: lowercase, every run of
/// non-alphanumeric characters becomes a single space, trimmed.
pub fn normalize(text: &str) -> String {
    let lowered = text.to_lowercase();
    let replaced: String = lowered
        .chars()
        .map(|c| if c.is_alphanumeric() { c } else { ' ' })
        .collect();
    replaced.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Word-set Jaccard similarity, used by the STT front-end's advisory
/// near-duplicate filter.
pub fn word_jaccard(a: &str, b: &str) -> f64 {
    let set_a: HashSet<&str> = a.split_whitespace().collect();
    let set_b: HashSet<&str> = b.split_whitespace().collect();
    if set_a.is_empty() && set_b.is_empty() {
        return 1.0;
    }
    let intersection = set_a.intersection(&set_b).count();
    let union = set_a.union(&set_b).count();
    intersection as f64 / union as f64
}

/// Bounded memory of recently-completed utterances (normalized form plus
/// completion time).
#[derive(Debug)]
pub struct DuplicateGuard {
    recent: VecDeque<(String, Instant)>,
    capacity: usize,
    window: Duration,
}

impl Default for DuplicateGuard {
    fn default() -> Self {
        Self::new(RECENT_CAPACITY, REPEAT_WINDOW)
    }
}

impl DuplicateGuard {
    pub fn new(capacity: usize, window: Duration) -> Self {
        Self {
            recent: VecDeque::with_capacity(capacity),
            capacity,
            window,
        }
    }

    /// Record a completed utterance (already normalized). Oldest entries
    /// fall off once capacity is reached.
    pub fn record_completed(&mut self, normalized: String) {
        if normalized.is_empty() {
            return;
        }
        if self.recent.len() == self.capacity {
            self.recent.pop_front();
        }
        self.recent.push_back((normalized, Instant::now()));
    }

    /// True if `normalized` matches an utterance completed within the
    /// repeat window.
    pub fn recently_completed(&self, normalized: &str) -> bool {
        self.recent
            .iter()
            .any(|(text, at)| text == normalized && at.elapsed() < self.window)
    }

    /// Drop all remembered completions (used on key re-provisioning and
    /// safety resets).
    pub fn clear(&mut self) {
        self.recent.clear();
    }
}
