//! Playback phase tracking
//!
//! One monotonic enum replaces the pile of per-session booleans
//! (`played`, `cleared`, `tts_completed`, `tts_active`). Transitions only
//! move forward; any path that would emit audio first checks the phase, so a
//! response can never be spoken twice no matter which error path ran first.

/// Where the current response is in its playback lifecycle.
///
/// Ordering matters: variants are declared in lifecycle order so `>=`
/// comparisons express "this far or further".
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord)]
pub enum PlaybackPhase {
    /// No response in flight.
    #[default]
    None,
    /// LLM text is streaming; no audio yet.
    LlmOnly,
    /// A TTS context is (being) opened for this response.
    TtsActive,
    /// The final audio chunk (or fallback audio) reached the client.
    Played,
    /// The response buffer has been dropped; nothing left to replay.
    Cleared,
}

impl PlaybackPhase {
    /// Advance to `next` if it is strictly later in the lifecycle.
    /// Returns whether the phase changed.
    pub fn advance(&mut self, next: PlaybackPhase) -> bool {
        if next > *self {
            *self = next;
            true
        } else {
            false
        }
    }

    /// True once audio for the current response must never be emitted again.
    pub fn audio_forbidden(&self) -> bool {
        *self >= PlaybackPhase::Played
    }

    /// True while a TTS context is open or a later phase was reached.
    pub fn tts_started(&self) -> bool {
        *self >= PlaybackPhase::TtsActive
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            PlaybackPhase::None => "none",
            PlaybackPhase::LlmOnly => "llm_only",
            PlaybackPhase::TtsActive => "tts_active",
            PlaybackPhase::Played => "played",
            PlaybackPhase::Cleared => "cleared",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_phase_is_monotonic() {
        let mut phase = PlaybackPhase::None;
        assert!(phase.advance(PlaybackPhase::LlmOnly));
        assert!(phase.advance(PlaybackPhase::TtsActive));
        assert!(phase.advance(PlaybackPhase::Played));
        // Backwards transitions are rejected
        assert!(!phase.advance(PlaybackPhase::LlmOnly));
        assert_eq!(phase, PlaybackPhase::Played);
        assert!(phase.advance(PlaybackPhase::Cleared));
        assert!(!phase.advance(PlaybackPhase::Played));
    }

    #[test]
    fn test_audio_forbidden_at_played_and_after() {
        assert!(!PlaybackPhase::TtsActive.audio_forbidden());
        assert!(PlaybackPhase::Played.audio_forbidden());
        assert!(PlaybackPhase::Cleared.audio_forbidden());
    }

    #[test]
    fn test_skipping_phases_is_allowed() {
        // Error paths jump straight to Cleared without passing Played
        let mut phase = PlaybackPhase::LlmOnly;
        assert!(phase.advance(PlaybackPhase::Cleared));
        assert!(phase.audio_forbidden());
    }
}
