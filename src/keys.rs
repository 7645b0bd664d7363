//! Runtime provider keys and adapter provisioning
//!
//! No provider key lives in server configuration; every key arrives from
//! the client at runtime over its WebSocket. Until a usable set arrives the
//! gateway runs locked: transcripts are answered with `api_keys_required`.

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::llm::gemini::GeminiClient;
use crate::llm::LlmAdapter;
use crate::search::{SearchAdapter, TavilySearch};
use crate::stt::assemblyai::AssemblyAiStt;
use crate::stt::SttAdapter;
use crate::tts::murf::MurfTts;
use crate::tts::TtsAdapter;

pub const DEFAULT_VOICE_ID: &str = "en-IN-aarav";

fn default_voice_id() -> String {
    DEFAULT_VOICE_ID.to_string()
}

/// Provider keys as sent by the client in `api_keys_update`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiKeys {
    #[serde(default)]
    pub gemini: String,
    #[serde(default)]
    pub assemblyai: String,
    #[serde(default)]
    pub murf: String,
    #[serde(default = "default_voice_id")]
    pub murf_voice_id: String,
    #[serde(default)]
    pub tavily: String,
}

impl Default for ApiKeys {
    fn default() -> Self {
        Self {
            gemini: String::new(),
            assemblyai: String::new(),
            murf: String::new(),
            murf_voice_id: default_voice_id(),
            tavily: String::new(),
        }
    }
}

impl ApiKeys {
    /// The required providers (search is optional).
    pub fn complete(&self) -> bool {
        !self.gemini.is_empty() && !self.assemblyai.is_empty() && !self.murf.is_empty()
    }
}

/// The live adapter set. Swapped wholesale when keys are re-provisioned.
#[derive(Clone, Default)]
pub struct Adapters {
    pub llm: Option<Arc<dyn LlmAdapter>>,
    pub stt: Option<Arc<dyn SttAdapter>>,
    pub tts: Option<Arc<dyn TtsAdapter>>,
    pub search: Option<Arc<dyn SearchAdapter>>,
}

impl Adapters {
    /// The locked state the server starts in.
    pub fn locked() -> Self {
        Self::default()
    }

    /// Build vendor adapters for every key that was provided.
    pub fn from_keys(keys: &ApiKeys) -> Self {
        let voice_id = if keys.murf_voice_id.is_empty() {
            DEFAULT_VOICE_ID.to_string()
        } else {
            keys.murf_voice_id.clone()
        };

        Self {
            llm: (!keys.gemini.is_empty())
                .then(|| Arc::new(GeminiClient::new(keys.gemini.clone())) as Arc<dyn LlmAdapter>),
            stt: (!keys.assemblyai.is_empty()).then(|| {
                Arc::new(AssemblyAiStt::new(keys.assemblyai.clone())) as Arc<dyn SttAdapter>
            }),
            tts: (!keys.murf.is_empty())
                .then(|| Arc::new(MurfTts::new(keys.murf.clone(), voice_id)) as Arc<dyn TtsAdapter>),
            search: (!keys.tavily.is_empty())
                .then(|| Arc::new(TavilySearch::new(keys.tavily.clone())) as Arc<dyn SearchAdapter>),
        }
    }

    /// True once every adapter on the critical path exists.
    pub fn ready(&self) -> bool {
        self.llm.is_some() && self.stt.is_some() && self.tts.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_keys_deserialization_defaults() {
        let keys: ApiKeys = serde_json::from_str(r#"{"gemini":"g"}"#).unwrap();
        assert_eq!(keys.gemini, "g");
        assert!(keys.assemblyai.is_empty());
        assert_eq!(keys.murf_voice_id, DEFAULT_VOICE_ID);
        assert!(!keys.complete());
    }

    #[test]
    fn test_locked_adapters_not_ready() {
        assert!(!Adapters::locked().ready());
    }

    #[test]
    fn test_partial_keys_build_partial_adapters() {
        let keys = ApiKeys {
            gemini: "g".into(),
            ..Default::default()
        };
        let adapters = Adapters::from_keys(&keys);
        assert!(adapters.llm.is_some());
        assert!(adapters.stt.is_none());
        assert!(!adapters.ready());
    }

    #[test]
    fn test_full_keys_ready() {
        let keys = ApiKeys {
            gemini: "g".into(),
            assemblyai: "a".into(),
            murf: "m".into(),
            ..Default::default()
        };
        assert!(keys.complete());
        assert!(Adapters::from_keys(&keys).ready());
    }
}
