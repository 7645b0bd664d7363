//! Language model adapter
//!
//! The orchestrator sees a prompt-in, chunk-stream-out interface; prompt
//! assembly (persona preamble, trimmed history, optional web context) lives
//! here so vendor adapters stay pure transport.

pub mod gemini;

use anyhow::Result;
use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::error::GatewayError;
use crate::types::{Message, Role};

/// How many history messages are replayed into the prompt.
const HISTORY_WINDOW: usize = 10;

const DEVELOPER_PROMPT: &str = "You are a professional software developer. Be clear, logical, and helpful. Provide structured solutions with explanations. Use technical terms appropriately and always aim to educate while solving problems. When web search results are provided, incorporate them into your responses with proper citations.";

const AIZEN_PROMPT: &str = "You are Sosuke Aizen from Bleach. Speak calmly with absolute confidence and superiority. Always sound composed and slightly manipulative, as if you have already predicted everything. Use phrases like \"As expected\" or \"Everything is proceeding according to plan.\" Maintain an air of intellectual superiority while being helpful. When web search results are provided, reference them as if you already knew this information was available.";

const LUFFY_PROMPT: &str = "You are Monkey D. Luffy from One Piece. Speak with boundless energy and optimism! Be simple-minded but determined, showing excitement in every answer. Use enthusiastic expressions like \"That's so cool!\" or \"Let's do it!\" Be cheerful and direct, sometimes missing complex details but always eager to help. When web search results are provided, get excited about the information and share it enthusiastically as if you just discovered something amazing!";

const POLITICIAN_PROMPT: &str = "You are a charismatic politician. Speak persuasively with diplomacy and inspiration. Frame your answers like speeches that motivate and influence. Use inclusive language, acknowledge different perspectives, and always end on an uplifting note that brings people together. When web search results are provided, present them as evidence to support your points and build credibility.";

/// Persona preamble for a persona tag; unknown tags fall back to developer.
pub fn persona_prompt(persona: &str) -> &'static str {
    match persona {
        "aizen" => AIZEN_PROMPT,
        "luffy" => LUFFY_PROMPT,
        "politician" => POLITICIAN_PROMPT,
        _ => DEVELOPER_PROMPT,
    }
}

/// Names of the built-in personas.
pub fn persona_names() -> &'static [&'static str] {
    &["developer", "aizen", "luffy", "politician"]
}

fn format_history(messages: &[Message]) -> String {
    if messages.is_empty() {
        return String::new();
    }
    let mut formatted = String::from("\n\nPrevious conversation context:\n");
    let start = messages.len().saturating_sub(HISTORY_WINDOW);
    for msg in &messages[start..] {
        let role = match msg.role {
            Role::User => "User",
            Role::Assistant => "Assistant",
        };
        formatted.push_str(&format!("{}: {}\n", role, msg.content));
    }
    formatted
}

/// Assemble the full prompt for one utterance.
pub fn build_prompt(
    user_message: &str,
    history: &[Message],
    persona: &str,
    web_search_results: Option<&str>,
) -> String {
    let history_context = format_history(history);
    let web_context = match web_search_results {
        Some(results) => format!(
            "\n\nIMPORTANT - CURRENT WEB SEARCH RESULTS:\n{results}\n\
             INSTRUCTION: You MUST use and reference these web search results in your response. \
             The user asked for information and these results were found to help answer their \
             question. Incorporate this information while staying in character.\n"
        ),
        None => String::new(),
    };

    format!(
        "{persona_prompt}\n\n\
         IMPORTANT: Always answer the CURRENT user question directly in character. \
         Do not give generic responses about your capabilities unless specifically asked \
         \"what can you do\".\n\n\
         User's current question: \"{user_message}\"\n\n\
         {history_context}{web_context}\n\n\
         Please provide a specific, helpful answer to the user's current question while \
         maintaining your character/persona. Keep your response under 3000 characters.",
        persona_prompt = persona_prompt(persona),
    )
}

/// Streaming language model interface.
#[async_trait]
pub trait LlmAdapter: Send + Sync {
    /// Start a streaming generation. Text chunks arrive on the returned
    /// channel; a mid-stream failure arrives as a final `Err` item. Adapters
    /// are expected to fall back to a non-streaming completion internally
    /// before giving up.
    async fn stream_response(
        &self,
        prompt: &str,
    ) -> Result<mpsc::Receiver<Result<String, GatewayError>>, GatewayError>;

    /// Non-streaming completion, used for key validation probes.
    async fn complete(&self, prompt: &str) -> Result<String, GatewayError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unknown_persona_falls_back_to_developer() {
        assert_eq!(persona_prompt("nonsense"), persona_prompt("developer"));
        assert_ne!(persona_prompt("aizen"), persona_prompt("developer"));
    }

    #[test]
    fn test_build_prompt_includes_question_and_persona() {
        let prompt = build_prompt("what is rust", &[], "luffy", None);
        assert!(prompt.contains("what is rust"));
        assert!(prompt.contains("Monkey D. Luffy"));
        assert!(!prompt.contains("WEB SEARCH RESULTS"));
    }

    #[test]
    fn test_build_prompt_includes_web_context() {
        let prompt = build_prompt("latest rust release", &[], "developer", Some("1. result"));
        assert!(prompt.contains("CURRENT WEB SEARCH RESULTS"));
        assert!(prompt.contains("1. result"));
    }

    #[test]
    fn test_history_window_is_bounded() {
        let history: Vec<Message> = (0..20)
            .map(|i| Message::new(Role::User, format!("message {i}")))
            .collect();
        let formatted = format_history(&history);
        assert!(!formatted.contains("message 9"));
        assert!(formatted.contains("message 10"));
        assert!(formatted.contains("message 19"));
    }
}
