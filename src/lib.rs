//! VoxGate - Real-time voice agent gateway
//!
//! A bidirectional voice pipeline over one WebSocket:
//! - Client microphone audio streams in and is transcribed live
//! - Finalized utterances run through an LLM with persona prompts,
//!   chat history, and optional web search context
//! - The response streams back as text chunks and synthesized audio
//! - Each accepted utterance is spoken exactly once, FIFO, duplicates
//!   suppressed
//!
//! # Example
//!
//! ```ignore
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     voxgate::server::start(None, None).await
//! }
//! ```

// Core modules (order matters for cross-module dependencies)
pub mod types;
pub mod error;
pub mod config;
pub mod keys;
pub mod history;
pub mod search;
pub mod llm;
pub mod stt;
pub mod tts;
pub mod session;
pub mod server;
pub mod cli;

// Re-export commonly used types for convenience
pub use config::Config;
pub use error::GatewayError;
pub use keys::{Adapters, ApiKeys};
pub use server::{start as start_server, ServerState};
pub use session::orchestrator::Orchestrator;

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Library name
pub const NAME: &str = env!("CARGO_PKG_NAME");
