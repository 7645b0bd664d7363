//! Chat history storage
//!
//! Narrow interface over whatever holds the per-session transcript. Appends
//! are at-least-once: the orchestrator keeps going if a write fails and the
//! next append may duplicate, which readers must tolerate. Two backends: a
//! durable SQLite store and an in-process map used when no database path is
//! configured.

pub mod sqlite;

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use tokio::sync::Mutex;
use tracing::info;

use crate::types::{Message, Role, SessionSummary};

#[async_trait]
pub trait HistoryStore: Send + Sync {
    /// Ordered messages for a session; empty if the session is unknown.
    async fn history(&self, session_id: &str) -> Result<Vec<Message>>;

    /// Append one message. At-least-once semantics.
    async fn append(&self, session_id: &str, role: Role, content: &str) -> Result<()>;

    /// Drop a session's history. Returns whether anything was removed.
    async fn clear(&self, session_id: &str) -> Result<bool>;

    /// All known sessions, most recently active first.
    async fn sessions(&self) -> Result<Vec<SessionSummary>>;
}

/// Open the configured backend: SQLite when a path is given, otherwise the
/// in-process map.
pub async fn open_store(path: Option<&Path>) -> Result<Arc<dyn HistoryStore>> {
    match path {
        Some(path) => {
            info!(path = %path.display(), "opening sqlite history store");
            Ok(Arc::new(sqlite::SqliteHistory::open(path).await?))
        }
        None => {
            info!("no database configured, using in-memory history");
            Ok(Arc::new(InMemoryHistory::new()))
        }
    }
}

/// Volatile fallback store.
#[derive(Default)]
pub struct InMemoryHistory {
    inner: Mutex<HashMap<String, Vec<Message>>>,
}

impl InMemoryHistory {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl HistoryStore for InMemoryHistory {
    async fn history(&self, session_id: &str) -> Result<Vec<Message>> {
        Ok(self
            .inner
            .lock()
            .await
            .get(session_id)
            .cloned()
            .unwrap_or_default())
    }

    async fn append(&self, session_id: &str, role: Role, content: &str) -> Result<()> {
        self.inner
            .lock()
            .await
            .entry(session_id.to_string())
            .or_default()
            .push(Message::new(role, content));
        Ok(())
    }

    async fn clear(&self, session_id: &str) -> Result<bool> {
        Ok(self.inner.lock().await.remove(session_id).is_some())
    }

    async fn sessions(&self) -> Result<Vec<SessionSummary>> {
        let map = self.inner.lock().await;
        let mut summaries: Vec<SessionSummary> = map
            .iter()
            .map(|(id, messages)| SessionSummary {
                session_id: id.clone(),
                message_count: messages.len(),
                last_activity: messages.last().map(|m| m.timestamp),
            })
            .collect();
        summaries.sort_by(|a, b| b.last_activity.cmp(&a.last_activity));
        Ok(summaries)
    }
}
