//! SQLite-backed chat history

use std::path::Path;
use std::sync::Arc;

use anyhow::{Context as _, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection};
use tokio::sync::Mutex;

use crate::types::{Message, Role, SessionSummary};

use super::HistoryStore;

/// Durable history store. A single connection guarded by an async mutex is
/// plenty for this write rate.
pub struct SqliteHistory {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteHistory {
    /// Open (or create) the store at the given path.
    pub async fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref().to_path_buf();

        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .context("Failed to create database directory")?;
        }

        let conn = Connection::open(&path).context("Failed to open history database")?;

        // WAL mode for better concurrent read performance
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL;")?;

        Self::init_schema(&conn)?;

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    fn init_schema(conn: &Connection) -> Result<()> {
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS messages (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                session_id TEXT NOT NULL,
                role TEXT NOT NULL,
                content TEXT NOT NULL,
                timestamp TEXT NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_messages_session
                ON messages(session_id, id);
            "#,
        )?;
        Ok(())
    }
}

#[async_trait]
impl HistoryStore for SqliteHistory {
    async fn history(&self, session_id: &str) -> Result<Vec<Message>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare(
            "SELECT role, content, timestamp FROM messages WHERE session_id = ?1 ORDER BY id",
        )?;
        let rows = stmt.query_map(params![session_id], |row| {
            let role: String = row.get(0)?;
            let content: String = row.get(1)?;
            let timestamp: String = row.get(2)?;
            Ok((role, content, timestamp))
        })?;

        let mut messages = Vec::new();
        for row in rows {
            let (role, content, timestamp) = row?;
            let Some(role) = Role::from_str_opt(&role) else {
                continue;
            };
            let timestamp = DateTime::parse_from_rfc3339(&timestamp)
                .map(|t| t.with_timezone(&Utc))
                .unwrap_or_else(|_| Utc::now());
            messages.push(Message {
                role,
                content,
                timestamp,
            });
        }
        Ok(messages)
    }

    async fn append(&self, session_id: &str, role: Role, content: &str) -> Result<()> {
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT INTO messages (session_id, role, content, timestamp) VALUES (?1, ?2, ?3, ?4)",
            params![session_id, role.as_str(), content, Utc::now().to_rfc3339()],
        )
        .context("Failed to append message")?;
        Ok(())
    }

    async fn clear(&self, session_id: &str) -> Result<bool> {
        let conn = self.conn.lock().await;
        let removed = conn.execute(
            "DELETE FROM messages WHERE session_id = ?1",
            params![session_id],
        )?;
        Ok(removed > 0)
    }

    async fn sessions(&self) -> Result<Vec<SessionSummary>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare(
            "SELECT session_id, COUNT(*), MAX(timestamp) FROM messages \
             GROUP BY session_id ORDER BY MAX(timestamp) DESC",
        )?;
        let rows = stmt.query_map([], |row| {
            let session_id: String = row.get(0)?;
            let count: i64 = row.get(1)?;
            let last: Option<String> = row.get(2)?;
            Ok((session_id, count, last))
        })?;

        let mut summaries = Vec::new();
        for row in rows {
            let (session_id, count, last) = row?;
            summaries.push(SessionSummary {
                session_id,
                message_count: count as usize,
                last_activity: last.and_then(|t| {
                    DateTime::parse_from_rfc3339(&t)
                        .map(|t| t.with_timezone(&Utc))
                        .ok()
                }),
            });
        }
        Ok(summaries)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_sqlite_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let store = SqliteHistory::open(dir.path().join("history.db"))
            .await
            .unwrap();

        store.append("s1", Role::User, "what time is it").await.unwrap();
        store
            .append("s1", Role::Assistant, "it is noon")
            .await
            .unwrap();

        let history = store.history("s1").await.unwrap();
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].role, Role::User);
        assert_eq!(history[1].content, "it is noon");
    }

    #[tokio::test]
    async fn test_sqlite_clear_and_sessions() {
        let dir = tempfile::tempdir().unwrap();
        let store = SqliteHistory::open(dir.path().join("history.db"))
            .await
            .unwrap();

        store.append("a", Role::User, "hi").await.unwrap();
        store.append("b", Role::User, "yo").await.unwrap();

        let sessions = store.sessions().await.unwrap();
        assert_eq!(sessions.len(), 2);

        assert!(store.clear("a").await.unwrap());
        assert!(!store.clear("a").await.unwrap());
        assert_eq!(store.sessions().await.unwrap().len(), 1);
    }
}
