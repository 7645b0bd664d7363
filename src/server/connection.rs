//! Connection manager
//!
//! Tracks live client sockets by connection id and provides the one safe
//! way to reach them: `safe_send` looks the sender up under the live-set
//! lock, no-ops if the socket is gone, and evicts it on send failure. The
//! orchestrator only ever holds connection ids, never sockets.

use std::collections::HashMap;
use std::sync::Mutex;

use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::session::events::ServerEvent;

pub type ConnectionId = String;

/// Outbound frames are queued per connection; a dedicated sender task owns
/// the socket's write half.
#[derive(Default)]
pub struct ConnectionManager {
    connections: Mutex<HashMap<ConnectionId, mpsc::Sender<String>>>,
}

impl ConnectionManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, id: &str, tx: mpsc::Sender<String>) {
        let mut map = self.connections.lock().unwrap();
        map.insert(id.to_string(), tx);
        info!(connection = id, total = map.len(), "WebSocket connected");
    }

    pub fn remove(&self, id: &str) -> bool {
        let mut map = self.connections.lock().unwrap();
        let removed = map.remove(id).is_some();
        if removed {
            info!(connection = id, total = map.len(), "WebSocket disconnected");
        }
        removed
    }

    pub fn is_connected(&self, id: &str) -> bool {
        self.connections.lock().unwrap().contains_key(id)
    }

    pub fn connection_count(&self) -> usize {
        self.connections.lock().unwrap().len()
    }

    /// Send one text frame. Silently drops the frame if the connection is
    /// not in the live set; a failed send evicts the connection.
    pub async fn safe_send(&self, id: &str, frame: String) -> bool {
        let sender = {
            let map = self.connections.lock().unwrap();
            map.get(id).cloned()
        };
        let Some(sender) = sender else {
            debug!(connection = id, "dropping frame for disconnected socket");
            return false;
        };
        if sender.send(frame).await.is_err() {
            warn!(connection = id, "send failed, evicting connection");
            self.remove(id);
            return false;
        }
        true
    }

    /// Serialize an event (with timestamp) and send it.
    pub async fn send_event(&self, id: &str, event: &ServerEvent) -> bool {
        self.safe_send(id, event.to_frame()).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_send_to_unknown_connection_is_noop() {
        let manager = ConnectionManager::new();
        assert!(!manager.safe_send("nope", "frame".into()).await);
    }

    #[tokio::test]
    async fn test_send_failure_evicts_connection() {
        let manager = ConnectionManager::new();
        let (tx, rx) = mpsc::channel(1);
        manager.register("c1", tx);
        assert!(manager.is_connected("c1"));

        drop(rx);
        assert!(!manager.safe_send("c1", "frame".into()).await);
        assert!(!manager.is_connected("c1"));
    }

    #[tokio::test]
    async fn test_register_and_send() {
        let manager = ConnectionManager::new();
        let (tx, mut rx) = mpsc::channel(4);
        manager.register("c1", tx);

        assert!(manager.safe_send("c1", "hello".into()).await);
        assert_eq!(rx.recv().await.unwrap(), "hello");
        assert_eq!(manager.connection_count(), 1);

        manager.remove("c1");
        assert_eq!(manager.connection_count(), 0);
    }
}
