//! Web server: shared state, router, and startup

pub mod connection;
pub mod http;
pub mod ws;

use anyhow::{Context, Result};
use axum::routing::{get, post};
use axum::Router;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::RwLock;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::config::Config;
use crate::history::{self, HistoryStore};
use crate::keys::{Adapters, ApiKeys};
use crate::session::orchestrator::Orchestrator;

use connection::ConnectionManager;

/// Shared server state
#[derive(Clone)]
pub struct ServerState {
    pub config: Arc<Config>,
    pub connections: Arc<ConnectionManager>,
    pub adapters: Arc<RwLock<Adapters>>,
    pub orchestrator: Arc<Orchestrator>,
    pub history: Arc<dyn HistoryStore>,
}

impl ServerState {
    /// Build the state: history store, connection manager, locked adapters,
    /// and the orchestrator wired across them.
    pub async fn new(config: Config) -> Result<Self> {
        let history = history::open_store(config.database.resolved_path().as_deref()).await?;
        let connections = Arc::new(ConnectionManager::new());
        let adapters = Arc::new(RwLock::new(Adapters::locked()));
        let orchestrator = Arc::new(Orchestrator::new(
            Arc::clone(&connections),
            Arc::clone(&adapters),
            Arc::clone(&history),
            config.pipeline.clone(),
        ));
        Ok(Self {
            config: Arc::new(config),
            connections,
            adapters,
            orchestrator,
            history,
        })
    }

    /// Swap the adapter set for newly provided keys. In-flight work is
    /// cancelled and queues drained first so no utterance straddles two
    /// adapter generations. Returns whether any adapter was built.
    pub async fn provision_keys(&self, keys: &ApiKeys) -> bool {
        self.orchestrator.cancel_all_sessions("api keys update").await;

        let adapters = Adapters::from_keys(keys);
        let any = adapters.llm.is_some()
            || adapters.stt.is_some()
            || adapters.tts.is_some()
            || adapters.search.is_some();
        let ready = adapters.ready();
        *self.adapters.write().await = adapters;
        info!(ready, "adapters re-provisioned from client keys");
        any
    }
}

/// Build the router with every route mounted.
pub fn build_router(state: ServerState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/", get(http::home))
        .route("/chat", get(http::chat_page))
        .route("/api/backend", get(http::backend_status))
        .route("/api/sessions", get(http::list_sessions))
        .route(
            "/agent/chat/{session_id}/history",
            get(http::get_history).delete(http::delete_history),
        )
        .route("/api/web-search", post(http::web_search))
        .route("/api/validate-keys", post(http::validate_keys))
        .route("/cleanup/temp-audio", post(http::cleanup_temp_audio))
        .route("/debug/websocket-status", get(http::websocket_status))
        .route("/debug/test-tts", post(http::test_tts))
        .route("/ws/audio", get(ws::ws_handler))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Start the gateway server.
pub async fn start(host: Option<String>, port: Option<u16>) -> Result<()> {
    let config = Config::load().unwrap_or_default();
    let host = host.unwrap_or_else(|| config.server.host.clone());
    let port = port.unwrap_or(config.server.port);

    let state = ServerState::new(config).await?;
    state.orchestrator.spawn_safety_sweep();

    let addr: SocketAddr = format!("{host}:{port}")
        .parse()
        .context("Invalid host/port")?;
    let app = build_router(state);

    println!("━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━");
    println!("     VoxGate Voice Agent Gateway");
    println!("━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━");
    println!();
    println!("✓ Server binding to: {addr}");
    println!("✓ Client WebSocket:  ws://{addr}/ws/audio");
    println!("✓ Provider keys are provisioned by clients at runtime");
    println!();

    info!(%addr, "starting server");
    axum::serve(tokio::net::TcpListener::bind(addr).await?, app).await?;

    Ok(())
}
