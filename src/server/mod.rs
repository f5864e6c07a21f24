//! HTTP server: spectator API, match streams and the agent bridge.

pub mod stream;

pub use stream::{StreamContext, StreamSettings};

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    Json, Router,
    extract::State,
    http::StatusCode,
    routing::get,
};
use tokio::net::TcpListener;
use tokio::sync::watch;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::bridge::{self, Bridge, WsDialer};
use crate::buffer::BufferManager;
use crate::config::ResolvedConfig;
use crate::models::{LiveMatch, MatchSource, MatchStatus};
use crate::storage::{self, GameRecordStore, SqliteStore};
use crate::{Error, Result};

/// Maximum number of live matches listed for the picker
pub const LIVE_LIST_LIMIT: usize = 20;

/// Process-wide shutdown signal shared by long-lived connections.
#[derive(Clone)]
pub struct Shutdown {
    tx: Arc<watch::Sender<bool>>,
}

impl Default for Shutdown {
    fn default() -> Self {
        Self::new()
    }
}

impl Shutdown {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(false);
        Self { tx: Arc::new(tx) }
    }

    pub fn trigger(&self) {
        self.tx.send_replace(true);
    }

    pub fn is_triggered(&self) -> bool {
        *self.tx.borrow()
    }

    /// Resolves once `trigger` has been called (immediately if it already was).
    pub async fn wait(&self) {
        let mut rx = self.tx.subscribe();
        // The sender lives as long as `self`, so this cannot fail.
        let _ = rx.wait_for(|triggered| *triggered).await;
    }
}

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    /// Read access to matches and plies
    pub store: Arc<dyn GameRecordStore>,
    /// Completed games ready for replay
    pub buffer: Arc<BufferManager>,
    /// Agent bridge gatekeeper
    pub bridge: Arc<Bridge>,
    /// Timing for spectator streams
    pub stream: StreamSettings,
    pub shutdown: Shutdown,
}

impl AppState {
    pub fn stream_context(&self) -> StreamContext {
        StreamContext {
            store: Arc::clone(&self.store),
            buffer: Arc::clone(&self.buffer),
            settings: self.stream,
            shutdown: self.shutdown.clone(),
        }
    }
}

/// Build the application router.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/api/matches/live", get(get_live_matches))
        .route("/api/buffer", get(get_buffer))
        .route("/api/matches/:match_id/stream", get(stream::stream_handler))
        .route(bridge::CONNECT_PATH, get(bridge::connect_handler))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Serve `state` on `listener` until `signal` resolves.
///
/// On shutdown every open stream and bridge is told to stop, then the server
/// waits for in-flight responses to finish.
pub async fn serve<F>(listener: TcpListener, state: AppState, signal: F) -> Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let shutdown = state.shutdown.clone();
    let app = router(state);
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            signal.await;
            tracing::info!("shutting down");
            shutdown.trigger();
        })
        .await?;
    Ok(())
}

/// Start the relay with the production SQLite store and execution dialer.
pub async fn start_server(config: &ResolvedConfig) -> Result<()> {
    let addr = config.bind_addr()?;
    let database = config.database.value.clone();
    let store = Arc::new(storage::blocking(move || SqliteStore::open(&database)).await?);

    let buffer = Arc::new(BufferManager::new(
        Arc::clone(&store) as Arc<dyn GameRecordStore>,
        config.buffer_settings(),
    ));
    let dialer = Arc::new(WsDialer::new(config.execution_url.value.clone()));
    let state = AppState {
        store: Arc::clone(&store) as Arc<dyn GameRecordStore>,
        buffer: Arc::clone(&buffer),
        bridge: Arc::new(Bridge::new(store, dialer)),
        stream: config.stream_settings(),
        shutdown: Shutdown::new(),
    };

    let listener = TcpListener::bind(addr).await?;
    tracing::info!(
        %addr,
        version = crate::VERSION,
        commit = crate::GIT_COMMIT,
        database = %config.database.value.display(),
        execution_url = %config.execution_url.value,
        "relay listening"
    );

    let poller = buffer.start();
    let result = serve(listener, state, async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::warn!(error = %e, "could not listen for ctrl-c");
            std::future::pending::<()>().await;
        }
    })
    .await;
    poller.stop().await;
    result
}

/// Parse `host:port` into a socket address.
pub fn parse_bind_addr(host: &str, port: u16) -> Result<SocketAddr> {
    let ip: std::net::IpAddr = host
        .parse()
        .map_err(|e| Error::Config(format!("Invalid host address '{}': {}", host, e)))?;
    Ok(SocketAddr::from((ip, port)))
}

/// Liveness check
async fn health(State(state): State<AppState>) -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "ok",
        "version": crate::VERSION,
        "commit": crate::GIT_COMMIT,
        "buffered": state.buffer.len().await,
        "bridges": state.bridge.registry().active_count(),
    }))
}

/// Picker list: live matches from the store, then buffered replays.
///
/// A store failure is logged and the replays are still served.
async fn get_live_matches(State(state): State<AppState>) -> Json<serde_json::Value> {
    let store = Arc::clone(&state.store);
    let live = storage::blocking(move || {
        store
            .live_matches(LIVE_LIST_LIMIT)?
            .into_iter()
            .map(|m| {
                Ok(LiveMatch {
                    white: store.agent_profile(&m.white_agent_id)?,
                    black: store.agent_profile(&m.black_agent_id)?,
                    id: m.id,
                    status: m.status,
                    source: MatchSource::Live,
                })
            })
            .collect::<Result<Vec<_>>>()
    })
    .await
    .unwrap_or_else(|e| {
        tracing::warn!(error = %e, "failed to list live matches");
        Vec::new()
    });

    let replays = state.buffer.list().await.into_iter().map(|game| LiveMatch {
        id: game.id().to_string(),
        status: MatchStatus::Completed,
        source: MatchSource::Replay,
        white: Some(game.white.clone()),
        black: Some(game.black.clone()),
    });

    let matches: Vec<LiveMatch> = live.into_iter().chain(replays).collect();
    Json(serde_json::json!({ "matches": matches }))
}

/// Summaries of ready buffer entries
async fn get_buffer(
    State(state): State<AppState>,
) -> std::result::Result<Json<serde_json::Value>, StatusCode> {
    let games: Vec<_> = state.buffer.list().await.iter().map(|g| g.summary()).collect();
    let games = serde_json::to_value(games).map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)?;
    Ok(Json(serde_json::json!({
        "capacity": state.buffer.settings().capacity,
        "games": games,
    })))
}
