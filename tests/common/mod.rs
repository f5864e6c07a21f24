//! Common test utilities for arena-relay integration tests.
//!
//! Provides a relay running on an ephemeral port over a `MemoryStore`, a
//! dial-counting wrapper around the real `WsDialer`, and a scriptable echo
//! service standing in for the internal execution pipeline.

#![allow(dead_code)]

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use arena_relay::bridge::{
    AGENT_ID_HEADER, Bridge, BridgeError, InternalDialer, InternalStream, TOKEN_HEADER, WsDialer,
    hash_connection_token,
};
use arena_relay::buffer::{BufferManager, BufferSettings};
use arena_relay::models::{AgentLink, ExecutionMode, Match, PlyState};
use arena_relay::server::{self, AppState, Shutdown, StreamSettings};
use arena_relay::storage::{GameRecordStore, MemoryStore};
use assert_cmd::Command;
use futures::future::BoxFuture;
use futures::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

pub use tempfile::TempDir;

/// Token issued to `AGENT_ID` in the seeded directory.
pub const AGENT_TOKEN: &str = "s3cret-token";
pub const AGENT_ID: &str = "agent-local";

/// Get a Command for the arena-relay binary with an isolated config dir.
pub fn relay_cmd(config_dir: &TempDir) -> Command {
    let mut cmd = Command::new(env!("CARGO_BIN_EXE_arena-relay"));
    cmd.env("XDG_CONFIG_HOME", config_dir.path());
    cmd.env("HOME", config_dir.path());
    for key in [
        "ARENA_RELAY_CONFIG",
        "ARENA_RELAY_HOST",
        "ARENA_RELAY_PORT",
        "ARENA_RELAY_LOG_FORMAT",
        "ARENA_RELAY_EXECUTION_URL",
    ] {
        cmd.env_remove(key);
    }
    cmd
}

/// Wraps `WsDialer` and counts dial attempts.
pub struct CountingDialer {
    inner: WsDialer,
    dials: AtomicUsize,
}

impl CountingDialer {
    pub fn new(url: impl Into<String>) -> Arc<Self> {
        Arc::new(Self {
            inner: WsDialer::new(url),
            dials: AtomicUsize::new(0),
        })
    }

    pub fn dials(&self) -> usize {
        self.dials.load(Ordering::SeqCst)
    }
}

impl InternalDialer for CountingDialer {
    fn dial<'a>(&'a self, agent_id: &'a str) -> BoxFuture<'a, Result<InternalStream, BridgeError>> {
        self.dials.fetch_add(1, Ordering::SeqCst);
        self.inner.dial(agent_id)
    }
}

/// A relay serving on 127.0.0.1 with in-memory state.
pub struct TestRelay {
    pub addr: SocketAddr,
    pub store: Arc<MemoryStore>,
    pub buffer: Arc<BufferManager>,
    pub dialer: Arc<CountingDialer>,
    pub bridge: Arc<Bridge>,
    pub shutdown: Shutdown,
    pub state: AppState,
    handle: JoinHandle<()>,
}

impl TestRelay {
    /// Start a relay whose bridge dials `service_url`.
    pub async fn start(store: Arc<MemoryStore>, service_url: &str, stream: StreamSettings) -> Self {
        let buffer = Arc::new(BufferManager::new(
            Arc::clone(&store) as Arc<dyn GameRecordStore>,
            BufferSettings {
                match_type: None,
                ..Default::default()
            },
        ));
        let dialer = CountingDialer::new(service_url);
        let shutdown = Shutdown::new();
        let bridge = Arc::new(Bridge::new(
            Arc::clone(&store) as _,
            Arc::clone(&dialer) as Arc<dyn InternalDialer>,
        ));
        let state = AppState {
            store: Arc::clone(&store) as Arc<dyn GameRecordStore>,
            buffer: Arc::clone(&buffer),
            bridge: Arc::clone(&bridge),
            stream,
            shutdown: shutdown.clone(),
        };

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let stop = shutdown.clone();
        let served = state.clone();
        let handle = tokio::spawn(async move {
            server::serve(listener, served, async move { stop.wait().await })
                .await
                .unwrap();
        });

        Self {
            addr,
            store,
            buffer,
            dialer,
            bridge,
            shutdown,
            state,
            handle,
        }
    }

    /// Bridges currently registered.
    pub fn active_bridges(&self) -> usize {
        self.bridge.registry().active_count()
    }

    pub fn http_url(&self) -> String {
        format!("http://{}", self.addr)
    }

    pub fn bridge_url(&self) -> String {
        format!("ws://{}/agent/connect", self.addr)
    }

    /// Trigger shutdown and wait for the server task.
    pub async fn stop(self) {
        self.shutdown.trigger();
        let _ = tokio::time::timeout(Duration::from_secs(5), self.handle).await;
    }
}

/// Stream timing fast enough for tests.
pub fn fast_streams() -> StreamSettings {
    StreamSettings {
        poll_interval: Duration::from_millis(20),
        heartbeat_interval: Duration::from_secs(30),
        idle_timeout: Duration::from_secs(30),
        replay_ply_interval: Duration::from_millis(10),
    }
}

/// Store with one local agent link for `AGENT_ID`.
pub fn store_with_agent() -> Arc<MemoryStore> {
    let store = Arc::new(MemoryStore::new());
    store.set_agent_link(AgentLink {
        agent_id: AGENT_ID.to_string(),
        token_hash: hash_connection_token(AGENT_TOKEN),
        execution_mode: ExecutionMode::Local,
        active: true,
    });
    store
}

/// Seed `count` completed matches with `plies` plies each; newest last.
pub fn seed_completed(store: &MemoryStore, count: usize, plies: u32) -> Vec<String> {
    let base = chrono::Utc::now();
    (0..count)
        .map(|i| {
            let id = format!("done-{}", i);
            store.upsert_match(Match::new(&id, "white-bot", "black-bot").complete(
                Some("white"),
                "checkmate",
                base + chrono::Duration::seconds(i as i64),
            ));
            for n in 1..=plies {
                let mut ply = PlyState::new(n, serde_json::json!(format!("board-{}", n)));
                ply.move_time_ms = Some(100);
                store.push_ply(&id, ply);
            }
            id
        })
        .collect()
}

/// Echo service: echoes every data frame; the text `close-me` makes it
/// close the connection instead.
pub struct EchoService {
    pub url: String,
    pub connections: Arc<AtomicUsize>,
    handle: JoinHandle<()>,
}

impl EchoService {
    pub async fn start() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("ws://{}/agents", listener.local_addr().unwrap());
        let connections = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&connections);

        let handle = tokio::spawn(async move {
            while let Ok((socket, _)) = listener.accept().await {
                counter.fetch_add(1, Ordering::SeqCst);
                tokio::spawn(async move {
                    let Ok(mut ws) = tokio_tungstenite::accept_async(socket).await else {
                        return;
                    };
                    while let Some(Ok(message)) = ws.next().await {
                        match &message {
                            Message::Text(text) if text.as_str() == "close-me" => {
                                let _ = ws.close(None).await;
                                // Drain until the peer acknowledges the close.
                                while let Some(Ok(_)) = ws.next().await {}
                                return;
                            }
                            Message::Text(_) | Message::Binary(_) => {
                                if ws.send(message).await.is_err() {
                                    return;
                                }
                            }
                            Message::Close(_) => return,
                            _ => {}
                        }
                    }
                });
            }
        });

        Self {
            url,
            connections,
            handle,
        }
    }

    /// A URL nothing listens on.
    pub async fn unreachable_url() -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);
        format!("ws://{}/agents", addr)
    }
}

impl Drop for EchoService {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

pub type AgentSocket = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Connect to the bridge as `agent_id` presenting `token`.
pub async fn connect_agent(
    bridge_url: &str,
    agent_id: &str,
    token: &str,
) -> Result<AgentSocket, tokio_tungstenite::tungstenite::Error> {
    let mut request = bridge_url.into_client_request()?;
    request
        .headers_mut()
        .insert(AGENT_ID_HEADER, HeaderValue::from_str(agent_id).unwrap());
    request
        .headers_mut()
        .insert(TOKEN_HEADER, HeaderValue::from_str(&format!("Bearer {}", token)).unwrap());
    let (socket, _) = tokio_tungstenite::connect_async(request).await?;
    Ok(socket)
}

/// Read the next data or close frame, skipping pings and pongs.
pub async fn next_frame(socket: &mut AgentSocket) -> Option<Message> {
    let read = async {
        loop {
            match socket.next().await {
                Some(Ok(Message::Ping(_) | Message::Pong(_))) => continue,
                Some(Ok(message)) => return Some(message),
                _ => return None,
            }
        }
    };
    tokio::time::timeout(Duration::from_secs(5), read)
        .await
        .expect("timed out waiting for a frame")
}
