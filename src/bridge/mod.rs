//! Authenticated duplex bridge for locally-executed agents.
//!
//! An agent running on a participant's machine connects to
//! `GET /agent/connect` with its id and connection token. The upgrade is
//! only accepted after the token checks out and the internal execution
//! service has been dialed; from then on frames are forwarded verbatim in
//! both directions until either side goes away.
//!
//! Every rejection looks the same from outside: `403` with an empty body,
//! sent before any upgrade and before anything is dialed.

pub mod auth;
pub mod dialer;
pub mod registry;

pub use auth::{AGENT_ID_HEADER, TOKEN_HEADER, hash_connection_token};
pub use dialer::{InternalDialer, InternalStream, WsDialer};
pub use registry::{BridgeLease, BridgeRegistry};

use std::sync::Arc;

use axum::{
    extract::{
        State,
        ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade},
    },
    http::{HeaderMap, StatusCode, header},
    response::{IntoResponse, Response},
};
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use tokio_tungstenite::tungstenite;
use tokio_tungstenite::tungstenite::protocol::CloseFrame as InternalCloseFrame;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;

use crate::models::AgentLink;
use crate::server::{AppState, Shutdown};
use crate::storage::{self, AgentDirectory};

/// Fixed path of the bridge endpoint.
pub const CONNECT_PATH: &str = "/agent/connect";

/// Bridge failures after authentication.
#[derive(Debug, thiserror::Error)]
pub enum BridgeError {
    #[error("dial failed: {0}")]
    Dial(String),

    #[error("agent socket error: {0}")]
    External(#[from] axum::Error),

    #[error("execution service socket error: {0}")]
    Internal(#[from] tungstenite::Error),
}

/// Gatekeeper and session owner for agent bridges.
pub struct Bridge {
    directory: Arc<dyn AgentDirectory>,
    dialer: Arc<dyn InternalDialer>,
    registry: BridgeRegistry,
}

impl Bridge {
    pub fn new(directory: Arc<dyn AgentDirectory>, dialer: Arc<dyn InternalDialer>) -> Self {
        Self {
            directory,
            dialer,
            registry: BridgeRegistry::new(),
        }
    }

    pub fn registry(&self) -> &BridgeRegistry {
        &self.registry
    }

    /// Check the upgrade request's credentials against the agent directory.
    ///
    /// Every failure, including a directory error, is the same `403`.
    pub async fn authorize(&self, headers: &HeaderMap) -> Result<AgentLink, StatusCode> {
        let Some(credentials) = auth::credentials(headers) else {
            tracing::debug!("bridge upgrade rejected");
            return Err(StatusCode::FORBIDDEN);
        };

        let directory = Arc::clone(&self.directory);
        let agent_id = credentials.agent_id.clone();
        let link = match storage::blocking(move || directory.agent_link(&agent_id)).await {
            Ok(link) => link,
            Err(e) => {
                tracing::warn!(error = %e, "agent directory lookup failed");
                None
            }
        };

        match link {
            Some(link) if auth::link_admits(&link, &credentials) => Ok(link),
            _ => {
                tracing::debug!("bridge upgrade rejected");
                Err(StatusCode::FORBIDDEN)
            }
        }
    }
}

fn reject(status: StatusCode) -> Response {
    // Ask hyper to drop the connection once the response is written.
    (status, [(header::CONNECTION, "close")]).into_response()
}

/// `GET /agent/connect`
pub async fn connect_handler(
    State(state): State<AppState>,
    headers: HeaderMap,
    ws: Option<WebSocketUpgrade>,
) -> Response {
    let bridge = Arc::clone(&state.bridge);
    let link = match bridge.authorize(&headers).await {
        Ok(link) => link,
        Err(status) => return reject(status),
    };
    let Some(ws) = ws else {
        return reject(StatusCode::BAD_REQUEST);
    };

    let agent_id = link.agent_id;
    let internal = match bridge.dialer.dial(&agent_id).await {
        Ok(stream) => stream,
        Err(e) => {
            tracing::warn!(agent_id = %agent_id, error = %e, "could not reach execution service");
            return reject(StatusCode::BAD_GATEWAY);
        }
    };

    let registry = bridge.registry.clone();
    let shutdown = state.shutdown.clone();
    let failed_for = agent_id.clone();
    ws.on_failed_upgrade(move |e| {
        tracing::debug!(agent_id = %failed_for, error = %e, "bridge upgrade failed");
    })
    .on_upgrade(move |socket| async move {
        // The slot is only claimed once the agent socket exists.
        let lease = registry.register(&agent_id);
        tracing::info!(agent_id = %agent_id, session = %lease.session_id(), "bridge opened");
        splice(socket, internal, lease, shutdown).await;
    })
}

/// Why a splice ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SpliceEnd {
    AgentClosed,
    ServiceClosed,
    Replaced,
    Shutdown,
}

impl SpliceEnd {
    fn as_str(&self) -> &'static str {
        match self {
            SpliceEnd::AgentClosed => "agent_closed",
            SpliceEnd::ServiceClosed => "service_closed",
            SpliceEnd::Replaced => "replaced",
            SpliceEnd::Shutdown => "shutdown",
        }
    }
}

/// Forward frames in both directions until either side ends.
async fn splice(
    external: WebSocket,
    internal: InternalStream,
    lease: BridgeLease,
    shutdown: Shutdown,
) {
    let (mut ext_tx, mut ext_rx) = external.split();
    let (mut int_tx, mut int_rx) = internal.split();

    let ended = tokio::select! {
        r = agent_to_service(&mut ext_rx, &mut int_tx) => r,
        r = service_to_agent(&mut int_rx, &mut ext_tx) => r,
        _ = lease.replaced() => Ok(SpliceEnd::Replaced),
        _ = shutdown.wait() => Ok(SpliceEnd::Shutdown),
    };

    match ended {
        Ok(reason) => tracing::info!(
            agent_id = lease.agent_id(),
            session = %lease.session_id(),
            reason = reason.as_str(),
            "bridge closed"
        ),
        Err(e) => tracing::info!(
            agent_id = lease.agent_id(),
            session = %lease.session_id(),
            error = %e,
            "bridge closed"
        ),
    }

    // Either side may already be closed; the other still gets a close frame.
    let _ = ext_tx.close().await;
    let _ = int_tx.close().await;
}

async fn agent_to_service(
    from: &mut SplitStream<WebSocket>,
    to: &mut SplitSink<InternalStream, tungstenite::Message>,
) -> Result<SpliceEnd, BridgeError> {
    while let Some(message) = from.next().await {
        let message = message?;
        let closing = matches!(message, Message::Close(_));
        to.send(to_internal(message)).await?;
        if closing {
            break;
        }
    }
    Ok(SpliceEnd::AgentClosed)
}

async fn service_to_agent(
    from: &mut SplitStream<InternalStream>,
    to: &mut SplitSink<WebSocket, Message>,
) -> Result<SpliceEnd, BridgeError> {
    while let Some(message) = from.next().await {
        let Some(message) = to_external(message?) else {
            continue;
        };
        let closing = matches!(message, Message::Close(_));
        to.send(message).await?;
        if closing {
            break;
        }
    }
    Ok(SpliceEnd::ServiceClosed)
}

fn to_internal(message: Message) -> tungstenite::Message {
    match message {
        Message::Text(text) => tungstenite::Message::Text(text),
        Message::Binary(data) => tungstenite::Message::Binary(data),
        Message::Ping(data) => tungstenite::Message::Ping(data),
        Message::Pong(data) => tungstenite::Message::Pong(data),
        Message::Close(frame) => tungstenite::Message::Close(frame.map(|f| InternalCloseFrame {
            code: CloseCode::from(f.code),
            reason: f.reason,
        })),
    }
}

/// Raw frames never surface from a read; they have no agent-side equivalent.
fn to_external(message: tungstenite::Message) -> Option<Message> {
    Some(match message {
        tungstenite::Message::Text(text) => Message::Text(text),
        tungstenite::Message::Binary(data) => Message::Binary(data),
        tungstenite::Message::Ping(data) => Message::Ping(data),
        tungstenite::Message::Pong(data) => Message::Pong(data),
        tungstenite::Message::Close(frame) => Message::Close(frame.map(|f| CloseFrame {
            code: u16::from(f.code),
            reason: f.reason,
        })),
        tungstenite::Message::Frame(_) => return None,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::ExecutionMode;
    use crate::storage::MemoryStore;
    use axum::http::HeaderValue;
    use futures::future::BoxFuture;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct NeverDialer {
        calls: AtomicUsize,
    }

    impl InternalDialer for NeverDialer {
        fn dial<'a>(
            &'a self,
            _agent_id: &'a str,
        ) -> BoxFuture<'a, Result<InternalStream, BridgeError>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Box::pin(async { Err(BridgeError::Dial("not in tests".to_string())) })
        }
    }

    fn bridge(store: Arc<MemoryStore>) -> Bridge {
        Bridge::new(
            store,
            Arc::new(NeverDialer {
                calls: AtomicUsize::new(0),
            }),
        )
    }

    fn headers(agent: &str, token: &str) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(AGENT_ID_HEADER, HeaderValue::from_str(agent).unwrap());
        headers.insert(TOKEN_HEADER, HeaderValue::from_str(token).unwrap());
        headers
    }

    fn store_with_link(active: bool, mode: ExecutionMode) -> Arc<MemoryStore> {
        let store = Arc::new(MemoryStore::new());
        store.set_agent_link(AgentLink {
            agent_id: "agent-1".to_string(),
            token_hash: hash_connection_token("secret"),
            execution_mode: mode,
            active,
        });
        store
    }

    #[tokio::test]
    async fn test_authorize_accepts_valid_token() {
        let bridge = bridge(store_with_link(true, ExecutionMode::Local));
        let link = bridge.authorize(&headers("agent-1", "Bearer secret")).await.unwrap();
        assert_eq!(link.agent_id, "agent-1");
    }

    #[tokio::test]
    async fn test_authorize_rejects_everything_else_with_403() {
        let cases = [
            (store_with_link(true, ExecutionMode::Local), headers("agent-1", "garbage")),
            (store_with_link(true, ExecutionMode::Local), headers("agent-2", "secret")),
            (store_with_link(false, ExecutionMode::Local), headers("agent-1", "secret")),
            (store_with_link(true, ExecutionMode::Server), headers("agent-1", "secret")),
            (store_with_link(true, ExecutionMode::Local), HeaderMap::new()),
        ];
        for (store, headers) in cases {
            let bridge = bridge(store);
            assert_eq!(bridge.authorize(&headers).await.unwrap_err(), StatusCode::FORBIDDEN);
        }
    }

    #[tokio::test]
    async fn test_directory_failure_is_403() {
        let store = store_with_link(true, ExecutionMode::Local);
        store.set_failing(true);
        let bridge = bridge(store);
        assert_eq!(
            bridge.authorize(&headers("agent-1", "secret")).await.unwrap_err(),
            StatusCode::FORBIDDEN
        );
    }

    #[test]
    fn test_close_frames_convert_both_ways() {
        let external = Message::Close(Some(CloseFrame {
            code: 1000,
            reason: "bye".into(),
        }));
        let internal = to_internal(external);
        match &internal {
            tungstenite::Message::Close(Some(frame)) => {
                assert_eq!(frame.code, CloseCode::Normal);
                assert_eq!(frame.reason, "bye");
            }
            other => panic!("unexpected {:?}", other),
        }
        match to_external(internal) {
            Some(Message::Close(Some(frame))) => assert_eq!(frame.code, 1000),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_data_frames_pass_through() {
        assert_eq!(
            to_internal(Message::Text("hi".to_string())),
            tungstenite::Message::Text("hi".to_string())
        );
        assert!(matches!(
            to_external(tungstenite::Message::Binary(vec![1, 2])),
            Some(Message::Binary(data)) if data == vec![1, 2]
        ));
    }
}
