//! Outbound connection to the internal execution service.

use futures::future::BoxFuture;
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};

use super::BridgeError;
use super::auth::AGENT_ID_HEADER;

/// WebSocket connection to the execution service.
pub type InternalStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Opens the internal half of a bridge.
pub trait InternalDialer: Send + Sync {
    fn dial<'a>(&'a self, agent_id: &'a str) -> BoxFuture<'a, Result<InternalStream, BridgeError>>;
}

/// Dials a fixed WebSocket URL, identifying the agent with `x-agent-id`.
#[derive(Debug, Clone)]
pub struct WsDialer {
    url: String,
}

impl WsDialer {
    pub fn new(url: impl Into<String>) -> Self {
        Self { url: url.into() }
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

impl InternalDialer for WsDialer {
    fn dial<'a>(&'a self, agent_id: &'a str) -> BoxFuture<'a, Result<InternalStream, BridgeError>> {
        Box::pin(async move {
            let mut request = self.url.as_str().into_client_request().map_err(|e| {
                BridgeError::Dial(format!("invalid execution URL {}: {}", self.url, e))
            })?;
            let value = HeaderValue::from_str(agent_id)
                .map_err(|e| BridgeError::Dial(format!("invalid agent id header: {}", e)))?;
            request.headers_mut().insert(AGENT_ID_HEADER, value);

            let (stream, _response) = connect_async(request)
                .await
                .map_err(|e| BridgeError::Dial(format!("{}: {}", self.url, e)))?;
            Ok(stream)
        })
    }
}
