//! HTTP transport for the spectator driver.

use futures::StreamExt;
use futures::future::BoxFuture;
use serde::Deserialize;

use super::driver::{ByteStream, SpectatorTransport};
use crate::models::LiveMatch;
use crate::{Error, Result};

#[derive(Debug, Deserialize)]
struct LiveResponse {
    matches: Vec<LiveMatch>,
}

/// Talks to a relay over plain HTTP.
#[derive(Debug, Clone)]
pub struct HttpTransport {
    client: reqwest::Client,
    base_url: String,
}

impl HttpTransport {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn live_url(&self) -> String {
        format!("{}/api/matches/live", self.base_url)
    }

    fn stream_url(&self, match_id: &str) -> String {
        format!("{}/api/matches/{}/stream", self.base_url, match_id)
    }
}

fn transport_error(e: reqwest::Error) -> Error {
    Error::Transport(e.to_string())
}

impl SpectatorTransport for HttpTransport {
    fn fetch_live(&self) -> BoxFuture<'_, Result<Vec<LiveMatch>>> {
        Box::pin(async move {
            let response = self
                .client
                .get(self.live_url())
                .send()
                .await
                .and_then(reqwest::Response::error_for_status)
                .map_err(transport_error)?;
            let body: LiveResponse = response.json().await.map_err(transport_error)?;
            Ok(body.matches)
        })
    }

    fn open_stream<'a>(
        &'a self,
        match_id: &'a str,
        speed: f64,
    ) -> BoxFuture<'a, Result<ByteStream>> {
        Box::pin(async move {
            let response = self
                .client
                .get(self.stream_url(match_id))
                .query(&[("speed", speed)])
                .send()
                .await
                .and_then(reqwest::Response::error_for_status)
                .map_err(transport_error)?;

            let stream: ByteStream = response
                .bytes_stream()
                .map(|chunk| chunk.map(|bytes| bytes.to_vec()).map_err(transport_error))
                .boxed();
            Ok(stream)
        })
    }
}
