//! Per-connection spectator stream.
//!
//! Each request to `/api/matches/:match_id/stream` gets its own task that
//! produces `StreamMessage`s into a bounded channel; the response body drains
//! that channel as NDJSON. Dropping the body (client gone) closes the channel
//! and the task exits at its next suspension point.

use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;

use axum::{
    body::Body,
    extract::{Path, Query, State},
    http::{StatusCode, header},
    response::{IntoResponse, Response},
};
use serde::Deserialize;
use tokio::sync::mpsc;
use tokio::time::{Instant, MissedTickBehavior, interval_at};

use super::{AppState, Shutdown};
use crate::Result;
use crate::buffer::{BufferManager, BufferedGame};
use crate::models::{Match, MatchStatus, PlyState};
use crate::protocol::{NDJSON_CONTENT_TYPE, StreamMessage, encode_line};
use crate::storage::{self, GameRecordStore};

/// Interval between store polls for live matches
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(500);

/// Interval between heartbeats
pub const DEFAULT_HEARTBEAT_INTERVAL: Duration = Duration::from_secs(15);

/// A live match with no new ply for this long ends with `timeout`
pub const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(60);

/// Spacing between plies on the replay timeline
pub const DEFAULT_REPLAY_PLY_INTERVAL: Duration = Duration::from_secs(1);

/// Messages queued per connection before the producer waits for the client
pub const CHANNEL_CAPACITY: usize = 16;

/// Stream timing.
#[derive(Debug, Clone, Copy)]
pub struct StreamSettings {
    pub poll_interval: Duration,
    pub heartbeat_interval: Duration,
    pub idle_timeout: Duration,
    pub replay_ply_interval: Duration,
}

impl Default for StreamSettings {
    fn default() -> Self {
        Self {
            poll_interval: DEFAULT_POLL_INTERVAL,
            heartbeat_interval: DEFAULT_HEARTBEAT_INTERVAL,
            idle_timeout: DEFAULT_IDLE_TIMEOUT,
            replay_ply_interval: DEFAULT_REPLAY_PLY_INTERVAL,
        }
    }
}

/// Everything a stream task needs, detached from the router state.
#[derive(Clone)]
pub struct StreamContext {
    pub store: Arc<dyn GameRecordStore>,
    pub buffer: Arc<BufferManager>,
    pub settings: StreamSettings,
    pub shutdown: Shutdown,
}

/// Where a stream's plies come from.
#[derive(Debug, Clone)]
pub enum StreamSource {
    /// A buffered completed game on the shared replay clock
    Replay(Arc<BufferedGame>),
    /// A match read from the record store on every tick
    Stored(Match),
}

impl StreamSource {
    fn kind(&self) -> &'static str {
        match self {
            StreamSource::Replay(_) => "replay",
            StreamSource::Stored(m) if m.status.is_live() => "live",
            StreamSource::Stored(_) => "stored",
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct StreamQuery {
    #[serde(default = "default_speed")]
    pub speed: f64,
}

fn default_speed() -> f64 {
    1.0
}

/// `GET /api/matches/:match_id/stream`
pub async fn stream_handler(
    State(state): State<AppState>,
    Path(match_id): Path<String>,
    Query(query): Query<StreamQuery>,
) -> Response {
    let ctx = state.stream_context();
    let source = match resolve_source(&ctx, &match_id).await {
        Ok(Some(source)) => source,
        Ok(None) => return StatusCode::NOT_FOUND.into_response(),
        Err(e) => {
            tracing::warn!(match_id = %match_id, error = %e, "could not resolve stream source");
            return StatusCode::SERVICE_UNAVAILABLE.into_response();
        }
    };

    // Playback speed is a client-side concern; it is only recorded here.
    tracing::debug!(
        match_id = %match_id,
        speed = query.speed,
        source = source.kind(),
        "spectator attached"
    );

    let rx = spawn_stream(ctx, match_id, source);
    let lines = futures::stream::unfold(rx, |mut rx| async move {
        let message = rx.recv().await?;
        let line = encode_line(&message).unwrap_or_else(|e| {
            tracing::warn!(error = %e, "failed to encode stream message");
            String::new()
        });
        Some((Ok::<_, Infallible>(line), rx))
    });

    (
        [
            (header::CONTENT_TYPE, NDJSON_CONTENT_TYPE),
            (header::CACHE_CONTROL, "no-cache"),
        ],
        Body::from_stream(lines),
    )
        .into_response()
}

/// Pick the source for `match_id`: a ready buffered game first, then the store.
pub async fn resolve_source(ctx: &StreamContext, match_id: &str) -> Result<Option<StreamSource>> {
    if let Some(game) = ctx.buffer.get(match_id).await {
        return Ok(Some(StreamSource::Replay(game)));
    }

    let store = Arc::clone(&ctx.store);
    let id = match_id.to_string();
    let found = storage::blocking(move || store.get_match(&id)).await?;
    Ok(found.map(StreamSource::Stored))
}

/// Spawn the producer task and return the receiving end of its channel.
pub fn spawn_stream(
    ctx: StreamContext,
    match_id: String,
    source: StreamSource,
) -> mpsc::Receiver<StreamMessage> {
    let (tx, rx) = mpsc::channel(CHANNEL_CAPACITY);
    tokio::spawn(run_stream(ctx, match_id, source, tx));
    rx
}

/// Result of one poll of the ply source.
struct FeedUpdate {
    plies: Vec<PlyState>,
    terminal: Option<StreamMessage>,
}

fn completed_message(m: &Match) -> StreamMessage {
    StreamMessage::Completed {
        winner: m.winner.clone(),
        termination: m.termination.clone(),
    }
}

async fn poll_source(
    ctx: &StreamContext,
    source: &StreamSource,
    match_id: &str,
    after: u32,
) -> Result<FeedUpdate> {
    match source {
        StreamSource::Replay(game) => {
            let released = game.released_plies(Instant::now(), ctx.settings.replay_ply_interval);
            let plies = game.plies[..released]
                .iter()
                .filter(|p| p.move_number > after)
                .cloned()
                .collect();
            let terminal = (released == game.plies.len()).then(|| completed_message(&game.game));
            Ok(FeedUpdate { plies, terminal })
        }
        StreamSource::Stored(_) => {
            let store = Arc::clone(&ctx.store);
            let id = match_id.to_string();
            let (current, plies) = storage::blocking(move || {
                let current = store.get_match(&id)?;
                let plies = store.plies_after(&id, after)?;
                Ok((current, plies))
            })
            .await?;

            let terminal = match current {
                Some(m) if m.status == MatchStatus::Completed => Some(completed_message(&m)),
                Some(m) if m.status.is_live() => None,
                // Errored, or removed by the pipeline mid-stream.
                _ => Some(StreamMessage::Timeout),
            };
            Ok(FeedUpdate { plies, terminal })
        }
    }
}

/// Send one message, waiting for room. `false` means the client is gone.
async fn emit(tx: &mpsc::Sender<StreamMessage>, message: StreamMessage) -> bool {
    tx.send(message).await.is_ok()
}

/// Produce the full message sequence for one spectator.
pub async fn run_stream(
    ctx: StreamContext,
    match_id: String,
    source: StreamSource,
    tx: mpsc::Sender<StreamMessage>,
) {
    let settings = ctx.settings;
    if !emit(&tx, StreamMessage::Connected { match_id: match_id.clone() }).await {
        return;
    }

    let start = Instant::now();
    let mut ticker = interval_at(start + settings.poll_interval, settings.poll_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut heartbeat = interval_at(
        start + settings.heartbeat_interval,
        settings.heartbeat_interval,
    );
    heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);

    let mut initial_sent = false;
    let mut last_sent = 0u32;
    let mut last_progress = start;

    loop {
        match poll_source(&ctx, &source, &match_id, last_sent).await {
            Ok(update) => {
                if !update.plies.is_empty() {
                    last_progress = Instant::now();
                }

                if !initial_sent {
                    last_sent = update.plies.last().map_or(last_sent, |p| p.move_number);
                    if !emit(&tx, StreamMessage::Initial { plies: update.plies }).await {
                        return;
                    }
                    initial_sent = true;
                } else {
                    for ply in update.plies {
                        if ply.move_number <= last_sent {
                            continue;
                        }
                        last_sent = ply.move_number;
                        if !emit(&tx, StreamMessage::Move { ply }).await {
                            return;
                        }
                    }
                }

                if let Some(terminal) = update.terminal {
                    let kind = terminal.kind();
                    if emit(&tx, terminal).await {
                        if let StreamSource::Replay(game) = &source {
                            ctx.buffer.mark_completed(game.id()).await;
                        }
                        tracing::debug!(match_id = %match_id, kind, last_sent, "stream finished");
                    }
                    return;
                }
            }
            Err(e) => {
                tracing::warn!(match_id = %match_id, error = %e, "stream poll failed, retrying");
            }
        }

        let idle = last_progress.elapsed() >= settings.idle_timeout;
        if matches!(source, StreamSource::Stored(_)) && idle {
            tracing::info!(match_id = %match_id, last_sent, "no progress, timing out stream");
            // The store never answered: `initial` still has to precede the terminal.
            if !initial_sent && !emit(&tx, StreamMessage::Initial { plies: Vec::new() }).await {
                return;
            }
            emit(&tx, StreamMessage::Timeout).await;
            return;
        }

        loop {
            tokio::select! {
                biased;
                _ = tx.closed() => {
                    tracing::debug!(match_id = %match_id, "spectator disconnected");
                    return;
                }
                // No terminal message: the client treats this as a dropped connection.
                _ = ctx.shutdown.wait() => return,
                _ = ticker.tick() => break,
                _ = heartbeat.tick() => {
                    if !emit(&tx, StreamMessage::Heartbeat).await {
                        return;
                    }
                }
            }
        }
    }
}
