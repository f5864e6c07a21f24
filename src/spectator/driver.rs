//! Async driver for [`PlaybackController`].
//!
//! The driver owns the controller and executes its effects: list fetches and
//! timers run as spawned tasks that post events back, and at most one reader
//! task decodes the NDJSON stream of the open match.

use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use futures::StreamExt;
use futures::future::BoxFuture;
use futures::stream::BoxStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};

use super::controller::{Effect, Event, LIVE_LIST_POLL, ListPurpose, PlaybackController};
use crate::Result;
use crate::models::LiveMatch;
use crate::protocol::{NdjsonDecoder, StreamMessage};

/// Spacing between rendered moves at speed 1.0
pub const PLY_PACE: Duration = Duration::from_secs(1);

/// Minimum gap between two `move`s handed to the controller at `speed`.
///
/// Non-positive or non-finite speeds fall back to normal pace.
pub fn ply_spacing(speed: f64) -> Duration {
    if !(speed.is_finite() && speed > 0.0) {
        return PLY_PACE;
    }
    Duration::try_from_secs_f64(PLY_PACE.as_secs_f64() / speed).unwrap_or(Duration::MAX)
}

/// Raw body chunks of one spectator stream.
pub type ByteStream = BoxStream<'static, Result<Vec<u8>>>;

/// How the driver reaches a relay.
pub trait SpectatorTransport: Send + Sync + 'static {
    /// Fetch the picker list.
    fn fetch_live(&self) -> BoxFuture<'_, Result<Vec<LiveMatch>>>;

    /// Open the NDJSON stream for one match.
    fn open_stream<'a>(
        &'a self,
        match_id: &'a str,
        speed: f64,
    ) -> BoxFuture<'a, Result<ByteStream>>;
}

/// Receives the controller after every batch of effects that asked to render.
pub trait PlaybackObserver: Send {
    fn render(&mut self, controller: &PlaybackController);
}

/// Reader bookkeeping shared with reader tasks.
#[derive(Debug, Default)]
pub struct DriverStats {
    live_readers: AtomicUsize,
    max_live_readers: AtomicUsize,
    streams_opened: AtomicUsize,
}

impl DriverStats {
    /// Reader tasks currently running.
    pub fn live_readers(&self) -> usize {
        self.live_readers.load(Ordering::SeqCst)
    }

    /// Highest number of reader tasks ever running at once.
    pub fn max_live_readers(&self) -> usize {
        self.max_live_readers.load(Ordering::SeqCst)
    }

    pub fn streams_opened(&self) -> usize {
        self.streams_opened.load(Ordering::SeqCst)
    }
}

/// Counts a reader task as live until dropped (including on abort).
struct ReaderGuard(Arc<DriverStats>);

impl ReaderGuard {
    fn enter(stats: Arc<DriverStats>) -> Self {
        let live = stats.live_readers.fetch_add(1, Ordering::SeqCst) + 1;
        stats.max_live_readers.fetch_max(live, Ordering::SeqCst);
        Self(stats)
    }
}

impl Drop for ReaderGuard {
    fn drop(&mut self) {
        self.0.live_readers.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Runs a [`PlaybackController`] against a transport.
pub struct SpectatorDriver<T: SpectatorTransport> {
    transport: Arc<T>,
    controller: PlaybackController,
    picker_poll: Duration,
    events_tx: mpsc::UnboundedSender<Event>,
    events_rx: mpsc::UnboundedReceiver<Event>,
    reader: Option<(u64, JoinHandle<()>)>,
    background: Vec<JoinHandle<()>>,
    stats: Arc<DriverStats>,
}

impl<T: SpectatorTransport> SpectatorDriver<T> {
    pub fn new(transport: Arc<T>, controller: PlaybackController) -> Self {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        Self {
            transport,
            controller,
            picker_poll: LIVE_LIST_POLL,
            events_tx,
            events_rx,
            reader: None,
            background: Vec::new(),
            stats: Arc::new(DriverStats::default()),
        }
    }

    /// Override the picker refresh period.
    pub fn with_picker_poll(mut self, period: Duration) -> Self {
        self.picker_poll = period;
        self
    }

    /// Sender for user commands (`SelectMatch`, `SetSpeed`, cursor moves).
    pub fn commands(&self) -> mpsc::UnboundedSender<Event> {
        self.events_tx.clone()
    }

    pub fn stats(&self) -> Arc<DriverStats> {
        Arc::clone(&self.stats)
    }

    /// Drive playback until `shutdown` resolves, then tear down every task.
    pub async fn run<O, F>(mut self, observer: &mut O, shutdown: F) -> PlaybackController
    where
        O: PlaybackObserver,
        F: Future<Output = ()>,
    {
        tokio::pin!(shutdown);

        let start = Instant::now() + self.picker_poll;
        let mut picker = tokio::time::interval_at(start, self.picker_poll);
        picker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        self.apply(Event::Start, observer).await;

        loop {
            tokio::select! {
                biased;
                _ = &mut shutdown => break,
                Some(event) = self.events_rx.recv() => self.apply(event, observer).await,
                _ = picker.tick() => {
                    let generation = self.controller.generation();
                    self.fetch(ListPurpose::Picker, generation);
                }
            }
        }

        self.stop_reader(None).await;
        for task in self.background.drain(..) {
            task.abort();
        }
        self.controller
    }

    async fn apply<O: PlaybackObserver>(&mut self, event: Event, observer: &mut O) {
        let effects = self.controller.handle(event);
        let mut render = false;

        for effect in effects {
            match effect {
                Effect::FetchLiveList {
                    purpose,
                    generation,
                } => self.fetch(purpose, generation),
                Effect::AbortReader { generation } => self.stop_reader(Some(generation)).await,
                Effect::OpenStream {
                    generation,
                    match_id,
                    speed,
                } => self.open(generation, match_id, speed).await,
                Effect::Schedule {
                    generation,
                    timer,
                    after,
                } => {
                    let tx = self.events_tx.clone();
                    self.spawn_background(async move {
                        tokio::time::sleep(after).await;
                        let _ = tx.send(Event::TimerFired { generation, timer });
                    });
                }
                Effect::Render => render = true,
            }
        }

        if render {
            observer.render(&self.controller);
        }
    }

    fn fetch(&mut self, purpose: ListPurpose, generation: u64) {
        let transport = Arc::clone(&self.transport);
        let tx = self.events_tx.clone();
        self.spawn_background(async move {
            let event = match transport.fetch_live().await {
                Ok(matches) => Event::LiveListLoaded {
                    purpose,
                    generation,
                    matches,
                },
                Err(e) => Event::LiveListFailed {
                    purpose,
                    generation,
                    reason: e.to_string(),
                },
            };
            let _ = tx.send(event);
        });
    }

    fn spawn_background<Fut>(&mut self, task: Fut)
    where
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.background.retain(|handle| !handle.is_finished());
        self.background.push(tokio::spawn(task));
    }

    /// Abort the reader (only if it belongs to `generation`, when given) and
    /// wait until it has exited.
    async fn stop_reader(&mut self, generation: Option<u64>) {
        let matches = match (&self.reader, generation) {
            (Some((open, _)), Some(wanted)) => *open == wanted,
            (Some(_), None) => true,
            (None, _) => false,
        };
        if !matches {
            return;
        }
        if let Some((generation, handle)) = self.reader.take() {
            handle.abort();
            let _ = handle.await;
            tracing::debug!(generation, "reader stopped");
        }
    }

    async fn open(&mut self, generation: u64, match_id: String, speed: f64) {
        // The controller aborts first; this covers a reader it no longer tracks.
        self.stop_reader(None).await;

        self.stats.streams_opened.fetch_add(1, Ordering::SeqCst);
        let guard = ReaderGuard::enter(Arc::clone(&self.stats));
        let transport = Arc::clone(&self.transport);
        let tx = self.events_tx.clone();

        tracing::debug!(generation, match_id = %match_id, speed, "opening stream");
        let handle = tokio::spawn(async move {
            let _guard = guard;
            read_stream(transport.as_ref(), generation, &match_id, speed, &tx).await;
        });
        self.reader = Some((generation, handle));
    }
}

async fn read_stream<T: SpectatorTransport>(
    transport: &T,
    generation: u64,
    match_id: &str,
    speed: f64,
    tx: &mpsc::UnboundedSender<Event>,
) {
    let mut stream = match transport.open_stream(match_id, speed).await {
        Ok(stream) => stream,
        Err(e) => {
            let _ = tx.send(Event::StreamFailed {
                generation,
                reason: e.to_string(),
            });
            return;
        }
    };

    let spacing = ply_spacing(speed);
    let mut next_move_at: Option<Instant> = None;
    let mut decoder = NdjsonDecoder::new();
    while let Some(chunk) = stream.next().await {
        match chunk {
            Ok(bytes) => {
                for message in decoder.push(&bytes) {
                    // Moves that arrive in a burst are handed over `spacing` apart.
                    if matches!(message, StreamMessage::Move { .. }) {
                        if let Some(at) = next_move_at {
                            tokio::time::sleep_until(at).await;
                        }
                        next_move_at = Some(Instant::now() + spacing);
                    }
                    if tx.send(Event::StreamMessage { generation, message }).is_err() {
                        return;
                    }
                }
            }
            Err(e) => {
                let _ = tx.send(Event::StreamFailed {
                    generation,
                    reason: e.to_string(),
                });
                return;
            }
        }
    }

    if let Some(message) = decoder.finish() {
        let _ = tx.send(Event::StreamMessage { generation, message });
    }
    if decoder.skipped_lines() > 0 {
        tracing::warn!(
            generation,
            skipped = decoder.skipped_lines(),
            "skipped malformed stream lines"
        );
    }
    let _ = tx.send(Event::StreamEnded { generation });
}
