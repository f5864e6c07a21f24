//! Buffer of recently completed games ready to be streamed.
//!
//! The buffer keeps up to `capacity` completed matches resident in memory so
//! many spectators can attach without re-querying storage, and so a short
//! storage outage does not interrupt viewers of games already buffered.
//!
//! # Lifecycle
//!
//! - `fill()` evicts entries flagged completed, then tops the buffer up from
//!   the record store (newest completions first).
//! - The stream handler calls `mark_completed()` once it has delivered the
//!   final message of a replay; the entry is evicted on the next `fill()`.
//! - Evicted ids are remembered so they are not buffered again. Only the
//!   most recent `RETIRED_LIMIT` are kept.
//!
//! Readers get an `Arc<BufferedGame>`, so eviction never pulls a game out from
//! under a stream that is already attached.

use std::collections::{HashSet, VecDeque};
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::{Mutex, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};

use crate::models::{AgentProfile, Match, PlyState};
use crate::Result;
use crate::storage::{self, GameRecordStore};

/// Maximum number of buffered games
pub const DEFAULT_CAPACITY: usize = 8;

/// Interval between background fills
pub const DEFAULT_POLL_PERIOD: Duration = Duration::from_secs(5);

/// Evicted ids remembered for de-duplication, oldest forgotten first
pub const RETIRED_LIMIT: usize = 512;

/// Buffer tuning.
#[derive(Debug, Clone)]
pub struct BufferSettings {
    pub capacity: usize,
    pub poll_period: Duration,
    /// Only completed matches of this type are buffered (`None` = any)
    pub match_type: Option<String>,
}

impl Default for BufferSettings {
    fn default() -> Self {
        Self {
            capacity: DEFAULT_CAPACITY,
            poll_period: DEFAULT_POLL_PERIOD,
            match_type: Some("ranked".to_string()),
        }
    }
}

/// Buffer lifecycle of an entry. Never persisted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BufferStatus {
    Ready,
    Completed,
}

/// A completed match with its full history, snapshotted at buffering time.
#[derive(Debug)]
pub struct BufferedGame {
    pub game: Match,
    /// Strictly increasing by `move_number`
    pub plies: Vec<PlyState>,
    pub white: AgentProfile,
    pub black: AgentProfile,
    pub buffered_at: DateTime<Utc>,
    /// Shared replay clock, started by the first viewer
    replay_started: OnceLock<Instant>,
}

impl BufferedGame {
    pub fn new(
        game: Match,
        mut plies: Vec<PlyState>,
        white: AgentProfile,
        black: AgentProfile,
    ) -> Self {
        plies.sort_by_key(|p| p.move_number);
        plies.dedup_by_key(|p| p.move_number);
        Self {
            game,
            plies,
            white,
            black,
            buffered_at: Utc::now(),
            replay_started: OnceLock::new(),
        }
    }

    pub fn id(&self) -> &str {
        &self.game.id
    }

    /// Number of plies released on the shared replay timeline at `now`.
    ///
    /// The clock starts on the first call. Ply 1 is released immediately and
    /// each later ply `interval` after the previous one, so every viewer sees
    /// the same position regardless of when they attached.
    pub fn released_plies(&self, now: Instant, interval: Duration) -> usize {
        if self.plies.is_empty() {
            return 0;
        }
        let started = *self.replay_started.get_or_init(|| now);
        let elapsed = now.saturating_duration_since(started);
        let steps = elapsed.as_millis() / interval.as_millis().max(1);
        let released = usize::try_from(steps).unwrap_or(usize::MAX).saturating_add(1);
        released.min(self.plies.len())
    }

    /// Picker/API view of this game.
    pub fn summary(&self) -> BufferedGameSummary {
        BufferedGameSummary {
            id: self.game.id.clone(),
            white: self.white.clone(),
            black: self.black.clone(),
            plies: self.plies.len(),
            winner: self.game.winner.clone(),
            termination: self.game.termination.clone(),
            completed_at: self.game.completed_at,
            buffered_at: self.buffered_at,
        }
    }
}

/// Serializable summary of a buffered game.
#[derive(Debug, Clone, Serialize)]
pub struct BufferedGameSummary {
    pub id: String,
    pub white: AgentProfile,
    pub black: AgentProfile,
    pub plies: usize,
    pub winner: Option<String>,
    pub termination: Option<String>,
    pub completed_at: Option<DateTime<Utc>>,
    pub buffered_at: DateTime<Utc>,
}

/// What a `fill()` call did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FillOutcome {
    /// The store was queried and `added` games were appended
    Filled { added: usize, evicted: usize },
    /// No free slots after eviction; the store was not queried
    Full { evicted: usize },
    /// Another fill was already running
    Skipped,
    /// The store query failed; nothing was appended
    Failed { evicted: usize },
}

struct BufferEntry {
    game: Arc<BufferedGame>,
    status: BufferStatus,
}

#[derive(Default)]
struct BufferState {
    entries: Vec<BufferEntry>,
    /// Ids evicted after being served
    retired: HashSet<String>,
    /// `retired` in eviction order
    retired_order: VecDeque<String>,
}

impl BufferState {
    fn evict_completed(&mut self) -> usize {
        let (done, kept): (Vec<_>, Vec<_>) = std::mem::take(&mut self.entries)
            .into_iter()
            .partition(|entry| entry.status == BufferStatus::Completed);
        self.entries = kept;
        for entry in &done {
            self.retire(entry.game.id());
        }
        done.len()
    }

    fn retire(&mut self, match_id: &str) {
        if !self.retired.insert(match_id.to_string()) {
            return;
        }
        self.retired_order.push_back(match_id.to_string());
        while self.retired_order.len() > RETIRED_LIMIT {
            if let Some(oldest) = self.retired_order.pop_front() {
                self.retired.remove(&oldest);
            }
        }
    }

    fn known_ids(&self) -> HashSet<String> {
        self.entries
            .iter()
            .map(|e| e.game.id().to_string())
            .chain(self.retired.iter().cloned())
            .collect()
    }

    fn contains(&self, match_id: &str) -> bool {
        self.entries.iter().any(|e| e.game.id() == match_id)
    }

    /// Append loaded games, re-checking capacity and duplicates.
    fn admit(&mut self, games: Vec<BufferedGame>, capacity: usize) -> usize {
        let mut added = 0;
        for game in games {
            if self.entries.len() >= capacity {
                break;
            }
            if self.contains(game.id()) || self.retired.contains(game.id()) {
                continue;
            }
            self.entries.push(BufferEntry {
                game: Arc::new(game),
                status: BufferStatus::Ready,
            });
            added += 1;
        }
        added
    }
}

/// Owner of the completed-game buffer.
pub struct BufferManager {
    store: Arc<dyn GameRecordStore>,
    settings: BufferSettings,
    state: Mutex<BufferState>,
    /// Held for the duration of a fill; `try_lock` failure means overlap
    filling: Mutex<()>,
}

impl BufferManager {
    pub fn new(store: Arc<dyn GameRecordStore>, settings: BufferSettings) -> Self {
        Self {
            store,
            settings,
            state: Mutex::new(BufferState::default()),
            filling: Mutex::new(()),
        }
    }

    pub fn settings(&self) -> &BufferSettings {
        &self.settings
    }

    /// Evict completed entries and top the buffer up from the store.
    ///
    /// Never fails: store errors are logged and leave the ready entries as
    /// they were.
    pub async fn fill(&self) -> FillOutcome {
        let Ok(_filling) = self.filling.try_lock() else {
            tracing::debug!("buffer fill already running, skipping");
            return FillOutcome::Skipped;
        };

        let (slots, exclude, evicted) = {
            let mut state = self.state.lock().await;
            let evicted = state.evict_completed();
            let slots = self.settings.capacity.saturating_sub(state.entries.len());
            if slots == 0 {
                return FillOutcome::Full { evicted };
            }
            (slots, state.known_ids(), evicted)
        };

        match self.load(slots, exclude).await {
            Ok(games) => {
                let mut state = self.state.lock().await;
                let added = state.admit(games, self.settings.capacity);
                if added > 0 || evicted > 0 {
                    tracing::info!(added, evicted, size = state.entries.len(), "buffer refreshed");
                }
                FillOutcome::Filled { added, evicted }
            }
            Err(e) => {
                tracing::warn!(error = %e, "buffer fill failed, keeping current entries");
                FillOutcome::Failed { evicted }
            }
        }
    }

    async fn load(&self, slots: usize, exclude: HashSet<String>) -> Result<Vec<BufferedGame>> {
        let store = Arc::clone(&self.store);
        let match_type = self.settings.match_type.clone();
        storage::blocking(move || {
            load_games(store.as_ref(), match_type.as_deref(), &exclude, slots)
        })
        .await
    }

    /// All entries that are ready to stream.
    pub async fn list(&self) -> Vec<Arc<BufferedGame>> {
        let state = self.state.lock().await;
        state
            .entries
            .iter()
            .filter(|e| e.status == BufferStatus::Ready)
            .map(|e| Arc::clone(&e.game))
            .collect()
    }

    /// Look up a ready entry.
    pub async fn get(&self, match_id: &str) -> Option<Arc<BufferedGame>> {
        let state = self.state.lock().await;
        state
            .entries
            .iter()
            .find(|e| e.game.id() == match_id && e.status == BufferStatus::Ready)
            .map(|e| Arc::clone(&e.game))
    }

    /// Flag an entry for eviction on the next fill.
    ///
    /// Returns `true` if a ready entry was flagged.
    pub async fn mark_completed(&self, match_id: &str) -> bool {
        let mut state = self.state.lock().await;
        match state
            .entries
            .iter_mut()
            .find(|e| e.game.id() == match_id && e.status == BufferStatus::Ready)
        {
            Some(entry) => {
                entry.status = BufferStatus::Completed;
                tracing::debug!(match_id, "buffered game marked completed");
                true
            }
            None => false,
        }
    }

    /// Number of resident entries, ready or completed.
    pub async fn len(&self) -> usize {
        self.state.lock().await.entries.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Start the background poller.
    ///
    /// Fills once immediately, then every `poll_period`. Ticks that fire while
    /// a fill is still running are dropped, not queued.
    pub fn start(self: &Arc<Self>) -> PollerHandle {
        let manager = Arc::clone(self);
        let (stop_tx, mut stop_rx) = oneshot::channel();
        let period = self.settings.poll_period;

        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            tracing::info!(period_ms = period.as_millis() as u64, "buffer poller started");

            loop {
                tokio::select! {
                    _ = &mut stop_rx => break,
                    _ = ticker.tick() => {
                        manager.fill().await;
                    }
                }
            }

            tracing::info!("buffer poller stopped");
        });

        PollerHandle {
            stop_tx: Some(stop_tx),
            task,
        }
    }
}

fn load_games(
    store: &dyn GameRecordStore,
    match_type: Option<&str>,
    exclude: &HashSet<String>,
    slots: usize,
) -> Result<Vec<BufferedGame>> {
    let matches = store.recent_completed(match_type, exclude, slots)?;
    let mut games = Vec::with_capacity(matches.len());
    for m in matches {
        let plies = store.plies_after(&m.id, 0)?;
        let white = store
            .agent_profile(&m.white_agent_id)?
            .unwrap_or_else(|| AgentProfile::unknown(&m.white_agent_id));
        let black = store
            .agent_profile(&m.black_agent_id)?
            .unwrap_or_else(|| AgentProfile::unknown(&m.black_agent_id));
        games.push(BufferedGame::new(m, plies, white, black));
    }
    Ok(games)
}

/// Handle to the running poller.
pub struct PollerHandle {
    stop_tx: Option<oneshot::Sender<()>>,
    task: JoinHandle<()>,
}

impl PollerHandle {
    /// Stop the poller and wait for the in-flight fill (if any) to finish.
    pub async fn stop(mut self) {
        if let Some(tx) = self.stop_tx.take() {
            let _ = tx.send(());
        }
        let _ = (&mut self.task).await;
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }
}
