//! Playback state machine for the spectator client.
//!
//! `PlaybackController` owns the picker list, the current match's plies and
//! the cursor. It performs no I/O and reads no clock: every input is an
//! [`Event`] and every side effect is returned as an [`Effect`] for the driver
//! to execute. That keeps the reconnect and auto-advance rules testable with
//! synthetic event sequences.
//!
//! Each opened stream gets a fresh `generation`. Stream events and timers
//! carry the generation they belong to, and anything from an older generation
//! is dropped.

use std::time::Duration;

use crate::models::{LiveMatch, PlyState};
use crate::protocol::{OrderingGuard, StreamMessage};

/// Interval between picker refreshes
pub const LIVE_LIST_POLL: Duration = Duration::from_secs(10);

/// Delay before reconnecting after a transport failure
pub const RETRY_BACKOFF: Duration = Duration::from_secs(2);

/// Delay before moving on after a match finishes
pub const ADVANCE_DELAY: Duration = Duration::from_secs(4);

/// Timeouts in a row before auto-advance stops
pub const MAX_CONSECUTIVE_TIMEOUTS: u32 = 3;

/// Why the live list is being fetched.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListPurpose {
    /// First load after `Start`
    Initial,
    /// Periodic refresh; never changes the open stream
    Picker,
    /// Moving to the next match after a result
    Advance,
    /// Re-validating the current match after a transport failure
    Retry,
}

/// Timers the controller can schedule.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerKind {
    Advance,
    Retry,
}

/// Inputs to the controller.
#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    Start,
    LiveListLoaded {
        purpose: ListPurpose,
        generation: u64,
        matches: Vec<LiveMatch>,
    },
    LiveListFailed {
        purpose: ListPurpose,
        generation: u64,
        reason: String,
    },
    SelectMatch(usize),
    SetSpeed(f64),
    StreamMessage {
        generation: u64,
        message: StreamMessage,
    },
    StreamFailed {
        generation: u64,
        reason: String,
    },
    /// The stream closed cleanly, with or without a terminal message
    StreamEnded { generation: u64 },
    TimerFired { generation: u64, timer: TimerKind },
    StepBack,
    StepForward,
    JumpToLive,
}

/// Side effects requested by the controller.
#[derive(Debug, Clone, PartialEq)]
pub enum Effect {
    FetchLiveList { purpose: ListPurpose, generation: u64 },
    /// Stop the reader for `generation` and wait for it to exit
    AbortReader { generation: u64 },
    OpenStream {
        generation: u64,
        match_id: String,
        speed: f64,
    },
    Schedule {
        generation: u64,
        timer: TimerKind,
        after: Duration,
    },
    Render,
}

/// Playback state
#[derive(Debug, Clone, PartialEq)]
pub enum PlaybackState {
    /// Nothing open; waiting for a selection
    Idle,
    Connecting { match_id: String },
    Streaming { match_id: String },
    /// Transport lost; a retry is scheduled
    Reconnecting { match_id: String, reason: String },
    Completed {
        match_id: String,
        winner: Option<String>,
        termination: Option<String>,
    },
    /// The server gave up on the match (distinct from a result)
    TimedOut { match_id: String, consecutive: u32 },
    /// The live list could not be loaded; a retry is scheduled
    Error { reason: String },
}

impl PlaybackState {
    /// Short label for status lines.
    pub fn label(&self) -> &'static str {
        match self {
            PlaybackState::Idle => "idle",
            PlaybackState::Connecting { .. } => "connecting",
            PlaybackState::Streaming { .. } => "streaming",
            PlaybackState::Reconnecting { .. } => "reconnecting",
            PlaybackState::Completed { .. } => "completed",
            PlaybackState::TimedOut { .. } => "timed out",
            PlaybackState::Error { .. } => "error",
        }
    }
}

/// The spectator's playback state machine.
#[derive(Debug)]
pub struct PlaybackController {
    state: PlaybackState,
    matches: Vec<LiveMatch>,
    index: usize,
    /// Id of the match the current generation was opened for
    current: Option<String>,
    speed: f64,
    plies: Vec<PlyState>,
    cursor: Option<usize>,
    generation: u64,
    open_reader: Option<u64>,
    guard: OrderingGuard,
    consecutive_timeouts: u32,
}

impl PlaybackController {
    pub fn new(index: usize, speed: f64) -> Self {
        Self {
            state: PlaybackState::Idle,
            matches: Vec::new(),
            index,
            current: None,
            speed: if speed.is_finite() && speed > 0.0 { speed } else { 1.0 },
            plies: Vec::new(),
            cursor: None,
            generation: 0,
            open_reader: None,
            guard: OrderingGuard::new(),
            consecutive_timeouts: 0,
        }
    }

    pub fn state(&self) -> &PlaybackState {
        &self.state
    }

    pub fn matches(&self) -> &[LiveMatch] {
        &self.matches
    }

    pub fn index(&self) -> usize {
        self.index
    }

    /// Id of the match being played, if any.
    pub fn current_match_id(&self) -> Option<&str> {
        self.current.as_deref()
    }

    pub fn speed(&self) -> f64 {
        self.speed
    }

    pub fn plies(&self) -> &[PlyState] {
        &self.plies
    }

    pub fn cursor(&self) -> Option<usize> {
        self.cursor
    }

    /// Ply under the cursor.
    pub fn current_ply(&self) -> Option<&PlyState> {
        self.cursor.and_then(|i| self.plies.get(i))
    }

    /// Whether the cursor follows the newest ply.
    pub fn at_live_edge(&self) -> bool {
        self.cursor == self.last_index()
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Readers this controller believes are open (0 or 1).
    pub fn open_readers(&self) -> usize {
        usize::from(self.open_reader.is_some())
    }

    pub fn consecutive_timeouts(&self) -> u32 {
        self.consecutive_timeouts
    }

    fn last_index(&self) -> Option<usize> {
        self.plies.len().checked_sub(1)
    }

    /// Apply one event and return the effects to execute, in order.
    pub fn handle(&mut self, event: Event) -> Vec<Effect> {
        match event {
            Event::Start => vec![Effect::FetchLiveList {
                purpose: ListPurpose::Initial,
                generation: self.generation,
            }],
            Event::LiveListLoaded {
                purpose,
                generation,
                matches,
            } => self.on_list(purpose, generation, matches),
            Event::LiveListFailed {
                purpose,
                generation,
                reason,
            } => self.on_list_failed(purpose, generation, reason),
            Event::SelectMatch(index) => {
                if index >= self.matches.len() {
                    return Vec::new();
                }
                self.consecutive_timeouts = 0;
                self.connect(index)
            }
            Event::SetSpeed(speed) => {
                if !(speed.is_finite() && speed > 0.0) {
                    return Vec::new();
                }
                self.speed = speed;
                vec![Effect::Render]
            }
            Event::StreamMessage {
                generation,
                message,
            } => self.on_message(generation, message),
            Event::StreamFailed { generation, reason } => self.on_stream_lost(generation, reason),
            Event::StreamEnded { generation } => {
                self.on_stream_lost(generation, "stream ended without a result".to_string())
            }
            Event::TimerFired { generation, timer } => self.on_timer(generation, timer),
            Event::StepBack => {
                self.cursor = self.cursor.map(|c| c.saturating_sub(1));
                vec![Effect::Render]
            }
            Event::StepForward => {
                if let (Some(c), Some(last)) = (self.cursor, self.last_index()) {
                    self.cursor = Some((c + 1).min(last));
                }
                vec![Effect::Render]
            }
            Event::JumpToLive => {
                self.cursor = self.last_index();
                vec![Effect::Render]
            }
        }
    }

    fn close_reader(&mut self, effects: &mut Vec<Effect>) {
        if let Some(generation) = self.open_reader.take() {
            effects.push(Effect::AbortReader { generation });
        }
    }

    /// Open `matches[index]`, closing whatever was open first.
    fn connect(&mut self, index: usize) -> Vec<Effect> {
        let mut effects = Vec::new();
        self.close_reader(&mut effects);

        self.generation += 1;
        self.index = index;
        self.plies.clear();
        self.cursor = None;
        self.guard = OrderingGuard::new();

        let match_id = self.matches[index].id.clone();
        self.current = Some(match_id.clone());
        self.state = PlaybackState::Connecting {
            match_id: match_id.clone(),
        };
        self.open_reader = Some(self.generation);

        effects.push(Effect::OpenStream {
            generation: self.generation,
            match_id,
            speed: self.speed,
        });
        effects.push(Effect::Render);
        effects
    }

    fn go_idle(&mut self) -> Vec<Effect> {
        let mut effects = Vec::new();
        self.close_reader(&mut effects);
        // Invalidate any pending timers.
        self.generation += 1;
        self.state = PlaybackState::Idle;
        effects.push(Effect::Render);
        effects
    }

    fn on_list(
        &mut self,
        purpose: ListPurpose,
        generation: u64,
        matches: Vec<LiveMatch>,
    ) -> Vec<Effect> {
        self.matches = matches;

        if purpose == ListPurpose::Picker {
            return vec![Effect::Render];
        }
        if generation != self.generation {
            return Vec::new();
        }
        if self.matches.is_empty() {
            return self.go_idle();
        }

        let count = self.matches.len();
        let target = match purpose {
            ListPurpose::Advance => (self.index + 1) % count,
            _ => self.index.min(count - 1),
        };
        self.connect(target)
    }

    fn on_list_failed(
        &mut self,
        purpose: ListPurpose,
        generation: u64,
        reason: String,
    ) -> Vec<Effect> {
        if purpose == ListPurpose::Picker || generation != self.generation {
            return Vec::new();
        }
        tracing::warn!(?purpose, reason = %reason, "live list unavailable, retrying");
        self.state = PlaybackState::Error { reason };
        vec![
            Effect::Schedule {
                generation: self.generation,
                timer: TimerKind::Retry,
                after: RETRY_BACKOFF,
            },
            Effect::Render,
        ]
    }

    fn on_message(&mut self, generation: u64, message: StreamMessage) -> Vec<Effect> {
        if self.open_reader != Some(generation) {
            return Vec::new();
        }
        if let Err(violation) = self.guard.check(&message) {
            tracing::warn!(generation, error = %violation, "ignoring out-of-order stream message");
            return Vec::new();
        }

        let match_id = self.current.clone().unwrap_or_default();
        match message {
            StreamMessage::Heartbeat => Vec::new(),
            StreamMessage::Connected { .. } => {
                self.state = PlaybackState::Streaming { match_id };
                vec![Effect::Render]
            }
            StreamMessage::Initial { plies } => {
                self.plies = plies;
                self.cursor = self.last_index();
                self.state = PlaybackState::Streaming { match_id };
                vec![Effect::Render]
            }
            StreamMessage::Move { ply } => {
                self.plies.push(ply);
                self.cursor = self.last_index();
                self.state = PlaybackState::Streaming { match_id };
                vec![Effect::Render]
            }
            StreamMessage::Completed {
                winner,
                termination,
            } => {
                let mut effects = Vec::new();
                self.close_reader(&mut effects);
                self.consecutive_timeouts = 0;
                self.state = PlaybackState::Completed {
                    match_id,
                    winner,
                    termination,
                };
                effects.push(Effect::Schedule {
                    generation,
                    timer: TimerKind::Advance,
                    after: ADVANCE_DELAY,
                });
                effects.push(Effect::Render);
                effects
            }
            StreamMessage::Timeout => {
                let mut effects = Vec::new();
                self.close_reader(&mut effects);
                self.consecutive_timeouts += 1;
                if self.consecutive_timeouts >= MAX_CONSECUTIVE_TIMEOUTS {
                    tracing::info!(
                        timeouts = self.consecutive_timeouts,
                        "too many timeouts in a row, stopping auto-advance"
                    );
                    self.state = PlaybackState::Idle;
                    effects.push(Effect::Render);
                    return effects;
                }
                self.state = PlaybackState::TimedOut {
                    match_id,
                    consecutive: self.consecutive_timeouts,
                };
                effects.push(Effect::Schedule {
                    generation,
                    timer: TimerKind::Advance,
                    after: ADVANCE_DELAY,
                });
                effects.push(Effect::Render);
                effects
            }
        }
    }

    fn on_stream_lost(&mut self, generation: u64, reason: String) -> Vec<Effect> {
        // Stale, or the stream already ended with a terminal message.
        if self.open_reader != Some(generation) {
            return Vec::new();
        }
        let mut effects = Vec::new();
        self.close_reader(&mut effects);
        tracing::info!(generation, reason = %reason, "stream lost, will reconnect");
        self.state = PlaybackState::Reconnecting {
            match_id: self.current.clone().unwrap_or_default(),
            reason,
        };
        effects.push(Effect::Schedule {
            generation,
            timer: TimerKind::Retry,
            after: RETRY_BACKOFF,
        });
        effects.push(Effect::Render);
        effects
    }

    fn on_timer(&mut self, generation: u64, timer: TimerKind) -> Vec<Effect> {
        if generation != self.generation {
            return Vec::new();
        }
        let purpose = match (timer, &self.state) {
            (
                TimerKind::Advance,
                PlaybackState::Completed { .. } | PlaybackState::TimedOut { .. },
            ) => {
                ListPurpose::Advance
            }
            (
                TimerKind::Retry,
                PlaybackState::Reconnecting { .. } | PlaybackState::Error { .. },
            ) => {
                ListPurpose::Retry
            }
            _ => return Vec::new(),
        };
        vec![Effect::FetchLiveList {
            purpose,
            generation,
        }]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{MatchSource, MatchStatus};

    fn live(id: &str) -> LiveMatch {
        LiveMatch {
            id: id.to_string(),
            status: MatchStatus::Active,
            source: MatchSource::Live,
            white: None,
            black: None,
        }
    }

    fn plies(range: std::ops::RangeInclusive<u32>) -> Vec<PlyState> {
        range.map(|n| PlyState::new(n, serde_json::json!(n))).collect()
    }

    /// Applies effects the way the driver would and checks the reader count.
    #[derive(Default)]
    struct Ledger {
        open: Vec<u64>,
        max_open: usize,
        opened: Vec<(u64, String)>,
    }

    impl Ledger {
        fn apply(&mut self, effects: &[Effect]) {
            for effect in effects {
                match effect {
                    Effect::AbortReader { generation } => self.open.retain(|g| g != generation),
                    Effect::OpenStream {
                        generation,
                        match_id,
                        ..
                    } => {
                        self.open.push(*generation);
                        self.opened.push((*generation, match_id.clone()));
                    }
                    _ => {}
                }
                self.max_open = self.max_open.max(self.open.len());
            }
        }
    }

    fn feed(controller: &mut PlaybackController, ledger: &mut Ledger, event: Event) -> Vec<Effect> {
        let effects = controller.handle(event);
        ledger.apply(&effects);
        assert!(ledger.open.len() <= 1, "more than one reader open: {:?}", ledger.open);
        assert_eq!(ledger.open.len(), controller.open_readers());
        effects
    }

    /// Start, load `ids`, and return the controller streaming the first match.
    fn started(ids: &[&str]) -> (PlaybackController, Ledger, u64) {
        let mut controller = PlaybackController::new(0, 1.0);
        let mut ledger = Ledger::default();
        let effects = feed(&mut controller, &mut ledger, Event::Start);
        assert_eq!(
            effects,
            vec![Effect::FetchLiveList {
                purpose: ListPurpose::Initial,
                generation: 0
            }]
        );
        feed(
            &mut controller,
            &mut ledger,
            Event::LiveListLoaded {
                purpose: ListPurpose::Initial,
                generation: 0,
                matches: ids.iter().map(|id| live(id)).collect(),
            },
        );
        let generation = controller.generation();
        (controller, ledger, generation)
    }

    fn fire(generation: u64, timer: TimerKind) -> Event {
        Event::TimerFired { generation, timer }
    }

    fn no_result() -> StreamMessage {
        StreamMessage::Completed {
            winner: None,
            termination: None,
        }
    }

    fn message(generation: u64, message: StreamMessage) -> Event {
        Event::StreamMessage {
            generation,
            message,
        }
    }

    #[test]
    fn test_initial_then_move_updates_cursor() {
        let (mut c, mut ledger, g) = started(&["m1", "m2", "m3"]);
        assert_eq!(ledger.opened, vec![(1, "m1".to_string())]);

        feed(&mut c, &mut ledger, message(g, StreamMessage::Connected { match_id: "m1".into() }));
        assert_eq!(c.state(), &PlaybackState::Streaming { match_id: "m1".into() });

        feed(&mut c, &mut ledger, message(g, StreamMessage::Initial { plies: plies(1..=10) }));
        assert_eq!(c.plies().len(), 10);
        assert_eq!(c.cursor(), Some(9));

        let mut ply = PlyState::new(11, serde_json::json!(11));
        ply.move_time_ms = Some(120);
        let effects = feed(&mut c, &mut ledger, message(g, StreamMessage::Move { ply }));
        assert_eq!(effects, vec![Effect::Render]);
        assert_eq!(c.plies().len(), 11);
        assert_eq!(c.cursor(), Some(10));
        assert!(c.at_live_edge());
    }

    #[test]
    fn test_completed_schedules_single_advance() {
        let (mut c, mut ledger, g) = started(&["m1", "m2", "m3"]);
        feed(&mut c, &mut ledger, message(g, StreamMessage::Initial { plies: plies(1..=3) }));

        let effects = feed(
            &mut c,
            &mut ledger,
            message(
                g,
                StreamMessage::Completed {
                    winner: Some("white".into()),
                    termination: Some("checkmate".into()),
                },
            ),
        );
        assert_eq!(
            effects,
            vec![
                Effect::AbortReader { generation: g },
                Effect::Schedule {
                    generation: g,
                    timer: TimerKind::Advance,
                    after: ADVANCE_DELAY
                },
                Effect::Render,
            ]
        );
        assert!(matches!(c.state(), PlaybackState::Completed { .. }));
        assert_eq!(c.open_readers(), 0);

        // The server closing the finished stream is not a failure.
        assert!(feed(&mut c, &mut ledger, Event::StreamEnded { generation: g }).is_empty());

        let effects = feed(&mut c, &mut ledger, fire(g, TimerKind::Advance));
        assert_eq!(
            effects,
            vec![Effect::FetchLiveList {
                purpose: ListPurpose::Advance,
                generation: g
            }]
        );

        let list = vec![live("m1"), live("m2"), live("m3")];
        feed(
            &mut c,
            &mut ledger,
            Event::LiveListLoaded {
                purpose: ListPurpose::Advance,
                generation: g,
                matches: list.clone(),
            },
        );
        // A duplicate delivery must not open another stream.
        feed(
            &mut c,
            &mut ledger,
            Event::LiveListLoaded {
                purpose: ListPurpose::Advance,
                generation: g,
                matches: list,
            },
        );
        feed(&mut c, &mut ledger, Event::TimerFired { generation: g, timer: TimerKind::Advance });

        assert_eq!(
            ledger.opened,
            vec![(1, "m1".to_string()), (2, "m2".to_string())]
        );
        assert_eq!(c.current_match_id(), Some("m2"));
        assert_eq!(ledger.max_open, 1);
    }

    #[test]
    fn test_advance_wraps_around() {
        let (mut c, mut ledger, _) = started(&["m1", "m2"]);
        feed(&mut c, &mut ledger, Event::SelectMatch(1));
        let g = c.generation();
        feed(&mut c, &mut ledger, message(g, no_result()));
        feed(&mut c, &mut ledger, Event::TimerFired { generation: g, timer: TimerKind::Advance });
        feed(
            &mut c,
            &mut ledger,
            Event::LiveListLoaded {
                purpose: ListPurpose::Advance,
                generation: g,
                matches: vec![live("m1"), live("m2")],
            },
        );
        assert_eq!(c.current_match_id(), Some("m1"));
        assert_eq!(c.index(), 0);
    }

    #[test]
    fn test_advance_to_empty_list_goes_idle() {
        let (mut c, mut ledger, g) = started(&["m1"]);
        feed(&mut c, &mut ledger, message(g, no_result()));
        feed(&mut c, &mut ledger, Event::TimerFired { generation: g, timer: TimerKind::Advance });
        feed(
            &mut c,
            &mut ledger,
            Event::LiveListLoaded {
                purpose: ListPurpose::Advance,
                generation: g,
                matches: vec![],
            },
        );
        assert_eq!(c.state(), &PlaybackState::Idle);
        assert_eq!(c.open_readers(), 0);
    }

    #[test]
    fn test_transport_failure_reconnects_once_to_same_index() {
        let (mut c, mut ledger, g) = started(&["m1", "m2", "m3"]);
        feed(&mut c, &mut ledger, Event::SelectMatch(2));
        let g2 = c.generation();
        assert!(g2 > g);

        let effects = feed(
            &mut c,
            &mut ledger,
            Event::StreamFailed {
                generation: g2,
                reason: "connection reset".into(),
            },
        );
        assert!(effects.contains(&Effect::Schedule {
            generation: g2,
            timer: TimerKind::Retry,
            after: RETRY_BACKOFF
        }));
        assert!(matches!(c.state(), PlaybackState::Reconnecting { .. }));

        // A second failure report for the same generation is ignored.
        assert!(feed(&mut c, &mut ledger, Event::StreamEnded { generation: g2 }).is_empty());

        feed(&mut c, &mut ledger, Event::TimerFired { generation: g2, timer: TimerKind::Retry });
        // The list shrank while we were away: clamp to the last entry.
        feed(
            &mut c,
            &mut ledger,
            Event::LiveListLoaded {
                purpose: ListPurpose::Retry,
                generation: g2,
                matches: vec![live("m1"), live("m2")],
            },
        );
        assert_eq!(c.current_match_id(), Some("m2"));
        assert_eq!(ledger.opened.len(), 3);
        assert!(matches!(c.state(), PlaybackState::Connecting { .. }));
    }

    #[test]
    fn test_stale_generation_events_are_ignored() {
        let (mut c, mut ledger, g) = started(&["m1", "m2"]);
        feed(&mut c, &mut ledger, Event::SelectMatch(1));

        let stale = message(g, StreamMessage::Initial { plies: plies(1..=5) });
        assert!(feed(&mut c, &mut ledger, stale).is_empty());
        assert!(c.plies().is_empty());
        let failed = Event::StreamFailed {
            generation: g,
            reason: "old".into(),
        };
        assert!(feed(&mut c, &mut ledger, failed).is_empty());
        assert!(feed(&mut c, &mut ledger, fire(g, TimerKind::Retry)).is_empty());
    }

    #[test]
    fn test_select_closes_previous_reader_first() {
        let (mut c, mut ledger, g) = started(&["m1", "m2"]);
        feed(&mut c, &mut ledger, message(g, StreamMessage::Initial { plies: plies(1..=4) }));

        let effects = feed(&mut c, &mut ledger, Event::SelectMatch(1));
        assert_eq!(effects[0], Effect::AbortReader { generation: g });
        assert!(matches!(effects[1], Effect::OpenStream { ref match_id, .. } if match_id == "m2"));
        assert!(c.plies().is_empty());
        assert_eq!(c.cursor(), None);

        assert!(feed(&mut c, &mut ledger, Event::SelectMatch(9)).is_empty());
    }

    #[test]
    fn test_picker_refresh_never_touches_stream() {
        let (mut c, mut ledger, g) = started(&["m1"]);
        let effects = feed(
            &mut c,
            &mut ledger,
            Event::LiveListLoaded {
                purpose: ListPurpose::Picker,
                generation: 0,
                matches: vec![live("m9"), live("m8")],
            },
        );
        assert_eq!(effects, vec![Effect::Render]);
        assert_eq!(c.matches().len(), 2);
        assert_eq!(c.generation(), g);
        assert_eq!(c.current_match_id(), Some("m1"));

        let failed = Event::LiveListFailed {
            purpose: ListPurpose::Picker,
            generation: g,
            reason: "down".into(),
        };
        assert!(feed(&mut c, &mut ledger, failed).is_empty());
    }

    #[test]
    fn test_list_failure_schedules_retry() {
        let mut c = PlaybackController::new(0, 1.0);
        c.handle(Event::Start);
        let effects = c.handle(Event::LiveListFailed {
            purpose: ListPurpose::Initial,
            generation: 0,
            reason: "refused".into(),
        });
        assert_eq!(
            effects[0],
            Effect::Schedule {
                generation: 0,
                timer: TimerKind::Retry,
                after: RETRY_BACKOFF
            }
        );
        assert!(matches!(c.state(), PlaybackState::Error { .. }));

        let effects = c.handle(Event::TimerFired { generation: 0, timer: TimerKind::Retry });
        let refetch = Effect::FetchLiveList {
            purpose: ListPurpose::Retry,
            generation: 0,
        };
        assert_eq!(effects, vec![refetch]);
    }

    #[test]
    fn test_timeouts_are_distinct_and_bounded() {
        let (mut c, mut ledger, mut g) = started(&["m1", "m2"]);
        for round in 1..=MAX_CONSECUTIVE_TIMEOUTS {
            let effects = feed(&mut c, &mut ledger, message(g, StreamMessage::Timeout));
            if round < MAX_CONSECUTIVE_TIMEOUTS {
                let expected = PlaybackState::TimedOut {
                    match_id: c.current_match_id().unwrap().to_string(),
                    consecutive: round,
                };
                assert_eq!(c.state(), &expected);
                assert!(effects.iter().any(|e| matches!(
                    e,
                    Effect::Schedule {
                        timer: TimerKind::Advance,
                        ..
                    }
                )));
                feed(&mut c, &mut ledger, fire(g, TimerKind::Advance));
                feed(
                    &mut c,
                    &mut ledger,
                    Event::LiveListLoaded {
                        purpose: ListPurpose::Advance,
                        generation: g,
                        matches: vec![live("m1"), live("m2")],
                    },
                );
                g = c.generation();
            } else {
                assert_eq!(c.state(), &PlaybackState::Idle);
                assert!(!effects.iter().any(|e| matches!(e, Effect::Schedule { .. })));
            }
        }
    }

    #[test]
    fn test_manual_select_resets_timeout_count() {
        let (mut c, mut ledger, g) = started(&["m1", "m2"]);
        feed(&mut c, &mut ledger, message(g, StreamMessage::Timeout));
        assert_eq!(c.consecutive_timeouts(), 1);
        feed(&mut c, &mut ledger, Event::SelectMatch(1));
        assert_eq!(c.consecutive_timeouts(), 0);
    }

    #[test]
    fn test_protocol_violations_are_ignored() {
        let (mut c, mut ledger, g) = started(&["m1"]);
        let early = StreamMessage::Move { ply: PlyState::new(1, serde_json::json!(1)) };
        assert!(feed(&mut c, &mut ledger, message(g, early)).is_empty());
        assert!(c.plies().is_empty());

        feed(&mut c, &mut ledger, message(g, StreamMessage::Initial { plies: plies(1..=3) }));
        let repeat = StreamMessage::Move { ply: PlyState::new(3, serde_json::json!(3)) };
        assert!(feed(&mut c, &mut ledger, message(g, repeat)).is_empty());
        assert_eq!(c.plies().len(), 3);
    }

    #[test]
    fn test_cursor_navigation() {
        let (mut c, mut ledger, g) = started(&["m1"]);
        feed(&mut c, &mut ledger, message(g, StreamMessage::Initial { plies: plies(1..=3) }));

        c.handle(Event::StepBack);
        c.handle(Event::StepBack);
        c.handle(Event::StepBack);
        assert_eq!(c.cursor(), Some(0));
        assert_eq!(c.current_ply().map(|p| p.move_number), Some(1));

        c.handle(Event::StepForward);
        assert_eq!(c.cursor(), Some(1));
        assert!(!c.at_live_edge());

        c.handle(Event::JumpToLive);
        assert_eq!(c.cursor(), Some(2));
        c.handle(Event::StepForward);
        assert_eq!(c.cursor(), Some(2));
    }

    #[test]
    fn test_set_speed_applies_to_next_open() {
        let (mut c, mut ledger, _) = started(&["m1", "m2"]);
        assert!(c.handle(Event::SetSpeed(-1.0)).is_empty());
        assert_eq!(c.handle(Event::SetSpeed(2.0)), vec![Effect::Render]);
        assert_eq!(c.open_readers(), 1);

        let effects = feed(&mut c, &mut ledger, Event::SelectMatch(1));
        assert!(effects
            .iter()
            .any(|e| matches!(e, Effect::OpenStream { speed, .. } if *speed == 2.0)));
    }
}
