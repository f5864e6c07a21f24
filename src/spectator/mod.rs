//! Spectator client.
//!
//! - [`controller`]: the playback state machine (pure, no I/O)
//! - [`driver`]: runs the controller on tokio over a [`SpectatorTransport`]
//! - [`transport`]: reqwest-backed HTTP transport (`spectator` feature)
//! - [`console`]: line output used by `arena-relay watch`

pub mod console;
pub mod controller;
pub mod driver;
#[cfg(feature = "spectator")]
pub mod transport;

pub use console::ConsoleObserver;
pub use controller::{
    ADVANCE_DELAY, Effect, Event, LIVE_LIST_POLL, ListPurpose, MAX_CONSECUTIVE_TIMEOUTS,
    PlaybackController, PlaybackState, RETRY_BACKOFF, TimerKind,
};
pub use driver::{
    ByteStream, DriverStats, PLY_PACE, PlaybackObserver, SpectatorDriver, SpectatorTransport,
    ply_spacing,
};
#[cfg(feature = "spectator")]
pub use transport::HttpTransport;
