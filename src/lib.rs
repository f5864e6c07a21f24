//! arena-relay - Live match distribution for a chess agent arena.
//!
//! This library provides the real-time layer between the match execution
//! pipeline and the outside world:
//! - a bounded buffer of recently completed games ([`buffer`])
//! - the NDJSON spectator push protocol ([`protocol`])
//! - the HTTP server that streams matches and hosts the agent bridge ([`server`], [`bridge`])
//! - a spectator client with an explicit playback state machine ([`spectator`])

pub mod bridge;
pub mod buffer;
pub mod cli;
pub mod config;
pub mod models;
pub mod protocol;
pub mod server;
pub mod spectator;
pub mod storage;

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Short commit hash the binary was built from ("unknown" outside git)
pub const GIT_COMMIT: &str = env!("ARENA_RELAY_GIT_COMMIT");

/// Build timestamp (ISO 8601, UTC)
pub const BUILD_TIMESTAMP: &str = env!("ARENA_RELAY_BUILD_TIMESTAMP");

/// Library-level error type for relay operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("{0}")]
    Other(String),
}

/// Result type alias for relay operations.
pub type Result<T> = std::result::Result<T, Error>;
