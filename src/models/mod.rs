//! Data models shared by the relay, the bridge and the spectator client.
//!
//! This module defines the records this layer reads from its collaborators:
//! - `Match` - One game between two agents, owned by the execution pipeline
//! - `PlyState` - One half-move of a match, immutable once written
//! - `AgentProfile` - Display metadata for an agent
//! - `AgentLink` - Bridge credentials for a locally-executed agent
//! - `LiveMatch` - A match picker entry served to spectators

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Lifecycle status of a match.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchStatus {
    #[default]
    Pending,
    Active,
    Completed,
    Error,
}

impl MatchStatus {
    /// Get the string representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            MatchStatus::Pending => "pending",
            MatchStatus::Active => "active",
            MatchStatus::Completed => "completed",
            MatchStatus::Error => "error",
        }
    }

    /// Whether the match can still produce plies.
    pub fn is_live(&self) -> bool {
        matches!(self, MatchStatus::Pending | MatchStatus::Active)
    }
}

impl fmt::Display for MatchStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for MatchStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "pending" => Ok(MatchStatus::Pending),
            "active" => Ok(MatchStatus::Active),
            "completed" => Ok(MatchStatus::Completed),
            "error" => Ok(MatchStatus::Error),
            _ => Err(format!("Unknown match status: {}", s)),
        }
    }
}

/// A match between two agents.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Match {
    /// Unique identifier
    pub id: String,

    /// Match category used to pick which completed games get buffered (e.g. "ranked")
    pub match_type: String,

    /// Current status
    pub status: MatchStatus,

    /// Agent id playing white
    pub white_agent_id: String,

    /// Agent id playing black
    pub black_agent_id: String,

    /// "white", "black" or "draw" once the match has ended
    #[serde(skip_serializing_if = "Option::is_none")]
    pub winner: Option<String>,

    /// Why the match ended (checkmate, timeout, resignation, ...)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub termination: Option<String>,

    /// When the match ended
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
}

impl Match {
    /// Create a new pending match.
    pub fn new(id: impl Into<String>, white: impl Into<String>, black: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            match_type: "ranked".to_string(),
            status: MatchStatus::Pending,
            white_agent_id: white.into(),
            black_agent_id: black.into(),
            winner: None,
            termination: None,
            completed_at: None,
        }
    }

    /// Mark the match as completed with the given result.
    pub fn complete(mut self, winner: Option<&str>, termination: &str, at: DateTime<Utc>) -> Self {
        self.status = MatchStatus::Completed;
        self.winner = winner.map(str::to_string);
        self.termination = Some(termination.to_string());
        self.completed_at = Some(at);
        self
    }
}

/// The state of a match after one ply.
///
/// `move_time_ms == None` means the side to move timed out; the ply is still
/// recorded so move numbers stay contiguous.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlyState {
    /// 1-based ply counter
    pub move_number: u32,

    /// Opaque board payload (FEN string or engine-specific object)
    pub board_state: serde_json::Value,

    /// Time the agent took, or null on timeout
    #[serde(default)]
    pub move_time_ms: Option<u64>,

    /// Move in algebraic notation
    #[serde(default)]
    pub move_notation: Option<String>,

    /// Engine evaluation after the move
    #[serde(default)]
    pub evaluation: Option<f64>,
}

impl PlyState {
    /// Create a ply with a board payload and no metadata.
    pub fn new(move_number: u32, board_state: serde_json::Value) -> Self {
        Self {
            move_number,
            board_state,
            move_time_ms: None,
            move_notation: None,
            evaluation: None,
        }
    }

    /// Whether this ply records a timeout rather than a played move.
    pub fn is_timeout(&self) -> bool {
        self.move_time_ms.is_none()
    }
}

/// Display metadata for an agent, snapshotted when a game is buffered.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentProfile {
    pub id: String,
    pub name: String,
    pub version: String,
    pub rating: i64,
}

impl AgentProfile {
    /// Placeholder profile for an agent the directory no longer knows about.
    pub fn unknown(id: &str) -> Self {
        Self {
            id: id.to_string(),
            name: "unknown".to_string(),
            version: String::new(),
            rating: 0,
        }
    }
}

/// Where an agent's code runs.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionMode {
    /// Uploaded code run by the platform's sandboxed runner
    #[default]
    Server,
    /// Code running on the participant's machine, joined via the bridge
    Local,
}

impl ExecutionMode {
    /// Get the string representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            ExecutionMode::Server => "server",
            ExecutionMode::Local => "local",
        }
    }
}

impl FromStr for ExecutionMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "server" => Ok(ExecutionMode::Server),
            "local" => Ok(ExecutionMode::Local),
            _ => Err(format!("Unknown execution mode: {}", s)),
        }
    }
}

/// Bridge credentials for an agent. Only the token hash is ever stored.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AgentLink {
    pub agent_id: String,
    /// Lowercase hex SHA-256 of the connection token
    pub token_hash: String,
    pub execution_mode: ExecutionMode,
    pub active: bool,
}

/// Where a picker entry will be streamed from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchSource {
    /// A match still being played
    Live,
    /// A buffered completed match replayed on a shared clock
    Replay,
}

/// One entry in the spectator match picker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LiveMatch {
    pub id: String,
    pub status: MatchStatus,
    pub source: MatchSource,
    #[serde(default)]
    pub white: Option<AgentProfile>,
    #[serde(default)]
    pub black: Option<AgentProfile>,
}
