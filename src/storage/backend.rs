//! Collaborator traits for the records this layer reads.
//!
//! The execution pipeline and the identity service own the data; the relay
//! only reads it through these traits:
//! - `GameRecordStore` - Matches and their ordered plies
//! - `AgentDirectory` - Bridge credentials for local agents

use std::collections::HashSet;

use crate::Result;
use crate::models::{AgentLink, AgentProfile, Match, PlyState};

/// Read access to matches and their ply history.
///
/// Implementations are synchronous; async callers go through
/// `tokio::task::spawn_blocking`.
pub trait GameRecordStore: Send + Sync {
    /// Look up a single match.
    fn get_match(&self, match_id: &str) -> Result<Option<Match>>;

    /// Completed matches, newest completion first.
    ///
    /// Matches whose id is in `exclude` are skipped and do not count toward
    /// `limit`. `match_type` of `None` means every type.
    fn recent_completed(
        &self,
        match_type: Option<&str>,
        exclude: &HashSet<String>,
        limit: usize,
    ) -> Result<Vec<Match>>;

    /// Pending or active matches, most recently created first.
    fn live_matches(&self, limit: usize) -> Result<Vec<Match>>;

    /// Plies with `move_number > after`, ordered by `move_number`.
    fn plies_after(&self, match_id: &str, after: u32) -> Result<Vec<PlyState>>;

    /// Display metadata for an agent.
    fn agent_profile(&self, agent_id: &str) -> Result<Option<AgentProfile>>;
}

/// Read access to agent bridge credentials.
pub trait AgentDirectory: Send + Sync {
    /// Look up the link record for an agent id.
    fn agent_link(&self, agent_id: &str) -> Result<Option<AgentLink>>;
}
