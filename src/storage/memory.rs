//! In-memory record store.
//!
//! Holds matches, plies and agents in plain collections behind a mutex.
//! Failure injection (`set_failing`) makes every read return an error so the
//! callers' containment paths can be exercised.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard};

use super::backend::{AgentDirectory, GameRecordStore};
use crate::models::{AgentLink, AgentProfile, Match, MatchStatus, PlyState};
use crate::{Error, Result};

#[derive(Default)]
struct MemoryState {
    /// Insertion order doubles as creation order
    matches: Vec<Match>,
    plies: HashMap<String, Vec<PlyState>>,
    agents: HashMap<String, AgentProfile>,
    links: HashMap<String, AgentLink>,
}

/// Record store backed by process memory.
#[derive(Default)]
pub struct MemoryStore {
    state: Mutex<MemoryState>,
    failing: AtomicBool,
    reads: AtomicUsize,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<MutexGuard<'_, MemoryState>> {
        self.reads.fetch_add(1, Ordering::SeqCst);
        if self.failing.load(Ordering::SeqCst) {
            return Err(Error::Other("memory store: injected failure".to_string()));
        }
        self.state
            .lock()
            .map_err(|_| Error::Other("memory store lock poisoned".to_string()))
    }

    fn lock_for_write(&self) -> MutexGuard<'_, MemoryState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Make every subsequent read fail (or succeed again).
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    /// Number of read calls made so far, including failed ones.
    pub fn read_count(&self) -> usize {
        self.reads.load(Ordering::SeqCst)
    }

    /// Insert or replace a match.
    pub fn upsert_match(&self, m: Match) {
        let mut state = self.lock_for_write();
        match state.matches.iter_mut().find(|existing| existing.id == m.id) {
            Some(existing) => *existing = m,
            None => state.matches.push(m),
        }
    }

    /// Update the status of a match, if it exists.
    pub fn set_status(&self, match_id: &str, status: MatchStatus) {
        let mut state = self.lock_for_write();
        if let Some(m) = state.matches.iter_mut().find(|m| m.id == match_id) {
            m.status = status;
        }
    }

    /// Append a ply to a match's history.
    pub fn push_ply(&self, match_id: &str, ply: PlyState) {
        self.lock_for_write()
            .plies
            .entry(match_id.to_string())
            .or_default()
            .push(ply);
    }

    /// Insert or replace an agent profile.
    pub fn upsert_agent(&self, profile: AgentProfile) {
        self.lock_for_write()
            .agents
            .insert(profile.id.clone(), profile);
    }

    /// Insert or replace an agent link.
    pub fn set_agent_link(&self, link: AgentLink) {
        self.lock_for_write()
            .links
            .insert(link.agent_id.clone(), link);
    }
}

impl GameRecordStore for MemoryStore {
    fn get_match(&self, match_id: &str) -> Result<Option<Match>> {
        let state = self.lock()?;
        Ok(state.matches.iter().find(|m| m.id == match_id).cloned())
    }

    fn recent_completed(
        &self,
        match_type: Option<&str>,
        exclude: &HashSet<String>,
        limit: usize,
    ) -> Result<Vec<Match>> {
        let state = self.lock()?;
        let mut completed: Vec<Match> = state
            .matches
            .iter()
            .filter(|m| m.status == MatchStatus::Completed)
            .filter(|m| match_type.is_none_or(|t| m.match_type == t))
            .filter(|m| !exclude.contains(&m.id))
            .cloned()
            .collect();
        completed.sort_by(|a, b| b.completed_at.cmp(&a.completed_at));
        completed.truncate(limit);
        Ok(completed)
    }

    fn live_matches(&self, limit: usize) -> Result<Vec<Match>> {
        let state = self.lock()?;
        Ok(state
            .matches
            .iter()
            .rev()
            .filter(|m| m.status.is_live())
            .take(limit)
            .cloned()
            .collect())
    }

    fn plies_after(&self, match_id: &str, after: u32) -> Result<Vec<PlyState>> {
        let state = self.lock()?;
        let mut plies: Vec<PlyState> = state
            .plies
            .get(match_id)
            .map(|all| {
                all.iter()
                    .filter(|p| p.move_number > after)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default();
        plies.sort_by_key(|p| p.move_number);
        Ok(plies)
    }

    fn agent_profile(&self, agent_id: &str) -> Result<Option<AgentProfile>> {
        let state = self.lock()?;
        Ok(state.agents.get(agent_id).cloned())
    }
}

impl AgentDirectory for MemoryStore {
    fn agent_link(&self, agent_id: &str) -> Result<Option<AgentLink>> {
        let state = self.lock()?;
        Ok(state.links.get(agent_id).cloned())
    }
}
