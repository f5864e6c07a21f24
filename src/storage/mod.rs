//! Storage layer for match and agent records.
//!
//! The relay never owns match data. It reads the execution pipeline's records
//! through the traits in [`backend`]:
//!
//! - **SQLite** ([`SqliteStore`]): the production reader, pointed at the
//!   pipeline's database file
//! - **Memory** ([`MemoryStore`]): an in-process store with failure injection,
//!   used by tests and demos
//!
//! The write helpers on `SqliteStore` exist so the pipeline (and test fixtures)
//! can populate the same schema the relay reads.

pub mod backend;
pub mod memory;

pub use backend::{AgentDirectory, GameRecordStore};
pub use memory::MemoryStore;

use crate::models::{AgentLink, AgentProfile, ExecutionMode, Match, MatchStatus, PlyState};
use crate::{Error, Result};
use chrono::{DateTime, Utc};
use rusqlite::{Connection, OptionalExtension, params};
use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

/// Columns selected for every match query, in `MatchRow` order.
const MATCH_COLUMNS: &str =
    "id, match_type, status, white_agent_id, black_agent_id, winner, termination, completed_at";

/// SQLite-backed record store.
pub struct SqliteStore {
    /// Path of the database file (":memory:" for in-memory databases)
    pub path: PathBuf,
    /// rusqlite connections are not `Sync`; all access goes through this lock
    conn: Mutex<Connection>,
}

impl SqliteStore {
    /// Open (or create) the database at `path` and ensure the schema exists.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }

        let conn = Connection::open(path)?;
        Self::init_schema(&conn)?;

        Ok(Self {
            path: path.to_path_buf(),
            conn: Mutex::new(conn),
        })
    }

    /// Open a private in-memory database.
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        Self::init_schema(&conn)?;

        Ok(Self {
            path: PathBuf::from(":memory:"),
            conn: Mutex::new(conn),
        })
    }

    /// Initialize the SQLite schema.
    fn init_schema(conn: &Connection) -> Result<()> {
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS agents (
                id TEXT PRIMARY KEY,
                name TEXT NOT NULL,
                version TEXT NOT NULL DEFAULT '',
                rating INTEGER NOT NULL DEFAULT 1200,
                execution_mode TEXT NOT NULL DEFAULT 'server',
                connection_token_hash TEXT,
                active INTEGER NOT NULL DEFAULT 1
            );

            CREATE TABLE IF NOT EXISTS matches (
                id TEXT PRIMARY KEY,
                match_type TEXT NOT NULL DEFAULT 'ranked',
                status TEXT NOT NULL DEFAULT 'pending',
                white_agent_id TEXT NOT NULL,
                black_agent_id TEXT NOT NULL,
                winner TEXT,
                termination TEXT,
                completed_at TEXT
            );

            CREATE TABLE IF NOT EXISTS match_states (
                match_id TEXT NOT NULL,
                move_number INTEGER NOT NULL,
                board_state TEXT NOT NULL,
                move_time_ms INTEGER,
                move_notation TEXT,
                evaluation REAL,
                PRIMARY KEY (match_id, move_number),
                FOREIGN KEY (match_id) REFERENCES matches(id) ON DELETE CASCADE
            );

            CREATE INDEX IF NOT EXISTS idx_matches_status ON matches(status);
            CREATE INDEX IF NOT EXISTS idx_matches_completed_at ON matches(completed_at);
            "#,
        )?;
        Ok(())
    }

    fn lock(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| Error::Other("SQLite connection lock poisoned".to_string()))
    }

    /// Insert or replace an agent's display record.
    pub fn upsert_agent(&self, profile: &AgentProfile) -> Result<()> {
        let conn = self.lock()?;
        conn.execute(
            "INSERT INTO agents (id, name, version, rating) VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(id) DO UPDATE SET name = ?2, version = ?3, rating = ?4",
            params![profile.id, profile.name, profile.version, profile.rating],
        )?;
        Ok(())
    }

    /// Store bridge credentials for an existing agent.
    pub fn set_agent_link(&self, link: &AgentLink) -> Result<()> {
        let conn = self.lock()?;
        let updated = conn.execute(
            "UPDATE agents SET execution_mode = ?2, connection_token_hash = ?3, active = ?4
             WHERE id = ?1",
            params![
                link.agent_id,
                link.execution_mode.as_str(),
                link.token_hash,
                link.active
            ],
        )?;
        if updated == 0 {
            return Err(Error::NotFound(format!("agent {}", link.agent_id)));
        }
        Ok(())
    }

    /// Insert or replace a match record.
    pub fn upsert_match(&self, m: &Match) -> Result<()> {
        let conn = self.lock()?;
        conn.execute(
            "INSERT INTO matches (id, match_type, status, white_agent_id, black_agent_id,
                winner, termination, completed_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
             ON CONFLICT(id) DO UPDATE SET match_type = ?2, status = ?3, white_agent_id = ?4,
                black_agent_id = ?5, winner = ?6, termination = ?7, completed_at = ?8",
            params![
                m.id,
                m.match_type,
                m.status.as_str(),
                m.white_agent_id,
                m.black_agent_id,
                m.winner,
                m.termination,
                m.completed_at.map(|t| t.to_rfc3339()),
            ],
        )?;
        Ok(())
    }

    /// Append one ply to a match's history.
    pub fn append_ply(&self, match_id: &str, ply: &PlyState) -> Result<()> {
        let board = serde_json::to_string(&ply.board_state)?;
        let conn = self.lock()?;
        conn.execute(
            "INSERT INTO match_states (match_id, move_number, board_state, move_time_ms,
                move_notation, evaluation)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                match_id,
                ply.move_number,
                board,
                ply.move_time_ms.map(|ms| ms as i64),
                ply.move_notation,
                ply.evaluation,
            ],
        )?;
        Ok(())
    }

    fn query_matches<P: rusqlite::Params>(
        conn: &Connection,
        sql: &str,
        params: P,
    ) -> Result<Vec<Match>> {
        let mut stmt = conn.prepare(sql)?;
        let rows = stmt
            .query_map(params, MatchRow::from_row)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(rows.into_iter().map(MatchRow::into_match).collect())
    }
}

impl GameRecordStore for SqliteStore {
    fn get_match(&self, match_id: &str) -> Result<Option<Match>> {
        let conn = self.lock()?;
        let row = conn
            .query_row(
                &format!("SELECT {} FROM matches WHERE id = ?1", MATCH_COLUMNS),
                params![match_id],
                MatchRow::from_row,
            )
            .optional()?;
        Ok(row.map(MatchRow::into_match))
    }

    fn recent_completed(
        &self,
        match_type: Option<&str>,
        exclude: &HashSet<String>,
        limit: usize,
    ) -> Result<Vec<Match>> {
        if limit == 0 {
            return Ok(Vec::new());
        }

        let conn = self.lock()?;
        let mut sql = format!(
            "SELECT {} FROM matches WHERE status = 'completed'",
            MATCH_COLUMNS
        );
        let mut params_vec: Vec<Box<dyn rusqlite::ToSql>> = Vec::new();
        if let Some(t) = match_type {
            sql.push_str(" AND match_type = ?");
            params_vec.push(Box::new(t.to_string()));
        }
        sql.push_str(" ORDER BY completed_at DESC");

        let params_refs: Vec<&dyn rusqlite::ToSql> =
            params_vec.iter().map(|p| p.as_ref()).collect();

        // The exclusion set can grow to every match ever served, so it is
        // applied while walking the cursor instead of as a NOT IN list.
        let mut stmt = conn.prepare(&sql)?;
        let mut rows = stmt.query(params_refs.as_slice())?;
        let mut out = Vec::with_capacity(limit);
        while let Some(row) = rows.next()? {
            let m = MatchRow::from_row(row)?.into_match();
            if exclude.contains(&m.id) {
                continue;
            }
            out.push(m);
            if out.len() == limit {
                break;
            }
        }
        Ok(out)
    }

    fn live_matches(&self, limit: usize) -> Result<Vec<Match>> {
        let conn = self.lock()?;
        Self::query_matches(
            &conn,
            &format!(
                "SELECT {} FROM matches WHERE status IN ('pending', 'active')
                 ORDER BY rowid DESC LIMIT ?1",
                MATCH_COLUMNS
            ),
            params![limit as i64],
        )
    }

    fn plies_after(&self, match_id: &str, after: u32) -> Result<Vec<PlyState>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            "SELECT move_number, board_state, move_time_ms, move_notation, evaluation
             FROM match_states WHERE match_id = ?1 AND move_number > ?2
             ORDER BY move_number ASC",
        )?;
        let plies = stmt
            .query_map(params![match_id, after], |row| {
                let board: String = row.get(1)?;
                let move_time_ms: Option<i64> = row.get(2)?;
                Ok(PlyState {
                    move_number: row.get(0)?,
                    board_state: serde_json::from_str(&board)
                        .unwrap_or(serde_json::Value::String(board)),
                    move_time_ms: move_time_ms.map(|ms| ms.max(0) as u64),
                    move_notation: row.get(3)?,
                    evaluation: row.get(4)?,
                })
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(plies)
    }

    fn agent_profile(&self, agent_id: &str) -> Result<Option<AgentProfile>> {
        let conn = self.lock()?;
        let profile = conn
            .query_row(
                "SELECT id, name, version, rating FROM agents WHERE id = ?1",
                params![agent_id],
                |row| {
                    Ok(AgentProfile {
                        id: row.get(0)?,
                        name: row.get(1)?,
                        version: row.get(2)?,
                        rating: row.get(3)?,
                    })
                },
            )
            .optional()?;
        Ok(profile)
    }
}

impl AgentDirectory for SqliteStore {
    fn agent_link(&self, agent_id: &str) -> Result<Option<AgentLink>> {
        let conn = self.lock()?;
        let row: Option<(String, String, Option<String>, bool)> = conn
            .query_row(
                "SELECT id, execution_mode, connection_token_hash, active
                 FROM agents WHERE id = ?1",
                params![agent_id],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?)),
            )
            .optional()?;

        // An agent that never had a token issued has no link at all.
        Ok(row.and_then(|(id, mode, hash, active)| {
            hash.map(|token_hash| AgentLink {
                agent_id: id,
                token_hash,
                execution_mode: mode.parse().unwrap_or_default(),
                active,
            })
        }))
    }
}

/// Raw `matches` row before string columns are interpreted.
struct MatchRow {
    id: String,
    match_type: String,
    status: String,
    white_agent_id: String,
    black_agent_id: String,
    winner: Option<String>,
    termination: Option<String>,
    completed_at: Option<String>,
}

impl MatchRow {
    fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            match_type: row.get(1)?,
            status: row.get(2)?,
            white_agent_id: row.get(3)?,
            black_agent_id: row.get(4)?,
            winner: row.get(5)?,
            termination: row.get(6)?,
            completed_at: row.get(7)?,
        })
    }

    fn into_match(self) -> Match {
        Match {
            // Unknown statuses come from a newer pipeline; never stream them as live.
            status: self.status.parse().unwrap_or(MatchStatus::Error),
            completed_at: self
                .completed_at
                .as_deref()
                .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
                .map(|dt| dt.with_timezone(&Utc)),
            id: self.id,
            match_type: self.match_type,
            white_agent_id: self.white_agent_id,
            black_agent_id: self.black_agent_id,
            winner: self.winner,
            termination: self.termination,
        }
    }
}

/// Run a synchronous store call on the blocking pool.
pub async fn blocking<T, F>(f: F) -> Result<T>
where
    F: FnOnce() -> Result<T> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| Error::Other(format!("store task failed: {}", e)))?
}

/// Default database location: `<data_dir>/arena-relay/arena.db`.
pub fn default_database_path() -> Result<PathBuf> {
    let data_dir = dirs::data_dir()
        .ok_or_else(|| Error::Other("Could not determine data directory".to_string()))?;
    Ok(data_dir.join("arena-relay").join("arena.db"))
}
