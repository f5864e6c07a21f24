//! Active bridge sessions, one per agent.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use tokio::sync::Notify;
use uuid::Uuid;

struct Session {
    id: Uuid,
    replaced: Arc<Notify>,
}

/// Tracks which bridge session currently owns each agent id.
///
/// Registering a new session for an agent signals the previous one to shut
/// down. The registry lock is only held for map updates, never across I/O.
#[derive(Clone, Default)]
pub struct BridgeRegistry {
    sessions: Arc<Mutex<HashMap<String, Session>>>,
}

impl BridgeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, Session>> {
        self.sessions
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Claim the agent's slot, displacing any existing session.
    pub fn register(&self, agent_id: &str) -> BridgeLease {
        let session_id = Uuid::new_v4();
        let replaced = Arc::new(Notify::new());

        let previous = self.lock().insert(
            agent_id.to_string(),
            Session {
                id: session_id,
                replaced: Arc::clone(&replaced),
            },
        );
        if let Some(previous) = previous {
            tracing::info!(
                agent_id,
                previous = %previous.id,
                session = %session_id,
                "replacing existing bridge"
            );
            previous.replaced.notify_one();
        }

        BridgeLease {
            registry: self.clone(),
            agent_id: agent_id.to_string(),
            session_id,
            replaced,
        }
    }

    /// Number of agents with an active session.
    pub fn active_count(&self) -> usize {
        self.lock().len()
    }

    /// Session currently holding `agent_id`, if any.
    pub fn session_for(&self, agent_id: &str) -> Option<Uuid> {
        self.lock().get(agent_id).map(|s| s.id)
    }
}

/// Ownership of an agent's bridge slot. Released on drop.
pub struct BridgeLease {
    registry: BridgeRegistry,
    agent_id: String,
    session_id: Uuid,
    replaced: Arc<Notify>,
}

impl BridgeLease {
    pub fn agent_id(&self) -> &str {
        &self.agent_id
    }

    pub fn session_id(&self) -> Uuid {
        self.session_id
    }

    /// Resolves once a newer session has taken this agent's slot.
    pub async fn replaced(&self) {
        self.replaced.notified().await;
    }
}

impl Drop for BridgeLease {
    fn drop(&mut self) {
        let mut sessions = self.registry.lock();
        // A newer session may already own the slot.
        if sessions
            .get(&self.agent_id)
            .is_some_and(|s| s.id == self.session_id)
        {
            sessions.remove(&self.agent_id);
        }
    }
}
