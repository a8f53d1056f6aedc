use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::RwLock;

use super::session::{SessionId, TerminalSession};

/// Live terminal sessions keyed by session id.
///
/// Bookkeeping only: releasing a session's exec channel and client transport
/// is the session's own job.
#[derive(Clone, Default)]
pub struct SessionRegistry {
    sessions: Arc<RwLock<HashMap<SessionId, Arc<TerminalSession>>>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn add(&self, session: Arc<TerminalSession>) {
        let id = session.id().clone();
        self.sessions.write().await.insert(id, session);
    }

    /// Remove a session. Returns `None` when it was already gone, so two
    /// racing removals see exactly one `Some`.
    pub async fn remove(&self, id: &SessionId) -> Option<Arc<TerminalSession>> {
        self.sessions.write().await.remove(id)
    }

    pub async fn get(&self, id: &SessionId) -> Option<Arc<TerminalSession>> {
        self.sessions.read().await.get(id).cloned()
    }

    pub async fn count(&self) -> usize {
        self.sessions.read().await.len()
    }

    pub async fn list_ids(&self) -> Vec<SessionId> {
        self.sessions.read().await.keys().cloned().collect()
    }

    /// Snapshot of every live session, for bulk teardown.
    pub async fn snapshot(&self) -> Vec<Arc<TerminalSession>> {
        self.sessions.read().await.values().cloned().collect()
    }
}
