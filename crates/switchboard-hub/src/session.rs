//! Registry of connected Worker sessions.
//!
//! A session's *index* is its ordinal among the currently connected sessions,
//! in connection order. When a session leaves, later sessions shift down, so
//! "am I worker 0" always has exactly one answer while anyone is connected.

use std::net::SocketAddr;
use std::sync::{Arc, Mutex, PoisonError};

use chrono::{DateTime, Utc};
use uuid::Uuid;

/// Snapshot of one connected Worker.
#[derive(Debug, Clone, PartialEq)]
pub struct WorkerSession {
    pub id: Uuid,
    pub peer: SocketAddr,
    pub connected_at: DateTime<Utc>,
}

/// Ordered set of live sessions. Clone it cheaply – clones share state.
#[derive(Clone, Default)]
pub struct SessionRegistry {
    sessions: Arc<Mutex<Vec<WorkerSession>>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<WorkerSession>> {
        self.sessions.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Register a new session and return its id.
    pub fn register(&self, peer: SocketAddr) -> Uuid {
        let session = WorkerSession {
            id: Uuid::new_v4(),
            peer,
            connected_at: Utc::now(),
        };
        let id = session.id;
        self.lock().push(session);
        id
    }

    /// Remove a session. Returns `false` if it was not registered.
    pub fn remove(&self, id: Uuid) -> bool {
        let mut sessions = self.lock();
        let before = sessions.len();
        sessions.retain(|s| s.id != id);
        sessions.len() != before
    }

    /// Current ordinal of `id` among connected sessions.
    pub fn index_of(&self, id: Uuid) -> Option<usize> {
        self.lock().iter().position(|s| s.id == id)
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    pub fn snapshot(&self) -> Vec<WorkerSession> {
        self.lock().clone()
    }
}
