//! # Session Registry
//!
//! Process-wide map from session id to live session. Mutated only when a
//! connection is accepted or torn down; read by health reporting and by the
//! live/dead check applied to late transcription results.
//!
//! The registry has its own lock and never calls into a session while holding it,
//! so it can be used from any context without regard to session locks.

use crate::audio::session::Session;
use crate::error::SessionError;
use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};

pub struct SessionRegistry {
    sessions: RwLock<HashMap<String, Arc<Session>>>,
    max_sessions: usize,
}

impl SessionRegistry {
    pub fn new(max_sessions: usize) -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
            max_sessions,
        }
    }

    /// Insert a session.
    ///
    /// ## Returns:
    /// - **Err(Capacity)**: `max_sessions` sessions are already registered
    /// - **Err(Transport)**: the id is already taken
    pub fn register(&self, session: Arc<Session>) -> Result<(), SessionError> {
        let mut sessions = self.sessions.write().unwrap_or_else(PoisonError::into_inner);

        if sessions.len() >= self.max_sessions {
            return Err(SessionError::Capacity(self.max_sessions));
        }

        let id = session.id().to_string();
        if sessions.contains_key(&id) {
            return Err(SessionError::Transport(format!(
                "Session ID '{}' already exists",
                id
            )));
        }

        sessions.insert(id, session);
        Ok(())
    }

    /// Remove a session, returning it if it was present.
    pub fn deregister(&self, session_id: &str) -> Option<Arc<Session>> {
        self.sessions
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(session_id)
    }

    pub fn get(&self, session_id: &str) -> Option<Arc<Session>> {
        self.sessions
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(session_id)
            .cloned()
    }

    pub fn contains(&self, session_id: &str) -> bool {
        self.sessions
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(session_id)
    }

    /// Number of registered sessions.
    pub fn len(&self) -> usize {
        self.sessions
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn max_sessions(&self) -> usize {
        self.max_sessions
    }

    pub fn session_ids(&self) -> Vec<String> {
        self.sessions
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect()
    }
}
