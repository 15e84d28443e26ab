//! Session table keyed by id
use std::sync::Arc;

use dashmap::DashMap;
use rand::Rng;

use super::replicated::ReplicatedSession;
use crate::error::{RepliconError, Result};

/// Creation, lookup and removal of sessions by id
pub trait SessionHost: Send + Sync {
    /// Create and register a new primary session with a fresh id
    fn create_session(&self) -> Arc<ReplicatedSession>;

    fn find_session(&self, id: &str) -> Option<Arc<ReplicatedSession>>;

    /// Register a session, replacing any with the same id
    fn add_session(&self, session: Arc<ReplicatedSession>);

    fn remove_session(&self, id: &str) -> Option<Arc<ReplicatedSession>>;
}

#[derive(Debug)]
pub struct SessionStore {
    sessions: DashMap<String, Arc<ReplicatedSession>>,
    max_inactive_interval: i32,
    record_all_actions: bool,
    slot_capacity: usize,
}

impl SessionStore {
    pub fn new(max_inactive_interval: i32, record_all_actions: bool, slot_capacity: usize) -> Self {
        Self {
            sessions: DashMap::new(),
            max_inactive_interval,
            record_all_actions,
            slot_capacity,
        }
    }

    pub fn max_inactive_interval(&self) -> i32 {
        self.max_inactive_interval
    }

    pub fn record_all_actions(&self) -> bool {
        self.record_all_actions
    }

    pub fn slot_capacity(&self) -> usize {
        self.slot_capacity
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    pub fn ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.sessions.iter().map(|e| e.key().clone()).collect();
        ids.sort();
        ids
    }

    /// Point-in-time list; sessions added afterwards are not included
    pub fn sessions(&self) -> Vec<Arc<ReplicatedSession>> {
        self.sessions.iter().map(|e| e.value().clone()).collect()
    }

    /// Create a session under a caller-chosen id
    pub fn create_with_id(&self, id: &str) -> Arc<ReplicatedSession> {
        let session = Arc::new(ReplicatedSession::new(
            id,
            self.max_inactive_interval,
            self.record_all_actions,
            self.slot_capacity,
        ));
        self.sessions.insert(id.to_string(), session.clone());
        session
    }

    /// Move a session to a new id. Fails when `old_id` is unknown or
    /// `new_id` is already taken.
    pub fn change_session_id(&self, old_id: &str, new_id: &str) -> Result<Arc<ReplicatedSession>> {
        if self.sessions.contains_key(new_id) {
            return Err(RepliconError::Session(format!(
                "session id {} already in use",
                new_id
            )));
        }
        let (_, session) = self
            .sessions
            .remove(old_id)
            .ok_or_else(|| RepliconError::Session(format!("no session {}", old_id)))?;
        session.rename(new_id);
        self.sessions.insert(new_id.to_string(), session.clone());
        Ok(session)
    }

    pub fn clear(&self) {
        self.sessions.clear();
    }
}

impl SessionHost for SessionStore {
    fn create_session(&self) -> Arc<ReplicatedSession> {
        loop {
            let id = generate_session_id();
            if !self.sessions.contains_key(&id) {
                return self.create_with_id(&id);
            }
        }
    }

    fn find_session(&self, id: &str) -> Option<Arc<ReplicatedSession>> {
        self.sessions.get(id).map(|e| e.value().clone())
    }

    fn add_session(&self, session: Arc<ReplicatedSession>) {
        self.sessions.insert(session.id(), session);
    }

    fn remove_session(&self, id: &str) -> Option<Arc<ReplicatedSession>> {
        self.sessions.remove(id).map(|(_, session)| session)
    }
}

/// 32 upper-case hex characters
pub fn generate_session_id() -> String {
    let bytes: [u8; 16] = rand::thread_rng().gen();
    bytes.iter().map(|b| format!("{:02X}", b)).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_create_and_find() {
        let store = SessionStore::new(30, false, 8);
        let session = store.create_session();
        let id = session.id();
        assert_eq!(id.len(), 32);
        assert!(store.find_session(&id).is_some());
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn test_change_session_id_moves_entry() {
        let store = SessionStore::new(30, false, 8);
        store.create_with_id("old");
        let moved = store.change_session_id("old", "new").unwrap();
        assert_eq!(moved.id(), "new");
        assert!(store.find_session("old").is_none());
        assert!(store.find_session("new").is_some());
    }

    #[test]
    fn test_change_session_id_rejects_taken_id() {
        let store = SessionStore::new(30, false, 8);
        store.create_with_id("a");
        store.create_with_id("b");
        assert!(store.change_session_id("a", "b").is_err());
        assert!(store.change_session_id("missing", "c").is_err());
    }

    #[test]
    fn test_remove_session() {
        let store = SessionStore::new(30, false, 8);
        store.create_with_id("a");
        assert!(store.remove_session("a").is_some());
        assert!(store.is_empty());
    }
}
