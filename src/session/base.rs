//! Plain session state with no replication attached
use std::collections::HashMap;
use std::sync::Arc;

use tracing::warn;

use super::delta::{DeltaAction, DeltaReplay};
use super::listener::{ListenerRegistry, SessionListener};
use super::value::{AttributeValue, Principal};

pub fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// A listener callback owed for a change already applied to the session
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SessionNotice {
    Created,
    Destroyed,
    AttributeSet(String),
    AttributeRemoved(String),
}

/// Callbacks drained from a session, to be fired once its lock is released
#[derive(Debug, Default)]
#[must_use]
pub struct PendingNotices {
    session_id: String,
    listeners: Vec<Arc<dyn SessionListener>>,
    notices: Vec<SessionNotice>,
}

impl PendingNotices {
    pub fn is_empty(&self) -> bool {
        self.notices.is_empty()
    }

    pub fn fire(self) {
        for notice in &self.notices {
            for listener in &self.listeners {
                match notice {
                    SessionNotice::Created => listener.session_created(&self.session_id),
                    SessionNotice::Destroyed => listener.session_destroyed(&self.session_id),
                    SessionNotice::AttributeSet(name) => listener.attribute_set(&self.session_id, name),
                    SessionNotice::AttributeRemoved(name) => {
                        listener.attribute_removed(&self.session_id, name)
                    }
                }
            }
        }
    }
}

#[derive(Clone, Debug)]
pub struct Session {
    id: String,
    creation_time: i64,
    last_accessed_time: i64,
    this_accessed_time: i64,
    // seconds; zero or negative means never idle out
    max_inactive_interval: i32,
    is_new: bool,
    is_valid: bool,
    version: u64,
    access_count: u32,
    attributes: HashMap<String, AttributeValue>,
    notes: HashMap<String, AttributeValue>,
    principal: Option<Principal>,
    auth_type: Option<String>,
    listeners: Vec<Arc<dyn SessionListener>>,
    // listener callbacks are queued here and fired by the owner outside any lock
    pending: Vec<SessionNotice>,
}

impl Session {
    pub fn new(id: impl Into<String>, max_inactive_interval: i32, now: i64) -> Self {
        Self {
            id: id.into(),
            creation_time: now,
            last_accessed_time: now,
            this_accessed_time: now,
            max_inactive_interval,
            is_new: true,
            is_valid: true,
            version: 0,
            access_count: 0,
            attributes: HashMap::new(),
            notes: HashMap::new(),
            principal: None,
            auth_type: None,
            listeners: Vec::new(),
            pending: Vec::new(),
        }
    }

    #[allow(clippy::too_many_arguments)]
    pub(crate) fn restore(
        id: String,
        creation_time: i64,
        last_accessed_time: i64,
        this_accessed_time: i64,
        max_inactive_interval: i32,
        is_new: bool,
        is_valid: bool,
        version: u64,
    ) -> Self {
        Self {
            id,
            creation_time,
            last_accessed_time,
            this_accessed_time,
            max_inactive_interval,
            is_new,
            is_valid,
            version,
            access_count: 0,
            attributes: HashMap::new(),
            notes: HashMap::new(),
            principal: None,
            auth_type: None,
            listeners: Vec::new(),
            pending: Vec::new(),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub(crate) fn set_id(&mut self, id: impl Into<String>) {
        self.id = id.into();
    }

    pub fn creation_time(&self) -> i64 {
        self.creation_time
    }

    pub fn last_accessed_time(&self) -> i64 {
        self.last_accessed_time
    }

    pub fn this_accessed_time(&self) -> i64 {
        self.this_accessed_time
    }

    pub fn max_inactive_interval(&self) -> i32 {
        self.max_inactive_interval
    }

    pub fn set_max_inactive_interval(&mut self, interval: i32) {
        self.max_inactive_interval = interval;
    }

    pub fn is_new(&self) -> bool {
        self.is_new
    }

    pub fn set_new(&mut self, is_new: bool) {
        self.is_new = is_new;
    }

    pub fn is_valid_flag(&self) -> bool {
        self.is_valid
    }

    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn access_count(&self) -> u32 {
        self.access_count
    }

    pub fn principal(&self) -> Option<&Principal> {
        self.principal.as_ref()
    }

    pub fn set_principal(&mut self, principal: Option<Principal>) {
        self.principal = principal;
    }

    pub fn auth_type(&self) -> Option<&str> {
        self.auth_type.as_deref()
    }

    pub fn set_auth_type(&mut self, auth_type: Option<String>) {
        self.auth_type = auth_type;
    }

    pub fn attribute(&self, name: &str) -> Option<&AttributeValue> {
        self.attributes.get(name)
    }

    pub fn attributes(&self) -> &HashMap<String, AttributeValue> {
        &self.attributes
    }

    pub fn attribute_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.attributes.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn set_attribute(&mut self, name: &str, value: AttributeValue, notify: bool) {
        self.attributes.insert(name.to_string(), value);
        if notify {
            self.pending.push(SessionNotice::AttributeSet(name.to_string()));
        }
    }

    pub fn remove_attribute(&mut self, name: &str, notify: bool) -> Option<AttributeValue> {
        let removed = self.attributes.remove(name);
        if removed.is_some() && notify {
            self.pending.push(SessionNotice::AttributeRemoved(name.to_string()));
        }
        removed
    }

    pub fn notes(&self) -> &HashMap<String, AttributeValue> {
        &self.notes
    }

    pub fn note(&self, name: &str) -> Option<&AttributeValue> {
        self.notes.get(name)
    }

    pub fn set_note(&mut self, name: &str, value: AttributeValue) {
        self.notes.insert(name.to_string(), value);
    }

    pub fn remove_note(&mut self, name: &str) -> Option<AttributeValue> {
        self.notes.remove(name)
    }

    pub fn listeners(&self) -> &[Arc<dyn SessionListener>] {
        &self.listeners
    }

    pub fn add_listener(&mut self, listener: Arc<dyn SessionListener>) {
        if !self.listeners.iter().any(|l| l.name() == listener.name()) {
            self.listeners.push(listener);
        }
    }

    pub fn remove_listener(&mut self, name: &str) -> bool {
        let before = self.listeners.len();
        self.listeners.retain(|l| l.name() != name);
        before != self.listeners.len()
    }

    pub fn access_at(&mut self, now: i64) {
        self.this_accessed_time = now;
        self.access_count = self.access_count.saturating_add(1);
    }

    pub fn end_access(&mut self) {
        self.is_new = false;
        self.last_accessed_time = self.this_accessed_time;
        self.access_count = self.access_count.saturating_sub(1);
    }

    /// Milliseconds since the start of the last access
    pub fn idle_time_at(&self, now: i64) -> i64 {
        now.saturating_sub(self.this_accessed_time)
    }

    pub fn bump_version(&mut self) {
        self.version = self.version.wrapping_add(1);
    }

    pub fn notify_created(&mut self) {
        self.pending.push(SessionNotice::Created);
    }

    /// Hand over queued callbacks together with the listeners to run them on
    pub fn take_notices(&mut self) -> PendingNotices {
        if self.pending.is_empty() {
            return PendingNotices::default();
        }
        PendingNotices {
            session_id: self.id.clone(),
            listeners: self.listeners.clone(),
            notices: std::mem::take(&mut self.pending),
        }
    }

    /// Mark invalid and queue the destroyed callback; false if it already was invalid
    pub fn invalidate(&mut self, notify: bool) -> bool {
        if !self.is_valid {
            return false;
        }
        self.is_valid = false;
        if notify {
            self.pending.push(SessionNotice::Destroyed);
        }
        true
    }
}

/// Applies replayed delta actions to a plain session
pub struct ReplayTarget<'a> {
    pub session: &'a mut Session,
    pub registry: &'a ListenerRegistry,
    pub notify: bool,
    pub now: i64,
}

impl DeltaReplay for ReplayTarget<'_> {
    fn session_id(&self) -> &str {
        self.session.id()
    }

    fn access(&mut self) {
        self.session.access_at(self.now);
    }

    fn end_access(&mut self) {
        self.session.end_access();
    }

    fn replay_attribute(&mut self, name: &str, value: Option<AttributeValue>) {
        match value {
            Some(value) => self.session.set_attribute(name, value, self.notify),
            None => {
                self.session.remove_attribute(name, self.notify);
            }
        }
    }

    fn replay_note(&mut self, name: &str, value: Option<AttributeValue>) {
        match value {
            Some(value) => self.session.set_note(name, value),
            None => {
                self.session.remove_note(name);
            }
        }
    }

    fn replay_principal(&mut self, principal: Option<Principal>) {
        self.session.set_principal(principal);
    }

    fn replay_new(&mut self, is_new: bool) {
        self.session.set_new(is_new);
    }

    fn replay_max_inactive_interval(&mut self, interval: i32) {
        self.session.set_max_inactive_interval(interval);
    }

    fn replay_auth_type(&mut self, auth_type: Option<String>) {
        self.session.set_auth_type(auth_type);
    }

    fn replay_listener(&mut self, action: DeltaAction, listener: &str) {
        match action {
            DeltaAction::Set => match self.registry.resolve(listener) {
                Some(resolved) => self.session.add_listener(resolved),
                None => warn!(
                    "Unknown session listener '{}' for session {}, skipping",
                    listener,
                    self.session.id()
                ),
            },
            DeltaAction::Remove => {
                self.session.remove_listener(listener);
            }
        }
    }
}
