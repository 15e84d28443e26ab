//! Session with replication attached
//!
//! Wraps a plain [`Session`] and a [`DeltaRequest`] behind one per-session lock.
//! Every mutation made through this type is recorded; replayed changes coming
//! from peers go through [`ReplicatedSession::apply_diff`] and are not.
use std::sync::Arc;

use parking_lot::{Mutex, MutexGuard};
use tracing::debug;

use super::base::{now_ms, ReplayTarget, Session};
use super::delta::{DeltaRequest, DeltaRequestPool};
use super::listener::{ListenerRegistry, SessionListener};
use super::snapshot::SessionSnapshot;
use super::value::{AttributeValue, Principal};
use crate::error::{RepliconError, Result};

/// Result of an idle-expiry check
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Expiry {
    Valid,
    /// Expired by this check; `notify_cluster` is false for backup copies
    Expired { notify_cluster: bool },
    /// Was already invalid before this check
    Invalid,
}

#[derive(Debug)]
pub struct ReplicatedState {
    pub session: Session,
    delta: DeltaRequest,
    primary: bool,
    last_replicated: i64,
    replicated_once: bool,
}

impl ReplicatedState {
    pub fn delta(&self) -> &DeltaRequest {
        &self.delta
    }
}

#[derive(Debug)]
pub struct ReplicatedSession {
    state: Mutex<ReplicatedState>,
}

impl ReplicatedSession {
    /// A new locally-owned (primary) session
    pub fn new(id: impl Into<String>, max_inactive_interval: i32, record_all_actions: bool, slot_capacity: usize) -> Self {
        let now = now_ms();
        let session = Session::new(id, max_inactive_interval, now);
        let delta = DeltaRequest::new(session.id(), record_all_actions, slot_capacity);
        Self::from_parts(session, delta, true, now, false)
    }

    /// A backup copy rebuilt from a peer's snapshot
    pub fn from_snapshot(
        snapshot: SessionSnapshot,
        registry: &ListenerRegistry,
        record_all_actions: bool,
        slot_capacity: usize,
    ) -> Self {
        let session = snapshot.restore(registry);
        let delta = DeltaRequest::new(session.id(), record_all_actions, slot_capacity);
        Self::from_parts(session, delta, false, now_ms(), true)
    }

    fn from_parts(session: Session, delta: DeltaRequest, primary: bool, last_replicated: i64, replicated_once: bool) -> Self {
        Self {
            state: Mutex::new(ReplicatedState {
                session,
                delta,
                primary,
                last_replicated,
                replicated_once,
            }),
        }
    }

    /// Exclusive access to the session and its tracker
    pub fn lock(&self) -> MutexGuard<'_, ReplicatedState> {
        self.state.lock()
    }

    pub fn id(&self) -> String {
        self.state.lock().session.id().to_string()
    }

    pub fn attribute(&self, name: &str) -> Option<AttributeValue> {
        self.state.lock().session.attribute(name).cloned()
    }

    pub fn attribute_names(&self) -> Vec<String> {
        self.state.lock().session.attribute_names()
    }

    pub fn principal(&self) -> Option<Principal> {
        self.state.lock().session.principal().cloned()
    }

    pub fn auth_type(&self) -> Option<String> {
        self.state.lock().session.auth_type().map(str::to_string)
    }

    pub fn max_inactive_interval(&self) -> i32 {
        self.state.lock().session.max_inactive_interval()
    }

    pub fn is_new(&self) -> bool {
        self.state.lock().session.is_new()
    }

    pub fn note(&self, name: &str) -> Option<AttributeValue> {
        self.state.lock().session.note(name).cloned()
    }

    pub fn set_attribute(&self, name: &str, value: AttributeValue) -> Result<()> {
        self.mutate(|state| {
            state.session.set_attribute(name, value.clone(), true);
            state.delta.set_attribute(name, value);
        })
    }

    pub fn remove_attribute(&self, name: &str) -> Result<Option<AttributeValue>> {
        self.mutate(|state| {
            let removed = state.session.remove_attribute(name, true);
            if removed.is_some() {
                state.delta.remove_attribute(name);
            }
            removed
        })
    }

    pub fn set_principal(&self, principal: Option<Principal>) -> Result<()> {
        let mut state = self.valid_state()?;
        state.session.set_principal(principal.clone());
        state.delta.set_principal(principal);
        Ok(())
    }

    pub fn set_auth_type(&self, auth_type: Option<String>) -> Result<()> {
        let mut state = self.valid_state()?;
        state.session.set_auth_type(auth_type.clone());
        state.delta.set_auth_type(auth_type);
        Ok(())
    }

    pub fn set_max_inactive_interval(&self, interval: i32) -> Result<()> {
        let mut state = self.valid_state()?;
        state.session.set_max_inactive_interval(interval);
        state.delta.set_max_inactive_interval(interval);
        Ok(())
    }

    pub fn set_new(&self, is_new: bool) -> Result<()> {
        let mut state = self.valid_state()?;
        state.session.set_new(is_new);
        state.delta.set_new(is_new);
        Ok(())
    }

    pub fn add_session_listener(&self, listener: Arc<dyn SessionListener>) -> Result<()> {
        let mut state = self.valid_state()?;
        let replicated = listener.is_replicated();
        let name = listener.name().to_string();
        state.session.add_listener(listener);
        if replicated {
            state.delta.add_session_listener(&name);
        }
        Ok(())
    }

    pub fn remove_session_listener(&self, name: &str) -> Result<()> {
        let mut state = self.valid_state()?;
        let replicated = state
            .session
            .listeners()
            .iter()
            .any(|l| l.name() == name && l.is_replicated());
        if state.session.remove_listener(name) && replicated {
            state.delta.remove_session_listener(name);
        }
        Ok(())
    }

    pub fn set_note(&self, name: &str, value: AttributeValue) -> Result<()> {
        let mut state = self.valid_state()?;
        state.session.set_note(name, value.clone());
        state.delta.set_note(name, value);
        Ok(())
    }

    pub fn remove_note(&self, name: &str) -> Result<()> {
        let mut state = self.valid_state()?;
        if state.session.remove_note(name).is_some() {
            state.delta.remove_note(name);
        }
        Ok(())
    }

    pub fn access(&self) {
        self.access_at(now_ms());
    }

    pub fn access_at(&self, now: i64) {
        self.state.lock().session.access_at(now);
    }

    pub fn end_access(&self) {
        self.state.lock().session.end_access();
    }

    /// Touch without recording anything to replicate
    pub fn access_entry_at(&self, now: i64) {
        let mut state = self.state.lock();
        state.session.access_at(now);
        state.session.end_access();
    }

    /// At least one change is queued for replication
    pub fn is_dirty(&self) -> bool {
        !self.state.lock().delta.is_empty()
    }

    pub fn is_primary(&self) -> bool {
        self.state.lock().primary
    }

    pub fn set_primary(&self, primary: bool) {
        self.state.lock().primary = primary;
    }

    pub fn last_replicated(&self) -> i64 {
        self.state.lock().last_replicated
    }

    pub fn set_last_replicated(&self, at: i64) {
        let mut state = self.state.lock();
        state.last_replicated = at;
        state.replicated_once = true;
    }

    /// Whether this session has been sent to the cluster at least once
    pub fn replicated_once(&self) -> bool {
        self.state.lock().replicated_once
    }

    /// Time since the last replication exceeds the idle interval, so peers
    /// need an ACCESSED message to keep their copy alive.
    pub fn is_access_replicate_at(&self, now: i64) -> bool {
        let state = self.state.lock();
        let max = state.session.max_inactive_interval();
        max >= 0 && now.saturating_sub(state.last_replicated) > i64::from(max) * 1000
    }

    /// Swap in a fresh tracker and serialize the displaced one. The swap and
    /// the serialization happen under the session lock.
    pub fn get_diff(&self, pool: &DeltaRequestPool) -> Result<Vec<u8>> {
        let mut state = self.state.lock();
        let fresh = pool.take(state.session.id(), state.delta.record_all_actions());
        let displaced = std::mem::replace(&mut state.delta, fresh);
        let bytes = displaced.serialize();
        state.session.bump_version();
        drop(state);
        pool.give_back(displaced);
        bytes
    }

    /// Replay a peer's diff onto this copy. The copy becomes a backup and its
    /// tracker is left empty.
    pub fn apply_diff(&self, data: &[u8], registry: &ListenerRegistry, notify_listeners: bool) -> Result<()> {
        self.apply_diff_at(data, registry, notify_listeners, now_ms())
    }

    pub fn apply_diff_at(
        &self,
        data: &[u8],
        registry: &ListenerRegistry,
        notify_listeners: bool,
        now: i64,
    ) -> Result<()> {
        self.with_state(|state| Self::replay(state, data, registry, notify_listeners, now))
    }

    fn replay(
        state: &mut ReplicatedState,
        data: &[u8],
        registry: &ListenerRegistry,
        notify_listeners: bool,
        now: i64,
    ) -> Result<()> {
        let ReplicatedState {
            session, delta, ..
        } = &mut *state;
        let record_all = delta.record_all_actions();
        let mut outcome = delta.read_from(data);
        if outcome.is_ok() {
            let mut target = ReplayTarget {
                session: &mut *session,
                registry,
                notify: notify_listeners,
                now,
            };
            outcome = delta.execute(&mut target);
        }
        // never leave replayed actions queued for outward replication
        delta.reset();
        delta.set_session_id(session.id());
        delta.set_record_all_actions(record_all);
        state.primary = false;
        state.replicated_once = true;
        outcome
    }

    /// Drop queued changes without sending them
    pub fn reset_delta(&self) {
        self.state.lock().delta.reset();
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        SessionSnapshot::capture(&self.state.lock().session)
    }

    /// Capture a full snapshot and drop the queued changes it already
    /// contains, both under one hold of the session lock.
    pub fn take_snapshot(&self) -> SessionSnapshot {
        let mut state = self.state.lock();
        let snapshot = SessionSnapshot::capture(&state.session);
        state.delta.reset();
        state.session.bump_version();
        snapshot
    }

    /// Queue and fire the created callback on this session's listeners
    pub fn fire_created(&self) {
        self.with_state(|state| state.session.notify_created());
    }

    pub fn is_valid(&self) -> bool {
        self.state.lock().session.is_valid_flag()
    }

    /// Primary copies expire after the idle interval; backup copies wait
    /// twice as long so a crashed primary does not need an explicit signal.
    pub fn check_expiry_at(&self, now: i64) -> Expiry {
        self.with_state(|state| Self::expiry_of(state, now))
    }

    fn expiry_of(state: &mut ReplicatedState, now: i64) -> Expiry {
        if !state.session.is_valid_flag() {
            return Expiry::Invalid;
        }
        let max = i64::from(state.session.max_inactive_interval());
        if max <= 0 {
            return Expiry::Valid;
        }
        let idle_secs = state.session.idle_time_at(now) / 1000;
        let primary = state.primary;
        let limit = if primary { max } else { 2 * max };
        if idle_secs < limit {
            return Expiry::Valid;
        }
        debug!(
            "session {} idle {}s, expiring ({})",
            state.session.id(),
            idle_secs,
            if primary { "primary" } else { "backup" }
        );
        state.session.invalidate(true);
        Expiry::Expired {
            notify_cluster: primary,
        }
    }

    /// Explicit invalidation; false if already invalid
    pub fn expire(&self, notify: bool) -> bool {
        self.with_state(|state| state.session.invalidate(notify))
    }

    pub(crate) fn rename(&self, new_id: &str) {
        let mut state = self.state.lock();
        state.session.set_id(new_id);
        state.delta.set_session_id(new_id);
    }

    /// Run `f` under the session lock, then fire the listener callbacks it
    /// queued once the lock is released
    fn with_state<T>(&self, f: impl FnOnce(&mut ReplicatedState) -> T) -> T {
        let mut state = self.state.lock();
        let out = f(&mut state);
        let notices = state.session.take_notices();
        drop(state);
        notices.fire();
        out
    }

    /// As [`Self::with_state`], refusing invalidated sessions
    fn mutate<T>(&self, f: impl FnOnce(&mut ReplicatedState) -> T) -> Result<T> {
        let mut state = self.valid_state()?;
        let out = f(&mut state);
        let notices = state.session.take_notices();
        drop(state);
        notices.fire();
        Ok(out)
    }

    fn valid_state(&self) -> Result<MutexGuard<'_, ReplicatedState>> {
        let state = self.state.lock();
        if !state.session.is_valid_flag() {
            return Err(RepliconError::Session(format!(
                "session {} has been invalidated",
                state.session.id()
            )));
        }
        Ok(state)
    }
}
