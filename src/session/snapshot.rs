//! Full-session snapshots
//!
//! Used for CREATED messages and bootstrap transfers. Attributes that cannot
//! cross the wire are dropped from the snapshot and logged; the rest of the
//! session still replicates. Notes holding node-local values stay behind
//! quietly; notes are bookkeeping, not session state.
use bincode::{Decode, Encode};
use tracing::{debug, error, warn};

use super::base::Session;
use super::listener::ListenerRegistry;
use super::value::{AttributeValue, Principal, WireValue};
use crate::error::Result;

#[derive(Clone, Debug, PartialEq, Encode, Decode)]
pub struct SessionSnapshot {
    pub id: String,
    pub creation_time: i64,
    pub last_accessed_time: i64,
    pub this_accessed_time: i64,
    pub max_inactive_interval: i32,
    pub is_new: bool,
    pub is_valid: bool,
    pub version: u64,
    pub principal: Option<Principal>,
    pub auth_type: Option<String>,
    pub attributes: Vec<(String, WireValue)>,
    pub notes: Vec<(String, WireValue)>,
    pub listeners: Vec<String>,
}

impl SessionSnapshot {
    pub fn capture(session: &Session) -> Self {
        let mut attributes = Vec::with_capacity(session.attributes().len());
        for name in session.attribute_names() {
            let Some(value) = session.attribute(&name) else {
                continue;
            };
            match value.to_wire() {
                Ok(wire) => attributes.push((name, wire)),
                Err(e) => error!(
                    "Attribute '{}' of session {} not replicated: {}",
                    name,
                    session.id(),
                    e
                ),
            }
        }

        let mut note_names: Vec<&String> = session.notes().keys().collect();
        note_names.sort();
        let mut notes = Vec::with_capacity(note_names.len());
        for name in note_names {
            let Some(value) = session.note(name) else {
                continue;
            };
            match value.to_wire() {
                Ok(wire) => notes.push((name.clone(), wire)),
                Err(_) => debug!("Note '{}' of session {} is node-local", name, session.id()),
            }
        }

        let listeners = session
            .listeners()
            .iter()
            .filter(|l| l.is_replicated())
            .map(|l| l.name().to_string())
            .collect();

        Self {
            id: session.id().to_string(),
            creation_time: session.creation_time(),
            last_accessed_time: session.last_accessed_time(),
            this_accessed_time: session.this_accessed_time(),
            max_inactive_interval: session.max_inactive_interval(),
            is_new: session.is_new(),
            is_valid: session.is_valid_flag(),
            version: session.version(),
            principal: session.principal().cloned(),
            auth_type: session.auth_type().map(str::to_string),
            attributes,
            notes,
            listeners,
        }
    }

    /// Rebuild a session; listener names unknown to `registry` are skipped
    pub fn restore(self, registry: &ListenerRegistry) -> Session {
        let mut session = Session::restore(
            self.id,
            self.creation_time,
            self.last_accessed_time,
            self.this_accessed_time,
            self.max_inactive_interval,
            self.is_new,
            self.is_valid,
            self.version,
        );
        session.set_principal(self.principal);
        session.set_auth_type(self.auth_type);
        for (name, value) in self.attributes {
            session.set_attribute(&name, AttributeValue::from(value), false);
        }
        for (name, value) in self.notes {
            session.set_note(&name, AttributeValue::from(value));
        }
        for name in self.listeners {
            match registry.resolve(&name) {
                Some(listener) => session.add_listener(listener),
                None => warn!(
                    "Unknown session listener '{}' in snapshot of {}, skipping",
                    name,
                    session.id()
                ),
            }
        }
        session
    }

    pub fn serialize(&self) -> Result<Vec<u8>> {
        crate::codec::encode(self)
    }

    pub fn deserialize(data: &[u8]) -> Result<Self> {
        crate::codec::decode(data)
    }
}

/// Body of an ALL_SESSION_DATA message
#[derive(Clone, Debug, Default, PartialEq, Encode, Decode)]
pub struct SessionBatch {
    pub sessions: Vec<SessionSnapshot>,
}

impl SessionBatch {
    pub fn serialize(&self) -> Result<Vec<u8>> {
        crate::codec::encode(self)
    }

    pub fn deserialize(data: &[u8]) -> Result<Self> {
        crate::codec::decode(data)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::session::listener::SessionListener;

    struct Audit;

    impl SessionListener for Audit {
        fn name(&self) -> &str {
            "audit"
        }
    }

    struct Scratch;

    impl SessionListener for Scratch {
        fn name(&self) -> &str {
            "scratch"
        }
        fn is_replicated(&self) -> bool {
            false
        }
    }

    #[test]
    fn test_capture_skips_local_attributes() {
        let mut session = Session::new("s1", 30, 100);
        session.set_attribute("user", "bob".into(), false);
        session.set_attribute("socket", AttributeValue::local(1u16), false);

        let snapshot = SessionSnapshot::capture(&session);
        assert_eq!(snapshot.attributes.len(), 1);
        assert_eq!(snapshot.attributes[0].0, "user");
    }

    #[test]
    fn test_restore_resolves_listeners_by_name() {
        let mut session = Session::new("s1", 30, 100);
        session.add_listener(Arc::new(Audit));
        session.add_listener(Arc::new(Scratch));
        session.set_principal(Some(Principal::new("bob", vec!["admin".into()])));

        let snapshot = SessionSnapshot::capture(&session);
        assert_eq!(snapshot.listeners, vec!["audit".to_string()]);

        let registry = ListenerRegistry::new();
        registry.register(Arc::new(Audit));
        let decoded = SessionSnapshot::deserialize(&snapshot.serialize().unwrap()).unwrap();
        let restored = decoded.restore(&registry);

        assert_eq!(restored.id(), "s1");
        assert_eq!(restored.listeners().len(), 1);
        assert!(restored.principal().unwrap().has_role("admin"));
        assert_eq!(restored.max_inactive_interval(), 30);
    }

    #[test]
    fn test_auth_type_and_notes_survive_restore() {
        let mut session = Session::new("s1", 30, 100);
        session.set_auth_type(Some("FORM".into()));
        session.set_note("login.page", "/signin".into());
        session.set_note("conn", AttributeValue::local(5u8));

        let decoded = SessionSnapshot::deserialize(&SessionSnapshot::capture(&session).serialize().unwrap()).unwrap();
        assert_eq!(decoded.notes.len(), 1);

        let restored = decoded.restore(&ListenerRegistry::new());
        assert_eq!(restored.auth_type(), Some("FORM"));
        assert_eq!(restored.note("login.page"), Some(&AttributeValue::from("/signin")));
        assert!(restored.note("conn").is_none());
    }
}
