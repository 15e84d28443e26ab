//! Session messages exchanged between replication managers
use std::fmt;

use bincode::{Decode, Encode};

use crate::error::Result;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Encode, Decode)]
pub enum SessionEvent {
    Created,
    Expired,
    Accessed,
    GetAllSessions,
    AllSessionData,
    Delta,
    AllSessionTransferComplete,
    ChangeSessionId,
    NoContextManager,
}

impl SessionEvent {
    pub const ALL: [SessionEvent; 9] = [
        SessionEvent::Created,
        SessionEvent::Expired,
        SessionEvent::Accessed,
        SessionEvent::GetAllSessions,
        SessionEvent::AllSessionData,
        SessionEvent::Delta,
        SessionEvent::AllSessionTransferComplete,
        SessionEvent::ChangeSessionId,
        SessionEvent::NoContextManager,
    ];

    /// Numeric event code as used in logs and stats
    pub fn code(self) -> u8 {
        match self {
            SessionEvent::Created => 1,
            SessionEvent::Expired => 2,
            SessionEvent::Accessed => 3,
            SessionEvent::GetAllSessions => 4,
            SessionEvent::AllSessionData => 12,
            SessionEvent::Delta => 13,
            SessionEvent::AllSessionTransferComplete => 14,
            SessionEvent::ChangeSessionId => 15,
            SessionEvent::NoContextManager => 16,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            SessionEvent::Created => "SESSION-CREATED",
            SessionEvent::Expired => "SESSION-EXPIRED",
            SessionEvent::Accessed => "SESSION-ACCESSED",
            SessionEvent::GetAllSessions => "SESSION-GET-ALL",
            SessionEvent::AllSessionData => "ALL-SESSION-DATA",
            SessionEvent::Delta => "SESSION-DELTA",
            SessionEvent::AllSessionTransferComplete => "ALL-SESSION-TRANSFERCOMPLETE",
            SessionEvent::ChangeSessionId => "SESSION-ID-CHANGED",
            SessionEvent::NoContextManager => "NO-CONTEXT-MANAGER",
        }
    }

    pub(crate) fn index(self) -> usize {
        match self {
            SessionEvent::Created => 0,
            SessionEvent::Expired => 1,
            SessionEvent::Accessed => 2,
            SessionEvent::GetAllSessions => 3,
            SessionEvent::AllSessionData => 4,
            SessionEvent::Delta => 5,
            SessionEvent::AllSessionTransferComplete => 6,
            SessionEvent::ChangeSessionId => 7,
            SessionEvent::NoContextManager => 8,
        }
    }
}

impl fmt::Display for SessionEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

/// Wire unit exchanged between nodes. The body is opaque here: a full
/// session snapshot, a serialized delta queue, a batch of snapshots or a new id.
#[derive(Clone, Debug, PartialEq, Eq, Encode, Decode)]
pub struct SessionMessage {
    pub event: SessionEvent,
    pub context_name: String,
    pub session_id: String,
    pub body: Vec<u8>,
    pub unique_id: String,
    // 0 until the message is handed to a channel
    pub timestamp: i64,
}

impl SessionMessage {
    pub fn new(
        event: SessionEvent,
        context_name: impl Into<String>,
        session_id: impl Into<String>,
        body: Vec<u8>,
    ) -> Self {
        let session_id = session_id.into();
        let unique_id = format!(
            "{}-{}-{:016x}",
            session_id,
            chrono::Utc::now().timestamp_millis(),
            rand::random::<u64>()
        );
        Self {
            event,
            context_name: context_name.into(),
            session_id,
            body,
            unique_id,
            timestamp: 0,
        }
    }

    /// Set the send timestamp unless one is already recorded
    pub fn stamp(&mut self) {
        if self.timestamp == 0 {
            self.timestamp = chrono::Utc::now().timestamp_millis();
        }
    }

    pub fn serialize(&self) -> Result<Vec<u8>> {
        crate::codec::encode(self)
    }

    pub fn deserialize(data: &[u8]) -> Result<Self> {
        crate::codec::decode(data)
    }
}

impl fmt::Display for SessionMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}#{}#{}#{}",
            self.event, self.context_name, self.session_id, self.unique_id
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unique_ids_differ() {
        let a = SessionMessage::new(SessionEvent::Accessed, "/app", "s1", Vec::new());
        let b = SessionMessage::new(SessionEvent::Accessed, "/app", "s1", Vec::new());
        assert_ne!(a.unique_id, b.unique_id);
        assert!(a.unique_id.starts_with("s1-"));
    }

    #[test]
    fn test_stamp_is_lazy_and_sticky() {
        let mut msg = SessionMessage::new(SessionEvent::Delta, "/app", "s1", vec![1, 2]);
        assert_eq!(msg.timestamp, 0);
        msg.stamp();
        let first = msg.timestamp;
        assert!(first > 0);
        msg.stamp();
        assert_eq!(msg.timestamp, first);
    }

    #[test]
    fn test_wire_round_trip_keeps_body() {
        let msg = SessionMessage::new(SessionEvent::AllSessionData, "/shop", "", vec![9; 64]);
        let decoded = SessionMessage::deserialize(&msg.serialize().unwrap()).unwrap();
        assert_eq!(decoded, msg);
        assert_eq!(decoded.event.code(), 12);
    }

    #[test]
    fn test_event_indexes_are_dense() {
        for (i, event) in SessionEvent::ALL.iter().enumerate() {
            assert_eq!(event.index(), i);
        }
    }
}
