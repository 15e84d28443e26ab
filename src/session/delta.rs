//! Per-session change log
//!
//! Records attribute and property mutations between replication cycles.
//! Action slots live in an arena and go back on a free list when the request
//! is reset, so steady-state recording does not allocate. With coalescing on,
//! an index keyed by (target, name) keeps at most one queued action per key.
use std::collections::{BTreeMap, HashMap};

use bincode::{Decode, Encode};
use tracing::{error, trace};

use super::value::{AttributeValue, Principal, WireValue};
use crate::error::{RepliconError, Result};

pub const NAME_PRINCIPAL: &str = "__SET__PRINCIPAL__";
pub const NAME_MAXINTERVAL: &str = "__SET__MAXINTERVAL__";
pub const NAME_ISNEW: &str = "__SET__ISNEW__";
pub const NAME_AUTHTYPE: &str = "__SET__AUTHTYPE__";
pub const NAME_LISTENER: &str = "__SET__LISTENER__";

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Encode, Decode)]
pub enum TargetType {
    Attribute,
    Principal,
    IsNew,
    MaxInterval,
    AuthType,
    Listener,
    Note,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Encode, Decode)]
pub enum DeltaAction {
    Set,
    Remove,
}

/// Value carried by a queued action
#[derive(Clone, Debug, PartialEq)]
pub enum ActionValue {
    Value(AttributeValue),
    Principal(Principal),
    Flag(bool),
    Interval(i32),
    Text(String),
}

#[derive(Clone, Debug, PartialEq, Encode, Decode)]
pub enum WireActionValue {
    Value(WireValue),
    Principal(Principal),
    Flag(bool),
    Interval(i32),
    Text(String),
}

/// One serialized action: type, action, name, optional value
#[derive(Clone, Debug, PartialEq, Encode, Decode)]
pub struct WireAction {
    pub target: TargetType,
    pub action: DeltaAction,
    pub name: String,
    pub value: Option<WireActionValue>,
}

#[derive(Clone, Debug, PartialEq, Encode, Decode)]
struct WireDelta {
    session_id: String,
    record_all_actions: bool,
    actions: Vec<WireAction>,
}

#[derive(Debug, Default)]
struct ActionSlot {
    target: Option<TargetType>,
    action: Option<DeltaAction>,
    name: String,
    value: Option<ActionValue>,
}

impl ActionSlot {
    fn clear(&mut self) {
        self.target = None;
        self.action = None;
        self.name.clear();
        self.value = None;
    }
}

/// Borrowed view of one queued action
#[derive(Clone, Copy, Debug)]
pub struct ActionRef<'a> {
    pub target: TargetType,
    pub action: DeltaAction,
    pub name: &'a str,
    pub value: Option<&'a ActionValue>,
}

/// Receiver of replayed actions. Implementations apply each action without
/// recording it again.
pub trait DeltaReplay {
    fn session_id(&self) -> &str;
    fn access(&mut self);
    fn end_access(&mut self);
    fn replay_attribute(&mut self, name: &str, value: Option<AttributeValue>);
    fn replay_note(&mut self, name: &str, value: Option<AttributeValue>);
    fn replay_principal(&mut self, principal: Option<Principal>);
    fn replay_new(&mut self, is_new: bool);
    fn replay_max_inactive_interval(&mut self, interval: i32);
    fn replay_auth_type(&mut self, auth_type: Option<String>);
    fn replay_listener(&mut self, action: DeltaAction, listener: &str);
}

#[derive(Debug)]
pub struct DeltaRequest {
    session_id: String,
    record_all_actions: bool,
    slots: Vec<ActionSlot>,
    free: Vec<usize>,
    order: BTreeMap<u64, usize>,
    index: HashMap<(TargetType, String), u64>,
    next_seq: u64,
    pool_capacity: usize,
}

impl DeltaRequest {
    pub fn new(session_id: impl Into<String>, record_all_actions: bool, pool_capacity: usize) -> Self {
        Self {
            session_id: session_id.into(),
            record_all_actions,
            slots: Vec::new(),
            free: Vec::new(),
            order: BTreeMap::new(),
            index: HashMap::new(),
            next_seq: 0,
            pool_capacity,
        }
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn set_session_id(&mut self, session_id: impl Into<String>) {
        self.session_id = session_id.into();
    }

    pub fn record_all_actions(&self) -> bool {
        self.record_all_actions
    }

    pub fn set_record_all_actions(&mut self, record_all: bool) {
        self.record_all_actions = record_all;
    }

    pub fn size(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    /// Slots currently parked on the free list
    pub fn pooled_slots(&self) -> usize {
        self.free.len()
    }

    pub fn set_attribute(&mut self, name: &str, value: AttributeValue) {
        self.add_action(TargetType::Attribute, DeltaAction::Set, name, Some(ActionValue::Value(value)));
    }

    pub fn remove_attribute(&mut self, name: &str) {
        self.add_action(TargetType::Attribute, DeltaAction::Remove, name, None);
    }

    pub fn set_note(&mut self, name: &str, value: AttributeValue) {
        self.add_action(TargetType::Note, DeltaAction::Set, name, Some(ActionValue::Value(value)));
    }

    pub fn remove_note(&mut self, name: &str) {
        self.add_action(TargetType::Note, DeltaAction::Remove, name, None);
    }

    pub fn set_max_inactive_interval(&mut self, interval: i32) {
        self.add_action(
            TargetType::MaxInterval,
            DeltaAction::Set,
            NAME_MAXINTERVAL,
            Some(ActionValue::Interval(interval)),
        );
    }

    pub fn set_principal(&mut self, principal: Option<Principal>) {
        let action = if principal.is_some() {
            DeltaAction::Set
        } else {
            DeltaAction::Remove
        };
        self.add_action(
            TargetType::Principal,
            action,
            NAME_PRINCIPAL,
            principal.map(ActionValue::Principal),
        );
    }

    pub fn set_new(&mut self, is_new: bool) {
        self.add_action(TargetType::IsNew, DeltaAction::Set, NAME_ISNEW, Some(ActionValue::Flag(is_new)));
    }

    pub fn set_auth_type(&mut self, auth_type: Option<String>) {
        let action = if auth_type.is_some() {
            DeltaAction::Set
        } else {
            DeltaAction::Remove
        };
        self.add_action(
            TargetType::AuthType,
            action,
            NAME_AUTHTYPE,
            auth_type.map(ActionValue::Text),
        );
    }

    /// Listener actions all share one reserved name, so without
    /// record-all mode only the latest listener change survives.
    pub fn add_session_listener(&mut self, listener: &str) {
        self.add_action(
            TargetType::Listener,
            DeltaAction::Set,
            NAME_LISTENER,
            Some(ActionValue::Text(listener.to_string())),
        );
    }

    pub fn remove_session_listener(&mut self, listener: &str) {
        self.add_action(
            TargetType::Listener,
            DeltaAction::Remove,
            NAME_LISTENER,
            Some(ActionValue::Text(listener.to_string())),
        );
    }

    pub fn add_action(
        &mut self,
        target: TargetType,
        action: DeltaAction,
        name: &str,
        value: Option<ActionValue>,
    ) {
        if !self.record_all_actions {
            if let Some(seq) = self.index.remove(&(target, name.to_string())) {
                if let Some(slot) = self.order.remove(&seq) {
                    self.release(slot);
                }
            }
        }

        let slot = self.acquire();
        let entry = &mut self.slots[slot];
        entry.target = Some(target);
        entry.action = Some(action);
        entry.name.push_str(name);
        entry.value = value;

        let seq = self.next_seq;
        self.next_seq += 1;
        self.order.insert(seq, slot);
        if !self.record_all_actions {
            self.index.insert((target, name.to_string()), seq);
        }
    }

    /// Queued actions in recording order
    pub fn actions(&self) -> impl Iterator<Item = ActionRef<'_>> {
        self.order.values().filter_map(move |&slot| {
            let entry = &self.slots[slot];
            Some(ActionRef {
                target: entry.target?,
                action: entry.action?,
                name: &entry.name,
                value: entry.value.as_ref(),
            })
        })
    }

    /// Clear all queued actions, returning their slots to the free list
    pub fn reset(&mut self) {
        let used: Vec<usize> = self.order.values().copied().collect();
        for slot in used {
            self.slots[slot].clear();
        }
        self.order.clear();
        self.index.clear();
        self.next_seq = 0;

        self.slots.truncate(self.pool_capacity);
        self.free.clear();
        self.free.extend((0..self.slots.len()).rev());
    }

    /// Replay every queued action against `target`, then reset
    pub fn execute(&mut self, target: &mut dyn DeltaReplay) -> Result<()> {
        if self.session_id != target.session_id() {
            return Err(crate::replication_error!(
                "delta for session {} applied to session {}",
                self.session_id,
                target.session_id()
            ));
        }
        target.access();
        for action in self.actions() {
            trace!("replay {:?} {:?} {}", action.target, action.action, action.name);
            replay_one(target, action);
        }
        target.end_access();
        self.reset();
        Ok(())
    }

    /// Serialize queued actions. Attribute or note values that cannot cross
    /// the wire are left out and logged.
    pub fn serialize(&self) -> Result<Vec<u8>> {
        let mut actions = Vec::with_capacity(self.size());
        for action in self.actions() {
            let value = match action.value.map(to_wire_action_value).transpose() {
                Ok(value) => value,
                Err(e) => {
                    error!(
                        "Skipping {:?} '{}' of session {}: {}",
                        action.target, action.name, self.session_id, e
                    );
                    continue;
                }
            };
            actions.push(WireAction {
                target: action.target,
                action: action.action,
                name: action.name.to_string(),
                value,
            });
        }
        crate::codec::encode(&WireDelta {
            session_id: self.session_id.clone(),
            record_all_actions: self.record_all_actions,
            actions,
        })
    }

    /// Replace the queued actions with the decoded ones
    pub fn read_from(&mut self, data: &[u8]) -> Result<()> {
        let wire: WireDelta = crate::codec::decode(data)?;
        self.reset();
        self.session_id = wire.session_id;
        self.record_all_actions = wire.record_all_actions;
        for action in wire.actions {
            let value = action.value.map(from_wire_action_value);
            self.add_action(action.target, action.action, &action.name, value);
        }
        Ok(())
    }

    pub fn deserialize(data: &[u8], pool_capacity: usize) -> Result<Self> {
        let mut request = Self::new(String::new(), false, pool_capacity);
        request.read_from(data)?;
        Ok(request)
    }

    fn acquire(&mut self) -> usize {
        match self.free.pop() {
            Some(slot) => slot,
            None => {
                self.slots.push(ActionSlot::default());
                self.slots.len() - 1
            }
        }
    }

    fn release(&mut self, slot: usize) {
        self.slots[slot].clear();
        self.free.push(slot);
    }
}

fn replay_one(target: &mut dyn DeltaReplay, action: ActionRef<'_>) {
    let set = action.action == DeltaAction::Set;
    match action.target {
        TargetType::Attribute => target.replay_attribute(
            action.name,
            if set { value_of(action.value) } else { None },
        ),
        TargetType::Note => {
            target.replay_note(action.name, if set { value_of(action.value) } else { None })
        }
        TargetType::IsNew => {
            if let Some(ActionValue::Flag(flag)) = action.value {
                target.replay_new(*flag);
            }
        }
        TargetType::MaxInterval => {
            if let Some(ActionValue::Interval(interval)) = action.value {
                target.replay_max_inactive_interval(*interval);
            }
        }
        TargetType::Principal => {
            let principal = match (set, action.value) {
                (true, Some(ActionValue::Principal(p))) => Some(p.clone()),
                _ => None,
            };
            target.replay_principal(principal);
        }
        TargetType::AuthType => {
            let auth = match (set, action.value) {
                (true, Some(ActionValue::Text(t))) => Some(t.clone()),
                _ => None,
            };
            target.replay_auth_type(auth);
        }
        TargetType::Listener => {
            if let Some(ActionValue::Text(listener)) = action.value {
                target.replay_listener(action.action, listener);
            }
        }
    }
}

fn value_of(value: Option<&ActionValue>) -> Option<AttributeValue> {
    match value {
        Some(ActionValue::Value(v)) => Some(v.clone()),
        _ => None,
    }
}

fn to_wire_action_value(value: &ActionValue) -> std::result::Result<WireActionValue, RepliconError> {
    Ok(match value {
        ActionValue::Value(v) => WireActionValue::Value(v.to_wire()?),
        ActionValue::Principal(p) => WireActionValue::Principal(p.clone()),
        ActionValue::Flag(b) => WireActionValue::Flag(*b),
        ActionValue::Interval(i) => WireActionValue::Interval(*i),
        ActionValue::Text(t) => WireActionValue::Text(t.clone()),
    })
}

fn from_wire_action_value(value: WireActionValue) -> ActionValue {
    match value {
        WireActionValue::Value(v) => ActionValue::Value(v.into()),
        WireActionValue::Principal(p) => ActionValue::Principal(p),
        WireActionValue::Flag(b) => ActionValue::Flag(b),
        WireActionValue::Interval(i) => ActionValue::Interval(i),
        WireActionValue::Text(t) => ActionValue::Text(t),
    }
}

/// Spare delta requests handed out when a session's tracker is swapped
#[derive(Debug)]
pub struct DeltaRequestPool {
    spare: parking_lot::Mutex<Vec<DeltaRequest>>,
    capacity: usize,
    slot_capacity: usize,
}

impl DeltaRequestPool {
    pub fn new(capacity: usize, slot_capacity: usize) -> Self {
        Self {
            spare: parking_lot::Mutex::new(Vec::new()),
            capacity,
            slot_capacity,
        }
    }

    pub fn take(&self, session_id: &str, record_all_actions: bool) -> DeltaRequest {
        match self.spare.lock().pop() {
            Some(mut request) => {
                request.set_session_id(session_id);
                request.set_record_all_actions(record_all_actions);
                request
            }
            None => DeltaRequest::new(session_id, record_all_actions, self.slot_capacity),
        }
    }

    pub fn give_back(&self, mut request: DeltaRequest) {
        request.reset();
        let mut spare = self.spare.lock();
        if spare.len() < self.capacity {
            spare.push(request);
        }
    }

    pub fn available(&self) -> usize {
        self.spare.lock().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Default)]
    struct Recorder {
        id: String,
        log: Vec<String>,
        accessed: u32,
        ended: u32,
    }

    impl DeltaReplay for Recorder {
        fn session_id(&self) -> &str {
            &self.id
        }
        fn access(&mut self) {
            self.accessed += 1;
        }
        fn end_access(&mut self) {
            self.ended += 1;
        }
        fn replay_attribute(&mut self, name: &str, value: Option<AttributeValue>) {
            self.log.push(format!("attr {} {:?}", name, value));
        }
        fn replay_note(&mut self, name: &str, value: Option<AttributeValue>) {
            self.log.push(format!("note {} {:?}", name, value));
        }
        fn replay_principal(&mut self, principal: Option<Principal>) {
            self.log.push(format!("principal {:?}", principal.map(|p| p.name)));
        }
        fn replay_new(&mut self, is_new: bool) {
            self.log.push(format!("new {}", is_new));
        }
        fn replay_max_inactive_interval(&mut self, interval: i32) {
            self.log.push(format!("interval {}", interval));
        }
        fn replay_auth_type(&mut self, auth_type: Option<String>) {
            self.log.push(format!("auth {:?}", auth_type));
        }
        fn replay_listener(&mut self, action: DeltaAction, listener: &str) {
            self.log.push(format!("listener {:?} {}", action, listener));
        }
    }

    #[test]
    fn test_coalescing_keeps_latest_value() {
        let mut req = DeltaRequest::new("s1", false, 8);
        req.set_attribute("a", 1i64.into());
        req.set_attribute("b", 2i64.into());
        req.set_attribute("a", 3i64.into());
        assert_eq!(req.size(), 2);

        let names: Vec<_> = req.actions().map(|a| a.name.to_string()).collect();
        // the replaced action moves to the end
        assert_eq!(names, vec!["b", "a"]);
        let last = req.actions().last().unwrap();
        assert_eq!(last.value, Some(&ActionValue::Value(AttributeValue::Int(3))));
    }

    #[test]
    fn test_record_all_keeps_every_action() {
        let mut req = DeltaRequest::new("s1", true, 8);
        req.set_attribute("a", 1i64.into());
        req.set_attribute("a", 2i64.into());
        req.remove_attribute("a");
        assert_eq!(req.size(), 3);
    }

    #[test]
    fn test_attribute_and_note_with_same_name_do_not_collide() {
        let mut req = DeltaRequest::new("s1", false, 8);
        req.set_attribute("x", 1i64.into());
        req.set_note("x", 2i64.into());
        assert_eq!(req.size(), 2);
    }

    #[test]
    fn test_listener_changes_coalesce_without_record_all() {
        let mut req = DeltaRequest::new("s1", false, 8);
        req.add_session_listener("audit");
        req.add_session_listener("metrics");
        assert_eq!(req.size(), 1);
    }

    #[test]
    fn test_reset_returns_slots_to_pool() {
        let mut req = DeltaRequest::new("s1", false, 8);
        for i in 0..5 {
            req.set_attribute(&format!("k{}", i), AttributeValue::Int(i));
        }
        assert_eq!(req.pooled_slots(), 0);
        req.reset();
        assert!(req.is_empty());
        assert_eq!(req.pooled_slots(), 5);

        req.set_attribute("again", 1i64.into());
        assert_eq!(req.pooled_slots(), 4);
    }

    #[test]
    fn test_pool_capacity_bounds_retained_slots() {
        let mut req = DeltaRequest::new("s1", true, 2);
        for i in 0..10 {
            req.set_attribute("k", AttributeValue::Int(i));
        }
        req.reset();
        assert_eq!(req.pooled_slots(), 2);
    }

    #[test]
    fn test_execute_replays_in_order_and_resets() {
        let mut req = DeltaRequest::new("s1", true, 8);
        req.set_attribute("a", "x".into());
        req.set_principal(Some(Principal::new("alice", vec![])));
        req.set_max_inactive_interval(60);
        req.set_new(false);
        req.set_auth_type(Some("FORM".to_string()));
        req.remove_attribute("a");
        req.add_session_listener("audit");
        req.remove_note("n");

        let mut target = Recorder {
            id: "s1".to_string(),
            ..Recorder::default()
        };
        req.execute(&mut target).unwrap();

        assert_eq!(
            target.log,
            vec![
                "attr a Some(Text(\"x\"))",
                "principal Some(\"alice\")",
                "interval 60",
                "new false",
                "auth Some(\"FORM\")",
                "attr a None",
                "listener Set audit",
                "note n None",
            ]
        );
        assert_eq!((target.accessed, target.ended), (1, 1));
        assert!(req.is_empty());
    }

    #[test]
    fn test_execute_rejects_other_session() {
        let mut req = DeltaRequest::new("s1", false, 8);
        let mut target = Recorder {
            id: "s2".to_string(),
            ..Recorder::default()
        };
        assert!(req.execute(&mut target).is_err());
    }

    #[test]
    fn test_serialize_skips_local_values() {
        let mut req = DeltaRequest::new("s1", false, 8);
        req.set_attribute("conn", AttributeValue::local(5u8));
        req.set_attribute("name", "bob".into());

        let decoded = DeltaRequest::deserialize(&req.serialize().unwrap(), 8).unwrap();
        assert_eq!(decoded.session_id(), "s1");
        let names: Vec<_> = decoded.actions().map(|a| a.name.to_string()).collect();
        assert_eq!(names, vec!["name"]);
    }

    #[test]
    fn test_read_from_keeps_record_all_flag() {
        let mut req = DeltaRequest::new("s1", true, 8);
        req.set_attribute("a", 1i64.into());
        req.set_attribute("a", 2i64.into());
        let decoded = DeltaRequest::deserialize(&req.serialize().unwrap(), 8).unwrap();
        assert!(decoded.record_all_actions());
        assert_eq!(decoded.size(), 2);
    }

    #[test]
    fn test_request_pool_reuses_requests() {
        let pool = DeltaRequestPool::new(2, 8);
        let mut req = pool.take("s1", false);
        req.set_attribute("a", 1i64.into());
        pool.give_back(req);
        assert_eq!(pool.available(), 1);

        let reused = pool.take("s2", true);
        assert_eq!(reused.session_id(), "s2");
        assert!(reused.is_empty());
        assert!(reused.record_all_actions());
        assert_eq!(pool.available(), 0);
    }
}
