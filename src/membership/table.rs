//! Local view of the live cluster
//!
//! Every structural change swaps in a freshly built member list, so a
//! snapshot handed out by [`Membership::members`] is never observed half-updated.
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use super::member::{by_alive_time, Member};

/// Liveness bucket derived from time since last heard
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MemberHealth {
    Ready,
    Suspect,
    Failing,
}

#[derive(Clone, Debug)]
pub struct MemberEntry {
    pub member: Member,
    pub last_heard: Instant,
}

impl MemberEntry {
    pub fn health(&self, drop_time: Duration, now: Instant) -> MemberHealth {
        let silent = now.saturating_duration_since(self.last_heard);
        if silent >= drop_time {
            MemberHealth::Failing
        } else if silent >= drop_time / 2 {
            MemberHealth::Suspect
        } else {
            MemberHealth::Ready
        }
    }
}

#[derive(Debug)]
pub struct Membership {
    local: Member,
    entries: HashMap<Member, MemberEntry>,
    snapshot: Arc<Vec<Member>>,
}

impl Membership {
    pub fn new(local: Member) -> Self {
        Self {
            local,
            entries: HashMap::new(),
            snapshot: Arc::new(Vec::new()),
        }
    }

    pub fn local_member(&self) -> &Member {
        &self.local
    }

    /// Record an announcement; true only the first time this identity is seen
    pub fn member_alive(&mut self, member: Member) -> bool {
        self.member_alive_at(member, Instant::now())
    }

    pub fn member_alive_at(&mut self, member: Member, now: Instant) -> bool {
        if member == self.local {
            return false;
        }
        let is_new = match self.entries.get_mut(&member) {
            Some(entry) => {
                entry.member = member;
                entry.last_heard = now;
                false
            }
            None => {
                self.entries.insert(
                    member.clone(),
                    MemberEntry {
                        member,
                        last_heard: now,
                    },
                );
                true
            }
        };
        self.rebuild();
        is_new
    }

    /// Drop a member; returns the stored record if it was present
    pub fn remove_member(&mut self, member: &Member) -> Option<Member> {
        let removed = self.entries.remove(member).map(|entry| entry.member);
        if removed.is_some() {
            self.rebuild();
        }
        removed
    }

    /// Remove and return every member not heard from within `max_age`
    pub fn expire(&mut self, max_age: Duration) -> Vec<Member> {
        self.expire_at(max_age, Instant::now())
    }

    pub fn expire_at(&mut self, max_age: Duration, now: Instant) -> Vec<Member> {
        let stale: Vec<Member> = self
            .entries
            .values()
            .filter(|entry| now.saturating_duration_since(entry.last_heard) > max_age)
            .map(|entry| entry.member.clone())
            .collect();
        if stale.is_empty() {
            return stale;
        }
        for member in &stale {
            self.entries.remove(member);
        }
        self.rebuild();
        stale
    }

    pub fn members(&self) -> Arc<Vec<Member>> {
        self.snapshot.clone()
    }

    pub fn has_members(&self) -> bool {
        !self.entries.is_empty()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn contains(&self, member: &Member) -> bool {
        self.entries.contains_key(member)
    }

    pub fn entry(&self, member: &Member) -> Option<&MemberEntry> {
        self.entries.get(member)
    }

    pub fn health_of(&self, member: &Member, drop_time: Duration, now: Instant) -> Option<MemberHealth> {
        self.entries.get(member).map(|e| e.health(drop_time, now))
    }

    fn rebuild(&mut self) {
        let mut members: Vec<Member> = self.entries.values().map(|e| e.member.clone()).collect();
        members.sort_by(by_alive_time);
        self.snapshot = Arc::new(members);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn member(port: i32, id: u8) -> Member {
        Member::new("127.0.0.1".parse().unwrap(), port, [id; 16])
    }

    #[test]
    fn test_member_alive_is_idempotent() {
        let mut table = Membership::new(member(4000, 0));
        assert!(table.member_alive(member(4001, 1)));
        assert!(!table.member_alive(member(4001, 1)));
        assert!(!table.member_alive(member(4001, 1)));
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn test_local_member_never_added() {
        let local = member(4000, 0);
        let mut table = Membership::new(local.clone());
        assert!(!table.member_alive(local));
        assert!(table.is_empty());
    }

    #[test]
    fn test_reannounce_updates_fields() {
        let mut table = Membership::new(member(4000, 0));
        table.member_alive(member(4001, 1));
        let mut again = member(4001, 1);
        again.set_member_alive_time(7000);
        table.member_alive(again);
        assert_eq!(table.members()[0].member_alive_time(), 7000);
    }

    #[test]
    fn test_expire_returns_each_member_once() {
        let start = Instant::now();
        let mut table = Membership::new(member(4000, 0));
        table.member_alive_at(member(4001, 1), start);
        table.member_alive_at(member(4002, 2), start + Duration::from_millis(2000));

        let drop_time = Duration::from_millis(3000);
        let expired = table.expire_at(drop_time, start + Duration::from_millis(3500));
        assert_eq!(expired, vec![member(4001, 1)]);
        assert!(table
            .expire_at(drop_time, start + Duration::from_millis(3600))
            .is_empty());
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn test_snapshot_is_copy_on_write() {
        let mut table = Membership::new(member(4000, 0));
        table.member_alive(member(4001, 1));
        let before = table.members();
        table.member_alive(member(4002, 2));
        assert_eq!(before.len(), 1);
        assert_eq!(table.members().len(), 2);
    }

    #[test]
    fn test_health_classification() {
        let start = Instant::now();
        let mut table = Membership::new(member(4000, 0));
        let peer = member(4001, 1);
        table.member_alive_at(peer.clone(), start);
        let drop_time = Duration::from_millis(3000);

        let at = |ms| start + Duration::from_millis(ms);
        assert_eq!(table.health_of(&peer, drop_time, at(1000)), Some(MemberHealth::Ready));
        assert_eq!(table.health_of(&peer, drop_time, at(1500)), Some(MemberHealth::Suspect));
        assert_eq!(table.health_of(&peer, drop_time, at(3000)), Some(MemberHealth::Failing));
    }

    #[test]
    fn test_remove_member() {
        let mut table = Membership::new(member(4000, 0));
        table.member_alive(member(4001, 1));
        assert!(table.remove_member(&member(4001, 1)).is_some());
        assert!(table.remove_member(&member(4001, 1)).is_none());
        assert!(!table.has_members());
    }
}
