use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use replicon::membership::{
    Member, MemberHealth, Membership, MembershipController, MembershipEvent, MembershipListener,
};

fn member(port: i32, id: u8) -> Member {
    Member::new("127.0.0.1".parse().unwrap(), port, [id; 16])
}

#[derive(Default)]
struct Recorder {
    events: Mutex<Vec<MembershipEvent>>,
}

impl Recorder {
    fn disappeared(&self) -> usize {
        self.events
            .lock()
            .iter()
            .filter(|e| matches!(e, MembershipEvent::Disappeared(_)))
            .count()
    }

    fn added(&self) -> usize {
        self.events
            .lock()
            .iter()
            .filter(|e| matches!(e, MembershipEvent::Added(_)))
            .count()
    }
}

impl MembershipListener for Recorder {
    fn member_added(&self, member: &Member) {
        self.events.lock().push(MembershipEvent::Added(member.clone()));
    }

    fn member_disappeared(&self, member: &Member) {
        self.events
            .lock()
            .push(MembershipEvent::Disappeared(member.clone()));
    }
}

async fn settle<F: Fn() -> bool>(condition: F) -> bool {
    for _ in 0..100 {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    false
}

#[test]
fn test_repeated_announcements_keep_one_entry() {
    let mut table = Membership::new(member(4000, 0));
    assert!(table.member_alive(member(4001, 1)));
    assert!(!table.member_alive(member(4001, 1)));
    assert!(!table.member_alive(member(4001, 1)));
    assert_eq!(table.len(), 1);
}

#[test]
fn test_local_member_never_listed() {
    let mut table = Membership::new(member(4000, 0));
    assert!(!table.member_alive(member(4000, 0)));
    assert!(table.is_empty());
}

#[test]
fn test_snapshot_unaffected_by_later_changes() {
    let mut table = Membership::new(member(4000, 0));
    table.member_alive(member(4001, 1));
    let before = table.members();
    table.member_alive(member(4002, 2));
    assert_eq!(before.len(), 1);
    assert_eq!(table.members().len(), 2);
}

#[test]
fn test_health_classification() {
    let mut table = Membership::new(member(4000, 0));
    let start = Instant::now();
    let peer = member(4001, 1);
    table.member_alive_at(peer.clone(), start);
    let drop_time = Duration::from_millis(1000);

    assert_eq!(
        table.health_of(&peer, drop_time, start + Duration::from_millis(100)),
        Some(MemberHealth::Ready)
    );
    assert_eq!(
        table.health_of(&peer, drop_time, start + Duration::from_millis(600)),
        Some(MemberHealth::Suspect)
    );
    assert_eq!(
        table.health_of(&peer, drop_time, start + Duration::from_millis(1000)),
        Some(MemberHealth::Failing)
    );
}

#[tokio::test]
async fn test_silent_member_expires_once_with_one_callback() {
    let handle = MembershipController::start(member(4000, 0));
    let recorder = Arc::new(Recorder::default());
    handle.add_listener(recorder.clone()).await.unwrap();

    assert!(handle.member_alive(member(4001, 1)).await.unwrap());
    assert!(settle(|| recorder.added() == 1).await);

    tokio::time::sleep(Duration::from_millis(60)).await;
    let expired = handle.expire(Duration::from_millis(20)).await.unwrap();
    assert_eq!(expired, vec![member(4001, 1)]);
    assert!(handle.expire(Duration::from_millis(20)).await.unwrap().is_empty());

    assert!(settle(|| recorder.disappeared() == 1).await);
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(recorder.disappeared(), 1);
    assert!(!handle.has_members());
}

#[tokio::test]
async fn test_watch_snapshot_follows_changes() {
    let handle = MembershipController::start(member(4000, 0));
    let mut snapshots = handle.subscribe();

    handle.member_alive(member(4001, 1)).await.unwrap();
    snapshots.changed().await.unwrap();
    assert_eq!(snapshots.borrow().len(), 1);

    assert!(handle.remove_member(member(4001, 1)).await.unwrap());
    snapshots.changed().await.unwrap();
    assert!(snapshots.borrow().is_empty());
}
