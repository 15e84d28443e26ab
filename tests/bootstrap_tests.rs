use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use replicon::membership::Member;
use replicon::node::ClusterNode;
use replicon::replication::{ClusterRouter, ReplicationManager, SessionEvent};
use replicon::session::{AttributeValue, ListenerRegistry};
use replicon::settings::{
    LocalMemberConfig, MembershipMode, ProbeConfig, ReplicationConfig, Settings,
};
use replicon::transport::{ClusterChannel, LocalHub};

fn member(port: i32, id: u8) -> Member {
    Member::new("127.0.0.1".parse().unwrap(), port, [id; 16])
}

fn replication_config() -> ReplicationConfig {
    ReplicationConfig {
        context_name: "/shop".to_string(),
        state_transfer_timeout: Duration::from_secs(10),
        process_expires_frequency: Duration::ZERO,
        ..ReplicationConfig::default()
    }
}

struct LocalNode {
    _router: ClusterRouter,
    manager: Arc<ReplicationManager>,
}

fn local_node(hub: &Arc<LocalHub>, port: i32) -> LocalNode {
    let channel: Arc<dyn ClusterChannel> = Arc::new(hub.join(member(port, port as u8)));
    let router = ClusterRouter::start(channel.clone());
    let manager = Arc::new(ReplicationManager::new(
        replication_config(),
        channel,
        Arc::new(ListenerRegistry::new()),
    ));
    router.register(manager.clone()).unwrap();
    LocalNode {
        _router: router,
        manager,
    }
}

#[tokio::test]
async fn test_lone_node_skips_state_transfer() {
    let hub = LocalHub::new();
    let a = local_node(&hub, 4001);

    let started = Instant::now();
    a.manager.start().await.unwrap();
    assert!(a.manager.is_state_transferred());
    assert!(started.elapsed() < Duration::from_secs(1));
}

#[tokio::test]
async fn test_joining_node_receives_all_sessions() {
    let hub = LocalHub::new();
    let a = local_node(&hub, 4001);
    a.manager.start().await.unwrap();

    let mut ids = Vec::new();
    for i in 0..5 {
        let session = a.manager.create_session();
        session.set_attribute("index", AttributeValue::Int(i)).unwrap();
        ids.push(session.id());
    }
    ids.sort();

    let b = local_node(&hub, 4002);
    let started = Instant::now();
    b.manager.start().await.unwrap();
    assert!(b.manager.is_state_transferred());
    assert!(started.elapsed() < Duration::from_secs(5));

    assert_eq!(b.manager.session_ids(), ids);
    for id in &ids {
        let original = a.manager.find_session(id).unwrap();
        let copy = b.manager.find_session(id).unwrap();
        assert_eq!(copy.attribute_names(), original.attribute_names());
        assert_eq!(copy.attribute("index"), original.attribute("index"));
        assert!(!copy.is_primary());
    }

    let a_stats = a.manager.get_stats();
    assert_eq!(a_stats.received_of(SessionEvent::GetAllSessions), 1);
    assert_eq!(a_stats.sent_of(SessionEvent::AllSessionData), 1);
    assert_eq!(a_stats.sent_of(SessionEvent::AllSessionTransferComplete), 1);
}

#[tokio::test]
async fn test_backup_copy_waits_twice_the_interval() {
    let hub = LocalHub::new();
    let a = local_node(&hub, 4001);
    let b = local_node(&hub, 4002);

    let session = a.manager.create_session();
    let id = session.id();
    a.manager.request_completed(&id).await.unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;

    let copy = b.manager.find_session(&id).unwrap();
    let now = replicon::session::now_ms();
    copy.access_entry_at(now);
    session.access_entry_at(now);
    let interval_ms = i64::from(session.max_inactive_interval()) * 1000;

    // the backup goes first; the primary's expiry would tell b to drop its copy
    assert_eq!(b.manager.process_expires_at(now + interval_ms).await, 0);
    assert_eq!(b.manager.process_expires_at(now + 2 * interval_ms).await, 1);
    assert_eq!(a.manager.process_expires_at(now + interval_ms).await, 1);
}

fn free_port() -> u16 {
    std::net::TcpListener::bind("127.0.0.1:0")
        .unwrap()
        .local_addr()
        .unwrap()
        .port()
}

fn tcp_settings(port: u16, peer: SocketAddr) -> Settings {
    Settings {
        membership_mode: MembershipMode::Static,
        local_member: LocalMemberConfig {
            tcp_listen_host: "127.0.0.1".parse().unwrap(),
            tcp_listen_port: port,
            ..LocalMemberConfig::default()
        },
        heartbeat: Default::default(),
        probe: ProbeConfig {
            static_members: vec![peer],
            connect_timeout: Duration::from_millis(200),
            rpc_timeout: Duration::from_millis(1000),
            ..ProbeConfig::default()
        },
        replication: replication_config(),
    }
}

#[tokio::test]
async fn test_state_transfer_over_tcp() {
    let port_a = free_port();
    let port_b = free_port();
    let addr_a: SocketAddr = ([127, 0, 0, 1], port_a).into();
    let addr_b: SocketAddr = ([127, 0, 0, 1], port_b).into();

    let a = ClusterNode::start(tcp_settings(port_a, addr_b), Arc::new(ListenerRegistry::new()))
        .await
        .unwrap();
    assert!(a.manager().is_state_transferred());

    let session = a.manager().create_session();
    session.set_attribute("cart", AttributeValue::Int(3)).unwrap();
    let id = session.id();

    let b = ClusterNode::start(tcp_settings(port_b, addr_a), Arc::new(ListenerRegistry::new()))
        .await
        .unwrap();
    assert!(b.manager().is_state_transferred());
    assert_eq!(b.members().len(), 1);

    let copy = b.manager().find_session(&id).unwrap();
    assert_eq!(copy.attribute("cart"), Some(AttributeValue::Int(3)));

    b.shutdown().await.unwrap();
    a.shutdown().await.unwrap();
}
