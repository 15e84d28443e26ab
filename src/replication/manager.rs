//! Replication manager
//!
//! One manager per replicated context. It owns the context's sessions, turns
//! completed local requests into CREATED / DELTA / ACCESSED / EXPIRED
//! messages, and applies the same messages arriving from peers. A joining
//! node pulls the full session set from one peer before it starts serving.
use std::collections::{HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use parking_lot::Mutex;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tokio::time::{self, timeout};
use tracing::{debug, error, info, trace, warn};

use super::messages::{SessionEvent, SessionMessage};
use crate::error::Result;
use crate::membership::{Member, MembershipListener};
use crate::session::{
    now_ms, Expiry, ListenerRegistry, ReplicatedSession, SessionBatch, SessionHost, SessionSnapshot,
    SessionStore,
};
use crate::settings::ReplicationConfig;
use crate::transport::{ClusterChannel, ReceivedMessage};

/// Unique ids remembered for duplicate suppression
const RECENT_MESSAGE_WINDOW: usize = 1024;
const LIFECYCLE_EVENT_CAPACITY: usize = 256;

/// Notifications for layers above replication, e.g. sticky routing
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SessionLifecycleEvent {
    Created { session_id: String, primary: bool },
    Replicated { session_id: String, event: SessionEvent },
    Expired { session_id: String, primary: bool },
    PrimaryTaken { session_id: String },
    MemberDeparted { member: Member },
}

#[derive(Debug, Default)]
pub struct ManagerStats {
    sent: [AtomicU64; 9],
    received: [AtomicU64; 9],
    pub duplicates_dropped: AtomicU64,
    pub sessions_created: AtomicU64,
    pub sessions_expired: AtomicU64,
    pub send_failures: AtomicU64,
    pub state_transfer_ms: AtomicU64,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct FrozenManagerStats {
    pub sent: [u64; 9],
    pub received: [u64; 9],
    pub duplicates_dropped: u64,
    pub sessions_created: u64,
    pub sessions_expired: u64,
    pub send_failures: u64,
    pub state_transfer_ms: u64,
}

impl FrozenManagerStats {
    pub fn sent_of(&self, event: SessionEvent) -> u64 {
        self.sent[event.index()]
    }

    pub fn received_of(&self, event: SessionEvent) -> u64 {
        self.received[event.index()]
    }
}

impl ManagerStats {
    fn record_sent(&self, event: SessionEvent) {
        self.sent[event.index()].fetch_add(1, Ordering::Relaxed);
    }

    fn record_received(&self, event: SessionEvent) {
        self.received[event.index()].fetch_add(1, Ordering::Relaxed);
    }

    pub fn freeze(&self) -> FrozenManagerStats {
        FrozenManagerStats {
            sent: std::array::from_fn(|i| self.sent[i].load(Ordering::Relaxed)),
            received: std::array::from_fn(|i| self.received[i].load(Ordering::Relaxed)),
            duplicates_dropped: self.duplicates_dropped.load(Ordering::Relaxed),
            sessions_created: self.sessions_created.load(Ordering::Relaxed),
            sessions_expired: self.sessions_expired.load(Ordering::Relaxed),
            send_failures: self.send_failures.load(Ordering::Relaxed),
            state_transfer_ms: self.state_transfer_ms.load(Ordering::Relaxed),
        }
    }
}

/// Bounded window of recently seen message ids
#[derive(Debug)]
struct RecentIds {
    seen: HashSet<String>,
    order: VecDeque<String>,
    capacity: usize,
}

impl RecentIds {
    fn new(capacity: usize) -> Self {
        Self {
            seen: HashSet::with_capacity(capacity),
            order: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    /// True if the id was not in the window
    fn insert(&mut self, id: &str) -> bool {
        if self.seen.contains(id) {
            return false;
        }
        if self.order.len() == self.capacity {
            if let Some(oldest) = self.order.pop_front() {
                self.seen.remove(&oldest);
            }
        }
        self.seen.insert(id.to_string());
        self.order.push_back(id.to_string());
        true
    }
}

struct ManagerInner {
    config: ReplicationConfig,
    channel: Arc<dyn ClusterChannel>,
    store: SessionStore,
    registry: Arc<ListenerRegistry>,
    pool: crate::session::DeltaRequestPool,
    recent: Mutex<RecentIds>,
    transferred_tx: watch::Sender<bool>,
    transfer_started: Mutex<Option<Instant>>,
    events: broadcast::Sender<SessionLifecycleEvent>,
    stats: ManagerStats,
}

pub struct ReplicationManager {
    inner: Arc<ManagerInner>,
    started: AtomicBool,
    sweeper: Mutex<Option<JoinHandle<()>>>,
}

impl std::fmt::Debug for ReplicationManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReplicationManager")
            .field("context", &self.inner.config.context_name)
            .field("sessions", &self.inner.store.len())
            .finish()
    }
}

impl ReplicationManager {
    pub fn new(
        config: ReplicationConfig,
        channel: Arc<dyn ClusterChannel>,
        registry: Arc<ListenerRegistry>,
    ) -> Self {
        let store = SessionStore::new(
            config.max_inactive_interval,
            config.record_all_actions,
            config.tracker_pool_capacity,
        );
        let pool = crate::session::DeltaRequestPool::new(
            config.tracker_pool_capacity,
            config.tracker_pool_capacity,
        );
        let (transferred_tx, _) = watch::channel(false);
        let (events, _) = broadcast::channel(LIFECYCLE_EVENT_CAPACITY);
        Self {
            inner: Arc::new(ManagerInner {
                config,
                channel,
                store,
                registry,
                pool,
                recent: Mutex::new(RecentIds::new(RECENT_MESSAGE_WINDOW)),
                transferred_tx,
                transfer_started: Mutex::new(None),
                events,
                stats: ManagerStats::default(),
            }),
            started: AtomicBool::new(false),
            sweeper: Mutex::new(None),
        }
    }

    pub fn context_name(&self) -> &str {
        &self.inner.config.context_name
    }

    /// Start the expiry sweep and pull existing sessions from a peer.
    ///
    /// Inbound messages must already be routed to [`Self::handle_message`],
    /// otherwise the transfer reply is never seen and the wait runs to its
    /// timeout.
    pub async fn start(&self) -> Result<()> {
        if self.started.swap(true, Ordering::SeqCst) {
            return Err(crate::lifecycle_error!(
                "replication manager for {} already started",
                self.inner.config.context_name
            ));
        }

        let frequency = self.inner.config.process_expires_frequency;
        if !frequency.is_zero() {
            let inner = self.inner.clone();
            *self.sweeper.lock() = Some(tokio::spawn(async move {
                let mut ticker = time::interval(frequency);
                ticker.tick().await;
                loop {
                    ticker.tick().await;
                    inner.process_expires_at(now_ms()).await;
                }
            }));
        }

        self.inner.get_all_sessions().await;
        Ok(())
    }

    /// Stop the sweep. With `expire_sessions_on_shutdown` primary sessions are
    /// expired cluster-wide, otherwise local copies are simply dropped.
    pub async fn stop(&self) -> Result<()> {
        if !self.started.swap(false, Ordering::SeqCst) {
            return Err(crate::lifecycle_error!(
                "replication manager for {} not started",
                self.inner.config.context_name
            ));
        }
        if let Some(sweeper) = self.sweeper.lock().take() {
            sweeper.abort();
        }

        if self.inner.config.expire_sessions_on_shutdown {
            for session in self.inner.store.sessions() {
                if session.is_primary() {
                    let id = session.id();
                    session.expire(true);
                    self.inner
                        .broadcast(SessionEvent::Expired, &id, Vec::new())
                        .await;
                }
            }
        }
        let dropped = self.inner.store.len();
        self.inner.store.clear();
        self.inner.transferred_tx.send_replace(false);
        info!(
            "[{}] replication stopped, {} local session(s) dropped",
            self.inner.config.context_name, dropped
        );
        Ok(())
    }

    pub fn is_state_transferred(&self) -> bool {
        *self.inner.transferred_tx.borrow()
    }

    /// Create a primary session; it is sent to peers with the first completed request
    pub fn create_session(&self) -> Arc<ReplicatedSession> {
        let session = self.inner.store.create_session();
        self.inner.stats.sessions_created.fetch_add(1, Ordering::Relaxed);
        session.fire_created();
        self.inner.publish(SessionLifecycleEvent::Created {
            session_id: session.id(),
            primary: true,
        });
        session
    }

    pub fn find_session(&self, id: &str) -> Option<Arc<ReplicatedSession>> {
        self.inner.store.find_session(id)
    }

    pub fn session_count(&self) -> usize {
        self.inner.store.len()
    }

    pub fn session_ids(&self) -> Vec<String> {
        self.inner.store.ids()
    }

    pub fn registry(&self) -> &Arc<ListenerRegistry> {
        &self.inner.registry
    }

    /// Replicate whatever the finished request changed. Returns the message
    /// that was sent, if any.
    pub async fn request_completed(&self, session_id: &str) -> Result<Option<SessionMessage>> {
        self.inner.request_completed_at(session_id, now_ms()).await
    }

    pub async fn request_completed_at(&self, session_id: &str, now: i64) -> Result<Option<SessionMessage>> {
        self.inner.request_completed_at(session_id, now).await
    }

    /// Invalidate locally and tell peers
    pub async fn expire_session(&self, session_id: &str) -> bool {
        let Some(session) = self.inner.store.remove_session(session_id) else {
            return false;
        };
        let primary = session.is_primary();
        if !session.expire(true) {
            return false;
        }
        self.inner.stats.sessions_expired.fetch_add(1, Ordering::Relaxed);
        self.inner
            .broadcast(SessionEvent::Expired, session_id, Vec::new())
            .await;
        self.inner.publish(SessionLifecycleEvent::Expired {
            session_id: session_id.to_string(),
            primary,
        });
        true
    }

    /// Rename a session locally and on every peer
    pub async fn change_session_id(&self, old_id: &str, new_id: &str) -> Result<()> {
        self.inner.store.change_session_id(old_id, new_id)?;
        self.inner
            .broadcast(SessionEvent::ChangeSessionId, old_id, new_id.as_bytes().to_vec())
            .await;
        Ok(())
    }

    /// Promote a backup copy after its primary node has gone away
    pub fn take_primary(&self, session_id: &str) -> Result<()> {
        let session = self
            .inner
            .store
            .find_session(session_id)
            .ok_or_else(|| crate::error::RepliconError::Session(format!("no session {}", session_id)))?;
        if session.is_primary() {
            return Ok(());
        }
        session.set_primary(true);
        session.access_entry_at(now_ms());
        info!(
            "[{}] took primary ownership of session {}",
            self.inner.config.context_name, session_id
        );
        self.inner.publish(SessionLifecycleEvent::PrimaryTaken {
            session_id: session_id.to_string(),
        });
        Ok(())
    }

    /// Run one idle-expiry pass; returns the number of sessions expired
    pub async fn process_expires(&self) -> usize {
        self.inner.process_expires_at(now_ms()).await
    }

    pub async fn process_expires_at(&self, now: i64) -> usize {
        self.inner.process_expires_at(now).await
    }

    /// Apply one message received from a peer
    pub async fn handle_message(&self, received: ReceivedMessage) {
        self.inner.handle_message(received).await
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<SessionLifecycleEvent> {
        self.inner.events.subscribe()
    }

    pub fn get_stats(&self) -> FrozenManagerStats {
        self.inner.stats.freeze()
    }

    /// Adapter publishing [`SessionLifecycleEvent::MemberDeparted`] for
    /// membership changes
    pub fn membership_listener(&self) -> Arc<dyn MembershipListener> {
        Arc::new(DepartureListener {
            events: self.inner.events.clone(),
            context: self.inner.config.context_name.clone(),
        })
    }
}

impl Drop for ReplicationManager {
    fn drop(&mut self) {
        if let Some(sweeper) = self.sweeper.get_mut().take() {
            sweeper.abort();
        }
    }
}

struct DepartureListener {
    events: broadcast::Sender<SessionLifecycleEvent>,
    context: String,
}

impl MembershipListener for DepartureListener {
    fn member_added(&self, member: &Member) {
        debug!("[{}] member {} joined", self.context, member);
    }

    fn member_disappeared(&self, member: &Member) {
        info!("[{}] member {} departed", self.context, member);
        let _ = self.events.send(SessionLifecycleEvent::MemberDeparted {
            member: member.clone(),
        });
    }
}

impl ManagerInner {
    fn publish(&self, event: SessionLifecycleEvent) {
        // no receivers is fine
        let _ = self.events.send(event);
    }

    fn message(&self, event: SessionEvent, session_id: &str, body: Vec<u8>) -> SessionMessage {
        SessionMessage::new(event, self.config.context_name.clone(), session_id, body)
    }

    /// Members that receive broadcasts, honouring domain scoping
    fn replication_targets(&self) -> Vec<Member> {
        let members = self.channel.members();
        if !self.config.domain_replication {
            return members.as_ref().clone();
        }
        let local = self.channel.local_member();
        members
            .iter()
            .filter(|m| m.domain() == local.domain())
            .cloned()
            .collect()
    }

    async fn broadcast(&self, event: SessionEvent, session_id: &str, body: Vec<u8>) -> SessionMessage {
        let message = self.message(event, session_id, body);
        self.send_all(&message).await;
        message
    }

    /// Send to every replication target. Failures are logged and counted,
    /// never retried.
    async fn send_all(&self, message: &SessionMessage) {
        let targets = self.replication_targets();
        for member in &targets {
            self.send_one(message, member).await;
        }
        trace!("[{}] sent {} to {} member(s)", self.config.context_name, message, targets.len());
    }

    async fn send_one(&self, message: &SessionMessage, member: &Member) -> bool {
        match self.channel.send(message, member).await {
            Ok(()) => {
                self.stats.record_sent(message.event);
                true
            }
            Err(e) => {
                self.stats.send_failures.fetch_add(1, Ordering::Relaxed);
                warn!(
                    "[{}] unable to send {} to {}: {}",
                    self.config.context_name, message.event, member, e
                );
                false
            }
        }
    }

    fn mark_transferred(&self) {
        let started = self.transfer_started.lock().take();
        if let Some(started) = started {
            let elapsed = started.elapsed().as_millis() as u64;
            self.stats.state_transfer_ms.store(elapsed, Ordering::Relaxed);
        }
        self.transferred_tx.send_replace(true);
    }

    /// Ask one peer for its sessions and wait for the transfer, bounded by
    /// `state_transfer_timeout`. A timeout leaves the node running empty.
    async fn get_all_sessions(&self) {
        let context = &self.config.context_name;
        let Some(peer) = self.replication_targets().into_iter().next() else {
            info!("[{}] no cluster members, state transfer not required", context);
            self.mark_transferred();
            return;
        };

        let mut transferred = self.transferred_tx.subscribe();
        self.transferred_tx.send_replace(false);
        *self.transfer_started.lock() = Some(Instant::now());

        let request = self.message(SessionEvent::GetAllSessions, "GET-ALL", Vec::new());
        info!("[{}] requesting session state from {}", context, peer);
        if !self.send_one(&request, &peer).await {
            error!(
                "[{}] unable to request session state from {}, continuing without it",
                context, peer
            );
            return;
        }

        let wait = async {
            while !*transferred.borrow_and_update() {
                if transferred.changed().await.is_err() {
                    break;
                }
            }
        };
        match timeout(self.config.state_transfer_timeout, wait).await {
            Ok(()) => info!(
                "[{}] session state transferred from {} in {} ms",
                context,
                peer,
                self.stats.state_transfer_ms.load(Ordering::Relaxed)
            ),
            Err(_) => error!(
                "[{}] no session state received from {} within {:?}, continuing with an empty session set",
                context, peer, self.config.state_transfer_timeout
            ),
        }
    }

    async fn request_completed_at(&self, session_id: &str, now: i64) -> Result<Option<SessionMessage>> {
        let Some(session) = self.store.find_session(session_id) else {
            return Ok(None);
        };

        if !session.is_valid() {
            self.store.remove_session(session_id);
            let message = self.broadcast(SessionEvent::Expired, session_id, Vec::new()).await;
            return Ok(Some(message));
        }

        let message = if !session.replicated_once() {
            let snapshot = session.take_snapshot().serialize()?;
            self.message(SessionEvent::Created, session_id, snapshot)
        } else if session.is_dirty() {
            let diff = session.get_diff(&self.pool)?;
            self.message(SessionEvent::Delta, session_id, diff)
        } else if session.is_access_replicate_at(now) {
            self.message(SessionEvent::Accessed, session_id, Vec::new())
        } else {
            return Ok(None);
        };

        session.set_last_replicated(now);
        self.send_all(&message).await;
        self.publish(SessionLifecycleEvent::Replicated {
            session_id: session_id.to_string(),
            event: message.event,
        });
        Ok(Some(message))
    }

    async fn process_expires_at(&self, now: i64) -> usize {
        let mut expired = 0;
        for session in self.store.sessions() {
            match session.check_expiry_at(now) {
                Expiry::Valid => {}
                Expiry::Invalid => {
                    self.store.remove_session(&session.id());
                }
                Expiry::Expired { notify_cluster } => {
                    let id = session.id();
                    self.store.remove_session(&id);
                    expired += 1;
                    if notify_cluster {
                        self.broadcast(SessionEvent::Expired, &id, Vec::new()).await;
                    }
                    self.publish(SessionLifecycleEvent::Expired {
                        session_id: id,
                        primary: notify_cluster,
                    });
                }
            }
        }
        if expired > 0 {
            self.stats
                .sessions_expired
                .fetch_add(expired as u64, Ordering::Relaxed);
            debug!("[{}] expired {} idle session(s)", self.config.context_name, expired);
        }
        expired
    }

    async fn handle_message(&self, received: ReceivedMessage) {
        let ReceivedMessage { message, sender } = received;
        if !self.recent.lock().insert(&message.unique_id) {
            self.stats.duplicates_dropped.fetch_add(1, Ordering::Relaxed);
            trace!("[{}] dropping duplicate {}", self.config.context_name, message);
            return;
        }
        self.stats.record_received(message.event);
        debug!("[{}] received {} from {}", self.config.context_name, message, sender);

        let event = message.event;
        if let Err(e) = self.apply(message, &sender).await {
            error!(
                "[{}] failed to handle {} from {}: {}",
                self.config.context_name, event, sender, e
            );
        }
    }

    async fn apply(&self, message: SessionMessage, sender: &Member) -> Result<()> {
        let notify = self.config.notify_listeners_on_replication;
        match message.event {
            SessionEvent::Created => {
                let snapshot = SessionSnapshot::deserialize(&message.body)?;
                let session = Arc::new(ReplicatedSession::from_snapshot(
                    snapshot,
                    &self.registry,
                    self.config.record_all_actions,
                    self.config.tracker_pool_capacity,
                ));
                if notify {
                    session.fire_created();
                }
                self.store.add_session(session);
                self.publish(SessionLifecycleEvent::Created {
                    session_id: message.session_id,
                    primary: false,
                });
            }
            SessionEvent::Expired => {
                if let Some(session) = self.store.remove_session(&message.session_id) {
                    session.expire(notify);
                    self.publish(SessionLifecycleEvent::Expired {
                        session_id: message.session_id,
                        primary: false,
                    });
                }
            }
            SessionEvent::Accessed => {
                if let Some(session) = self.store.find_session(&message.session_id) {
                    session.access_entry_at(now_ms());
                    session.set_primary(false);
                }
            }
            SessionEvent::Delta => {
                let session = match self.store.find_session(&message.session_id) {
                    Some(session) => session,
                    None => {
                        debug!(
                            "[{}] delta for unknown session {}, creating backup",
                            self.config.context_name, message.session_id
                        );
                        self.store.create_with_id(&message.session_id)
                    }
                };
                session.apply_diff(&message.body, &self.registry, notify)?;
            }
            SessionEvent::GetAllSessions => self.send_all_sessions(sender).await?,
            SessionEvent::AllSessionData => {
                let batch = SessionBatch::deserialize(&message.body)?;
                let count = batch.sessions.len();
                for snapshot in batch.sessions {
                    let session = ReplicatedSession::from_snapshot(
                        snapshot,
                        &self.registry,
                        self.config.record_all_actions,
                        self.config.tracker_pool_capacity,
                    );
                    self.store.add_session(Arc::new(session));
                }
                info!(
                    "[{}] received {} session(s) from {}",
                    self.config.context_name, count, sender
                );
                self.mark_transferred();
            }
            SessionEvent::AllSessionTransferComplete => {
                debug!("[{}] state transfer from {} complete", self.config.context_name, sender);
                self.mark_transferred();
            }
            SessionEvent::ChangeSessionId => {
                let new_id = String::from_utf8(message.body).map_err(|e| {
                    crate::replication_error!("session id change with invalid id: {}", e)
                })?;
                self.store.change_session_id(&message.session_id, &new_id)?;
            }
            SessionEvent::NoContextManager => {
                warn!(
                    "[{}] {} has no manager for this context, continuing without its sessions",
                    self.config.context_name, sender
                );
                self.mark_transferred();
            }
        }
        Ok(())
    }

    /// Reply to a GET_ALL_SESSIONS request; goes to the requester only
    async fn send_all_sessions(&self, requester: &Member) -> Result<()> {
        let sessions: Vec<SessionSnapshot> = self
            .store
            .sessions()
            .iter()
            .filter(|s| s.is_valid())
            .map(|s| s.snapshot())
            .collect();
        let count = sessions.len();
        let body = SessionBatch { sessions }.serialize()?;

        let data = self.message(SessionEvent::AllSessionData, "SESSION-STATE", body);
        self.channel.send(&data, requester).await?;
        self.stats.record_sent(SessionEvent::AllSessionData);

        let complete = self.message(
            SessionEvent::AllSessionTransferComplete,
            "SESSION-STATE-TRANSFERED",
            Vec::new(),
        );
        self.channel.send(&complete, requester).await?;
        self.stats.record_sent(SessionEvent::AllSessionTransferComplete);

        info!(
            "[{}] sent {} session(s) to {}",
            self.config.context_name, count, requester
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tokio::sync::mpsc;

    use super::*;
    use crate::session::AttributeValue;
    use crate::transport::LocalHub;

    fn member(port: i32, id: u8) -> Member {
        Member::new("127.0.0.1".parse().unwrap(), port, [id; 16])
    }

    fn config() -> ReplicationConfig {
        ReplicationConfig {
            context_name: "/shop".to_string(),
            state_transfer_timeout: Duration::from_secs(2),
            process_expires_frequency: Duration::ZERO,
            max_inactive_interval: 30,
            ..ReplicationConfig::default()
        }
    }

    /// Manager on a hub, with its inbound traffic pumped into `handle_message`
    fn node(hub: &Arc<LocalHub>, port: i32) -> Arc<ReplicationManager> {
        let channel = Arc::new(hub.join(member(port, port as u8)));
        let (tx, mut rx) = mpsc::unbounded_channel();
        channel.subscribe(tx);
        let manager = Arc::new(ReplicationManager::new(
            config(),
            channel,
            Arc::new(ListenerRegistry::new()),
        ));
        let pump = manager.clone();
        tokio::spawn(async move {
            while let Some(received) = rx.recv().await {
                pump.handle_message(received).await;
            }
        });
        manager
    }

    #[test]
    fn test_recent_ids_window() {
        let mut recent = RecentIds::new(2);
        assert!(recent.insert("a"));
        assert!(!recent.insert("a"));
        assert!(recent.insert("b"));
        assert!(recent.insert("c"));
        assert!(recent.insert("a"));
    }

    #[tokio::test]
    async fn test_lone_node_completes_bootstrap_immediately() {
        let hub = LocalHub::new();
        let a = node(&hub, 4001);
        let started = Instant::now();
        a.start().await.unwrap();
        assert!(a.is_state_transferred());
        assert!(started.elapsed() < Duration::from_millis(500));
    }

    #[tokio::test]
    async fn test_first_replication_is_created_then_delta() {
        let hub = LocalHub::new();
        let a = node(&hub, 4001);
        let b = node(&hub, 4002);

        let session = a.create_session();
        let id = session.id();
        session.set_attribute("user", "alice".into()).unwrap();

        let sent = a.request_completed(&id).await.unwrap().unwrap();
        assert_eq!(sent.event, SessionEvent::Created);

        session.set_attribute("cart", AttributeValue::Int(2)).unwrap();
        let sent = a.request_completed(&id).await.unwrap().unwrap();
        assert_eq!(sent.event, SessionEvent::Delta);

        assert!(a.request_completed(&id).await.unwrap().is_none());

        tokio::time::sleep(Duration::from_millis(100)).await;
        let copy = b.find_session(&id).unwrap();
        assert!(!copy.is_primary());
        assert_eq!(copy.attribute("user"), Some("alice".into()));
        assert_eq!(copy.attribute("cart"), Some(AttributeValue::Int(2)));
    }

    #[tokio::test]
    async fn test_first_request_state_reaches_peer_whole() {
        let hub = LocalHub::new();
        let a = node(&hub, 4001);
        let b = node(&hub, 4002);

        let session = a.create_session();
        let id = session.id();
        session.set_auth_type(Some("FORM".into())).unwrap();
        session.set_attribute("user", "alice".into()).unwrap();
        session.set_note("login.page", "/signin".into()).unwrap();

        let sent = a.request_completed(&id).await.unwrap().unwrap();
        assert_eq!(sent.event, SessionEvent::Created);
        assert!(!session.is_dirty());
        assert!(a.request_completed(&id).await.unwrap().is_none());

        tokio::time::sleep(Duration::from_millis(100)).await;
        let copy = b.find_session(&id).unwrap();
        assert_eq!(copy.auth_type().as_deref(), Some("FORM"));
        assert_eq!(copy.attribute("user"), Some("alice".into()));
        assert_eq!(copy.note("login.page"), Some("/signin".into()));
    }

    #[tokio::test]
    async fn test_accessed_keeps_backup_alive() {
        let hub = LocalHub::new();
        let a = node(&hub, 4001);
        let b = node(&hub, 4002);

        let session = a.create_session();
        let id = session.id();
        a.request_completed(&id).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        // the backup last heard of the session 50s ago; 60s is its limit
        let copy = b.find_session(&id).unwrap();
        let now = now_ms();
        copy.access_entry_at(now - 50_000);

        // clean session, replicated more than 30s ago
        let sent = a
            .request_completed_at(&id, now + 31_000)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(sent.event, SessionEvent::Accessed);
        assert!(a.request_completed_at(&id, now + 32_000).await.unwrap().is_none());
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert_eq!(b.get_stats().received_of(SessionEvent::Accessed), 1);
        assert!(!copy.is_dirty());
        assert!(!copy.is_primary());
        assert_eq!(b.process_expires_at(now + 20_000).await, 0);
        assert!(b.find_session(&id).is_some());
    }

    #[tokio::test]
    async fn test_late_accessed_after_delta_keeps_delta_state() {
        let hub = LocalHub::new();
        let a = node(&hub, 4001);
        let b = node(&hub, 4002);
        let sender = a.inner.channel.local_member();

        let session = a.create_session();
        let id = session.id();
        a.request_completed(&id).await.unwrap();
        session.set_attribute("step", AttributeValue::Int(1)).unwrap();
        let accessed = SessionMessage::new(SessionEvent::Accessed, "/shop", id.clone(), Vec::new());
        let delta = a.request_completed(&id).await.unwrap().unwrap();
        assert_eq!(delta.event, SessionEvent::Delta);
        tokio::time::sleep(Duration::from_millis(50)).await;

        // an ACCESSED sent before the DELTA shows up after it
        b.handle_message(ReceivedMessage {
            message: accessed,
            sender,
        })
        .await;

        let copy = b.find_session(&id).unwrap();
        assert_eq!(copy.attribute("step"), Some(AttributeValue::Int(1)));
        assert!(!copy.is_dirty());
        assert!(!copy.is_primary());
    }

    #[tokio::test]
    async fn test_expire_session_reaches_peer() {
        let hub = LocalHub::new();
        let a = node(&hub, 4001);
        let b = node(&hub, 4002);

        let session = a.create_session();
        let id = session.id();
        a.request_completed(&id).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(b.find_session(&id).is_some());

        assert!(a.expire_session(&id).await);
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(b.find_session(&id).is_none());
    }

    #[tokio::test]
    async fn test_duplicate_messages_are_dropped() {
        let hub = LocalHub::new();
        let a = node(&hub, 4001);
        let sender = member(4009, 9);
        let message = SessionMessage::new(SessionEvent::Accessed, "/shop", "missing", Vec::new());

        a.handle_message(ReceivedMessage {
            message: message.clone(),
            sender: sender.clone(),
        })
        .await;
        a.handle_message(ReceivedMessage { message, sender }).await;

        let stats = a.get_stats();
        assert_eq!(stats.received_of(SessionEvent::Accessed), 1);
        assert_eq!(stats.duplicates_dropped, 1);
    }

    #[tokio::test]
    async fn test_take_primary_publishes_event() {
        let hub = LocalHub::new();
        let a = node(&hub, 4001);
        let mut events = a.subscribe_events();
        let session = a.inner.store.create_with_id("backup");
        session.set_primary(false);

        a.take_primary("backup").unwrap();
        assert!(session.is_primary());
        assert_eq!(
            events.recv().await.unwrap(),
            SessionLifecycleEvent::PrimaryTaken {
                session_id: "backup".to_string()
            }
        );
    }

    #[tokio::test]
    async fn test_change_session_id_propagates() {
        let hub = LocalHub::new();
        let a = node(&hub, 4001);
        let b = node(&hub, 4002);

        let session = a.create_session();
        let old = session.id();
        a.request_completed(&old).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        a.change_session_id(&old, "renamed").await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(b.find_session(&old).is_none());
        assert_eq!(b.find_session("renamed").unwrap().id(), "renamed");
    }
}
