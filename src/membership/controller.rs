//! Membership controller
//!
//! Single owner of the [`Membership`] table. Heartbeat and probe tasks talk to it
//! through [`MembershipHandle`]; readers take lock-free snapshots from a watch
//! channel. Listener callbacks run on the blocking pool, in order, so slow
//! listener code never stalls a receive loop.
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, error, info};

use super::member::Member;
use super::table::Membership;
use crate::error::{RepliconError, Result};

/// Callbacks fired when the live member set changes
pub trait MembershipListener: Send + Sync + 'static {
    fn member_added(&self, member: &Member);
    fn member_disappeared(&self, member: &Member);
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum MembershipEvent {
    Added(Member),
    Disappeared(Member),
}

#[derive(Debug)]
pub enum MembershipCommand {
    MemberAlive {
        member: Member,
        resp_chan: oneshot::Sender<bool>,
    },
    RemoveMember {
        member: Member,
        resp_chan: oneshot::Sender<bool>,
    },
    Expire {
        max_age: Duration,
        resp_chan: oneshot::Sender<Vec<Member>>,
    },
    AddListener {
        listener: Arc<dyn MembershipListener>,
    },
}

impl std::fmt::Debug for dyn MembershipListener {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "MembershipListener")
    }
}

pub struct MembershipController {
    membership: Membership,
    snapshot_tx: watch::Sender<Arc<Vec<Member>>>,
    event_tx: mpsc::UnboundedSender<MembershipEvent>,
    listeners: Arc<parking_lot::RwLock<Vec<Arc<dyn MembershipListener>>>>,
}

impl MembershipController {
    /// Spawn the controller and its listener dispatcher
    pub fn start(local: Member) -> MembershipHandle {
        let (cmd_tx, cmd_rx) = mpsc::channel(1000);
        let (snapshot_tx, snapshot_rx) = watch::channel(Arc::new(Vec::new()));
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let listeners = Arc::new(parking_lot::RwLock::new(Vec::new()));
        let local_name = local.name();

        let controller = Self {
            membership: Membership::new(local.clone()),
            snapshot_tx,
            event_tx,
            listeners: listeners.clone(),
        };
        tokio::spawn(controller.run(cmd_rx));
        tokio::spawn(dispatch_events(local_name, event_rx, listeners));

        MembershipHandle {
            local,
            cmd_tx,
            snapshot_rx,
        }
    }

    async fn run(mut self, mut cmd_rx: mpsc::Receiver<MembershipCommand>) {
        let name = self.membership.local_member().name();
        info!("[{}] membership controller started", name);
        loop {
            tokio::select! {
                Some(cmd) = cmd_rx.recv() => self.handle_command(cmd),
                else => {
                    info!("[{}] membership command channel closed, exiting", name);
                    break;
                }
            }
        }
    }

    fn handle_command(&mut self, cmd: MembershipCommand) {
        match cmd {
            MembershipCommand::MemberAlive { member, resp_chan } => {
                let is_new = self.membership.member_alive(member.clone());
                if is_new {
                    info!(
                        "[{}] member added: {}",
                        self.membership.local_member(),
                        member
                    );
                    self.notify(MembershipEvent::Added(member));
                }
                self.publish();
                let _ = resp_chan.send(is_new);
            }
            MembershipCommand::RemoveMember { member, resp_chan } => {
                let removed = self.membership.remove_member(&member);
                let was_present = removed.is_some();
                if let Some(member) = removed {
                    info!(
                        "[{}] member removed: {}",
                        self.membership.local_member(),
                        member
                    );
                    self.publish();
                    self.notify(MembershipEvent::Disappeared(member));
                }
                let _ = resp_chan.send(was_present);
            }
            MembershipCommand::Expire { max_age, resp_chan } => {
                let expired = self.membership.expire(max_age);
                if !expired.is_empty() {
                    self.publish();
                    for member in &expired {
                        info!(
                            "[{}] member expired after {:?} of silence: {}",
                            self.membership.local_member(),
                            max_age,
                            member
                        );
                        self.notify(MembershipEvent::Disappeared(member.clone()));
                    }
                }
                let _ = resp_chan.send(expired);
            }
            MembershipCommand::AddListener { listener } => {
                self.listeners.write().push(listener);
            }
        }
    }

    fn publish(&self) {
        self.snapshot_tx.send_replace(self.membership.members());
    }

    fn notify(&self, event: MembershipEvent) {
        if self.event_tx.send(event).is_err() {
            debug!("membership event dispatcher gone");
        }
    }
}

async fn dispatch_events(
    name: String,
    mut event_rx: mpsc::UnboundedReceiver<MembershipEvent>,
    listeners: Arc<parking_lot::RwLock<Vec<Arc<dyn MembershipListener>>>>,
) {
    while let Some(event) = event_rx.recv().await {
        let current: Vec<Arc<dyn MembershipListener>> = listeners.read().clone();
        if current.is_empty() {
            continue;
        }
        let outcome = tokio::task::spawn_blocking(move || {
            for listener in current {
                match &event {
                    MembershipEvent::Added(m) => listener.member_added(m),
                    MembershipEvent::Disappeared(m) => listener.member_disappeared(m),
                }
            }
        })
        .await;
        if let Err(e) = outcome {
            error!("[{}] membership listener panicked: {}", name, e);
        }
    }
}

/// Cloneable front door to the membership controller
#[derive(Clone, Debug)]
pub struct MembershipHandle {
    local: Member,
    cmd_tx: mpsc::Sender<MembershipCommand>,
    snapshot_rx: watch::Receiver<Arc<Vec<Member>>>,
}

impl MembershipHandle {
    pub fn local_member(&self) -> &Member {
        &self.local
    }

    pub async fn member_alive(&self, member: Member) -> Result<bool> {
        let (resp_chan, rx) = oneshot::channel();
        self.send(MembershipCommand::MemberAlive { member, resp_chan })
            .await?;
        rx.await.map_err(|_| controller_gone())
    }

    pub async fn remove_member(&self, member: Member) -> Result<bool> {
        let (resp_chan, rx) = oneshot::channel();
        self.send(MembershipCommand::RemoveMember { member, resp_chan })
            .await?;
        rx.await.map_err(|_| controller_gone())
    }

    pub async fn expire(&self, max_age: Duration) -> Result<Vec<Member>> {
        let (resp_chan, rx) = oneshot::channel();
        self.send(MembershipCommand::Expire { max_age, resp_chan })
            .await?;
        rx.await.map_err(|_| controller_gone())
    }

    pub async fn add_listener(&self, listener: Arc<dyn MembershipListener>) -> Result<()> {
        self.send(MembershipCommand::AddListener { listener }).await
    }

    /// Current copy-on-write member list, longest-lived first
    pub fn members(&self) -> Arc<Vec<Member>> {
        self.snapshot_rx.borrow().clone()
    }

    pub fn has_members(&self) -> bool {
        !self.snapshot_rx.borrow().is_empty()
    }

    pub fn subscribe(&self) -> watch::Receiver<Arc<Vec<Member>>> {
        self.snapshot_rx.clone()
    }

    async fn send(&self, cmd: MembershipCommand) -> Result<()> {
        self.cmd_tx.send(cmd).await.map_err(|_| controller_gone())
    }
}

fn controller_gone() -> RepliconError {
    crate::lifecycle_error!("membership controller is not running")
}
