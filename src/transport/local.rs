//! In-process cluster channel
//!
//! Every channel joined to the same [`LocalHub`] sees the others as members.
//! Used by tests and single-process demos.
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::RwLock;
use tokio::sync::mpsc;

use super::channel::{deliver, ClusterChannel, ReceivedMessage};
use crate::error::Result;
use crate::membership::{by_alive_time, Member};
use crate::replication::SessionMessage;

type Sinks = Arc<RwLock<Vec<mpsc::UnboundedSender<ReceivedMessage>>>>;

#[derive(Debug, Default)]
pub struct LocalHub {
    nodes: DashMap<Member, Sinks>,
}

impl LocalHub {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn join(self: &Arc<Self>, member: Member) -> LocalChannel {
        self.nodes
            .entry(member.clone())
            .or_insert_with(|| Arc::new(RwLock::new(Vec::new())));
        LocalChannel {
            hub: self.clone(),
            local: member,
        }
    }

    pub fn leave(&self, member: &Member) {
        self.nodes.remove(member);
    }

    fn members_except(&self, local: &Member) -> Vec<Member> {
        let mut members: Vec<Member> = self
            .nodes
            .iter()
            .map(|entry| entry.key().clone())
            .filter(|member| member != local)
            .collect();
        members.sort_by(by_alive_time);
        members
    }

    fn sinks_of(&self, member: &Member) -> Option<Sinks> {
        self.nodes.get(member).map(|entry| entry.value().clone())
    }
}

#[derive(Clone, Debug)]
pub struct LocalChannel {
    hub: Arc<LocalHub>,
    local: Member,
}

impl LocalChannel {
    pub fn hub(&self) -> &Arc<LocalHub> {
        &self.hub
    }
}

#[async_trait]
impl ClusterChannel for LocalChannel {
    fn local_member(&self) -> Member {
        self.local.clone()
    }

    fn members(&self) -> Arc<Vec<Member>> {
        Arc::new(self.hub.members_except(&self.local))
    }

    async fn send(&self, message: &SessionMessage, target: &Member) -> Result<()> {
        let sinks = self
            .hub
            .sinks_of(target)
            .ok_or_else(|| crate::transport_error!("Member {} is not on this hub", target))?;
        let mut message = message.clone();
        message.stamp();
        deliver(
            &sinks,
            ReceivedMessage {
                message,
                sender: self.local.clone(),
            },
        );
        Ok(())
    }

    async fn broadcast(&self, message: &SessionMessage) -> Result<()> {
        for member in self.hub.members_except(&self.local) {
            self.send(message, &member).await?;
        }
        Ok(())
    }

    fn subscribe(&self, sink: mpsc::UnboundedSender<ReceivedMessage>) {
        if let Some(sinks) = self.hub.sinks_of(&self.local) {
            sinks.write().push(sink);
        }
    }
}
