//! Cluster channel abstraction consumed by the replication layer
use std::sync::Arc;

use async_trait::async_trait;
use bincode::{Decode, Encode};
use tokio::sync::mpsc;

use crate::error::Result;
use crate::membership::Member;
use crate::replication::SessionMessage;

/// A session message together with the member that sent it
#[derive(Clone, Debug)]
pub struct ReceivedMessage {
    pub message: SessionMessage,
    pub sender: Member,
}

#[derive(Clone, Debug)]
pub enum Target {
    Member(Member),
    All,
}

/// Envelope carried by every TCP channel frame
#[derive(Clone, Debug, Encode, Decode)]
pub enum ChannelFrame {
    /// Session traffic; `sender` is the sender's member announcement frame
    Session {
        sender: Vec<u8>,
        message: SessionMessage,
    },
    /// Opaque request/reply payload (membership probes)
    Rpc(Vec<u8>),
}

#[async_trait]
pub trait ClusterChannel: Send + Sync + 'static {
    /// The member this channel sends as
    fn local_member(&self) -> Member;

    /// Members currently reachable through this channel, excluding ourselves
    fn members(&self) -> Arc<Vec<Member>>;

    /// Send to a single member
    async fn send(&self, message: &SessionMessage, target: &Member) -> Result<()>;

    /// Send to every member. All members are attempted even if some fail.
    async fn broadcast(&self, message: &SessionMessage) -> Result<()>;

    /// Register a sink for inbound session messages
    fn subscribe(&self, sink: mpsc::UnboundedSender<ReceivedMessage>);

    async fn send_to(&self, message: &SessionMessage, target: &Target) -> Result<()> {
        match target {
            Target::Member(member) => self.send(message, member).await,
            Target::All => self.broadcast(message).await,
        }
    }
}

/// Fan a received message out to live subscribers, forgetting closed ones
pub(crate) fn deliver(
    subscribers: &parking_lot::RwLock<Vec<mpsc::UnboundedSender<ReceivedMessage>>>,
    received: ReceivedMessage,
) -> usize {
    let mut subs = subscribers.write();
    subs.retain(|tx| tx.send(received.clone()).is_ok());
    subs.len()
}
