//! TCP cluster channel
//!
//! One listener per node, advertised as the member's TCP port. Session frames
//! are fanned out to subscribers and acknowledged with an empty reply; RPC
//! frames are handed to the registered RPC handler, which owns the reply.
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::RwLock;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::channel::{deliver, ChannelFrame, ClusterChannel, ReceivedMessage};
use super::connection_pool::{FrozenPoolStats, TcpConnectionPool};
use super::tcp_receiver::{FrozenReceiverStats, TcpReceiver, TcpRequest};
use crate::error::Result;
use crate::membership::{Member, MembershipController, MembershipHandle};
use crate::replication::SessionMessage;
use crate::session::now_ms;
use crate::settings::LocalMemberConfig;

pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_millis(500);
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_millis(3000);

type Subscribers = Arc<RwLock<Vec<mpsc::UnboundedSender<ReceivedMessage>>>>;
type RpcHandler = Arc<RwLock<Option<mpsc::Sender<TcpRequest>>>>;

pub struct TcpChannel {
    membership: MembershipHandle,
    local_frame: Vec<u8>,
    pool: TcpConnectionPool,
    subscribers: Subscribers,
    rpc_handler: RpcHandler,
    receiver: TcpReceiver,
    dispatch_task: JoinHandle<()>,
}

impl std::fmt::Debug for TcpChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TcpChannel")
            .field("local", &self.membership.local_member().name())
            .field("listen_addr", &self.receiver.local_addr)
            .finish()
    }
}

impl TcpChannel {
    /// Bind the listener, derive the local member from the bound address and
    /// start the membership controller for it.
    pub async fn start(config: &LocalMemberConfig) -> Result<Self> {
        Self::start_with_timeouts(config, DEFAULT_CONNECT_TIMEOUT, DEFAULT_REQUEST_TIMEOUT).await
    }

    pub async fn start_with_timeouts(
        config: &LocalMemberConfig,
        connect_timeout: Duration,
        request_timeout: Duration,
    ) -> Result<Self> {
        let (request_tx, request_rx) = mpsc::channel(1000);
        let receiver = TcpReceiver::start(config.listen_addr(), request_tx).await?;

        let mut advertised = config.clone();
        advertised.tcp_listen_port = receiver.local_addr.port();
        let mut local = Member::local(&advertised);
        local.set_service_start(Some(now_ms()));
        let local_frame = local.to_frame()?;
        info!("[{}] cluster channel listening on {}", local, receiver.local_addr);

        let membership = MembershipController::start(local);
        let subscribers: Subscribers = Arc::new(RwLock::new(Vec::new()));
        let rpc_handler: RpcHandler = Arc::new(RwLock::new(None));
        let dispatch_task = tokio::spawn(dispatch_requests(
            request_rx,
            subscribers.clone(),
            rpc_handler.clone(),
        ));

        Ok(Self {
            membership,
            local_frame,
            pool: TcpConnectionPool::new(connect_timeout, request_timeout),
            subscribers,
            rpc_handler,
            receiver,
            dispatch_task,
        })
    }

    pub fn membership(&self) -> &MembershipHandle {
        &self.membership
    }

    pub fn listen_addr(&self) -> SocketAddr {
        self.receiver.local_addr
    }

    /// Route inbound RPC frames to `handler`
    pub fn set_rpc_handler(&self, handler: mpsc::Sender<TcpRequest>) {
        *self.rpc_handler.write() = Some(handler);
    }

    /// Request/reply exchange carrying an opaque payload
    pub async fn rpc(&self, target: SocketAddr, payload: Vec<u8>, rpc_timeout: Duration) -> Result<Vec<u8>> {
        let frame = crate::codec::encode(&ChannelFrame::Rpc(payload))?;
        self.pool
            .request_with_timeout(target, &frame, rpc_timeout)
            .await
    }

    pub fn forget_peer(&self, member: &Member) {
        if let Some(addr) = member.socket_addr() {
            self.pool.remove_peer(&addr);
        }
    }

    pub fn pool_stats(&self) -> FrozenPoolStats {
        self.pool.get_stats()
    }

    pub fn receiver_stats(&self) -> FrozenReceiverStats {
        self.receiver.get_stats()
    }
}

impl Drop for TcpChannel {
    fn drop(&mut self) {
        self.dispatch_task.abort();
    }
}

#[async_trait]
impl ClusterChannel for TcpChannel {
    /// The local record with its alive time measured from channel start
    fn local_member(&self) -> Member {
        let mut local = self.membership.local_member().clone();
        local.refresh_alive_time(now_ms());
        local
    }

    fn members(&self) -> Arc<Vec<Member>> {
        self.membership.members()
    }

    async fn send(&self, message: &SessionMessage, target: &Member) -> Result<()> {
        let addr = target
            .socket_addr()
            .ok_or_else(|| crate::transport_error!("Member {} has no routable address", target))?;
        let mut message = message.clone();
        message.stamp();
        let frame = crate::codec::encode(&ChannelFrame::Session {
            sender: self.local_frame.clone(),
            message,
        })?;
        self.pool.request(addr, &frame).await?;
        Ok(())
    }

    async fn broadcast(&self, message: &SessionMessage) -> Result<()> {
        let members = self.members();
        let mut failed = Vec::new();
        for member in members.iter() {
            if let Err(e) = self.send(message, member).await {
                warn!("Unable to send {} to {}: {}", message.event, member, e);
                failed.push(member.name());
            }
        }
        if failed.is_empty() {
            Ok(())
        } else {
            Err(crate::transport_error!(
                "broadcast failed for {} member(s): {}",
                failed.len(),
                failed.join(", ")
            ))
        }
    }

    fn subscribe(&self, sink: mpsc::UnboundedSender<ReceivedMessage>) {
        self.subscribers.write().push(sink);
    }
}

async fn dispatch_requests(
    mut request_rx: mpsc::Receiver<TcpRequest>,
    subscribers: Subscribers,
    rpc_handler: RpcHandler,
) {
    while let Some(request) = request_rx.recv().await {
        let frame: ChannelFrame = match crate::codec::decode(&request.data) {
            Ok(frame) => frame,
            Err(e) => {
                warn!("Dropping undecodable frame from {}: {}", request.peer_addr, e);
                continue;
            }
        };

        match frame {
            ChannelFrame::Session { sender, message } => {
                let sender = match Member::from_frame(&sender) {
                    Ok(member) => member,
                    Err(e) => {
                        warn!("Dropping session message with bad sender from {}: {}", request.peer_addr, e);
                        continue;
                    }
                };
                let _ = request.response_tx.send(Vec::new());
                if deliver(&subscribers, ReceivedMessage { message, sender }) == 0 {
                    debug!("No subscribers for session message from {}", request.peer_addr);
                }
            }
            ChannelFrame::Rpc(payload) => {
                let handler = rpc_handler.read().clone();
                match handler {
                    Some(handler) => {
                        let forwarded = TcpRequest {
                            data: bytes::Bytes::from(payload),
                            peer_addr: request.peer_addr,
                            response_tx: request.response_tx,
                        };
                        if handler.send(forwarded).await.is_err() {
                            debug!("RPC handler gone, dropping request from {}", request.peer_addr);
                        }
                    }
                    None => debug!("No RPC handler, dropping request from {}", request.peer_addr),
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use tokio::time::timeout;

    use super::*;
    use crate::replication::SessionEvent;

    fn loopback() -> LocalMemberConfig {
        LocalMemberConfig {
            tcp_listen_host: "127.0.0.1".parse().unwrap(),
            tcp_listen_port: 0,
            ..LocalMemberConfig::default()
        }
    }

    #[tokio::test]
    async fn test_local_member_advertises_bound_port() {
        let channel = TcpChannel::start(&loopback()).await.unwrap();
        assert_eq!(
            channel.local_member().socket_addr(),
            Some(channel.listen_addr())
        );
    }

    #[tokio::test]
    async fn test_local_member_alive_time_advances() {
        let channel = TcpChannel::start(&loopback()).await.unwrap();
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(channel.local_member().member_alive_time() >= 30);
    }

    #[tokio::test]
    async fn test_send_reaches_subscriber_with_sender() {
        let a = TcpChannel::start(&loopback()).await.unwrap();
        let b = TcpChannel::start(&loopback()).await.unwrap();
        let (tx, mut rx) = mpsc::unbounded_channel();
        b.subscribe(tx);

        let msg = SessionMessage::new(SessionEvent::Accessed, "/app", "abc", Vec::new());
        a.send(&msg, &b.local_member()).await.unwrap();

        let received = timeout(Duration::from_secs(1), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(received.sender, a.local_member());
        assert_eq!(received.message.session_id, "abc");
        assert!(received.message.timestamp > 0);
    }

    #[tokio::test]
    async fn test_broadcast_with_no_members_is_ok() {
        let a = TcpChannel::start(&loopback()).await.unwrap();
        let msg = SessionMessage::new(SessionEvent::Expired, "/app", "abc", Vec::new());
        assert!(a.broadcast(&msg).await.is_ok());
    }
}
