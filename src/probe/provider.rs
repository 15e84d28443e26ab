//! Active-probe membership provider
//!
//! For networks without multicast: a static peer list is probed over the TCP
//! channel with START / STOP / PING request-reply messages. Replies feed the
//! same `member_alive` path the heartbeat receiver uses. A peer whose RPC
//! fails is reported as a [`FaultyMember`] and removed at once.
use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::{self, timeout};
use tracing::{debug, error, info, warn};

use super::messages::{ProbeKind, ProbeMessage, ProbeReply};
use crate::error::{FaultyMember, ProbeError, Result};
use crate::membership::{Member, MembershipHandle};
use crate::settings::ProbeConfig;
use crate::transport::{ClusterChannel, TcpChannel, TcpRequest};

/// Outcome of one probe round
#[derive(Debug, Default)]
pub struct ProbeReport {
    pub responded: Vec<Member>,
    pub faulty: Vec<FaultyMember>,
    pub unreachable: Vec<SocketAddr>,
}

impl ProbeReport {
    pub fn into_result(self) -> std::result::Result<Vec<Member>, ProbeError> {
        if self.faulty.is_empty() {
            Ok(self.responded)
        } else {
            Err(ProbeError::FaultyMembers(self.faulty))
        }
    }
}

struct ProbeInner {
    config: ProbeConfig,
    channel: Arc<TcpChannel>,
    membership: MembershipHandle,
}

pub struct StaticMembershipProvider {
    inner: Arc<ProbeInner>,
    responder: parking_lot::Mutex<Option<JoinHandle<()>>>,
    pinger: parking_lot::Mutex<Option<JoinHandle<()>>>,
}

impl std::fmt::Debug for StaticMembershipProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StaticMembershipProvider")
            .field("local", &self.inner.membership.local_member().name())
            .field("static_members", &self.inner.config.static_members)
            .finish()
    }
}

impl StaticMembershipProvider {
    pub fn new(config: ProbeConfig, channel: Arc<TcpChannel>) -> Self {
        let membership = channel.membership().clone();
        Self {
            inner: Arc::new(ProbeInner {
                config,
                channel,
                membership,
            }),
            responder: parking_lot::Mutex::new(None),
            pinger: parking_lot::Mutex::new(None),
        }
    }

    /// Answer probes from peers, then announce START to every reachable peer.
    pub async fn start(&self) -> Result<ProbeReport> {
        {
            let mut responder = self.responder.lock();
            if responder.is_some() {
                return Err(crate::lifecycle_error!("probe provider already started"));
            }
            let (tx, rx) = mpsc::channel(256);
            self.inner.channel.set_rpc_handler(tx);
            *responder = Some(tokio::spawn(respond_loop(self.inner.clone(), rx)));
        }

        let report = self.inner.probe_round(ProbeKind::Start).await?;
        info!(
            "[{}] probe start: {} responded, {} faulty, {} unreachable",
            self.inner.membership.local_member(),
            report.responded.len(),
            report.faulty.len(),
            report.unreachable.len()
        );

        if self.inner.config.use_thread {
            let inner = self.inner.clone();
            let interval = self.inner.config.ping_interval;
            *self.pinger.lock() = Some(tokio::spawn(async move {
                let mut ticker = time::interval(interval);
                ticker.tick().await;
                loop {
                    ticker.tick().await;
                    if let Err(e) = inner.ping().await {
                        error!("Probe ping failed: {}", e);
                    }
                }
            }));
        }
        Ok(report)
    }

    /// One ping round plus expiry. Call this periodically when `use_thread` is off.
    pub async fn ping(&self) -> Result<ProbeReport> {
        self.inner.ping().await
    }

    /// Send STOP to every known member and stop answering probes
    pub async fn stop(&self) -> Result<ProbeReport> {
        if let Some(pinger) = self.pinger.lock().take() {
            pinger.abort();
        }
        let members = self.inner.membership.members();
        let targets: Vec<SocketAddr> = members.iter().filter_map(Member::socket_addr).collect();
        let report = self.inner.send_to(ProbeKind::Stop, targets).await?;
        if let Some(responder) = self.responder.lock().take() {
            responder.abort();
        }
        Ok(report)
    }

    pub fn membership(&self) -> &MembershipHandle {
        &self.inner.membership
    }
}

impl Drop for StaticMembershipProvider {
    fn drop(&mut self) {
        if let Some(pinger) = self.pinger.get_mut().take() {
            pinger.abort();
        }
        if let Some(responder) = self.responder.get_mut().take() {
            responder.abort();
        }
    }
}

impl ProbeInner {
    async fn ping(&self) -> Result<ProbeReport> {
        let report = self.probe_round(ProbeKind::Ping).await?;
        let expired = self.membership.expire(self.config.expiration_time).await?;
        for member in expired {
            info!("[{}] probe expired member {}", self.membership.local_member(), member);
        }
        Ok(report)
    }

    /// Pre-check reachability of the static list, then RPC the reachable ones
    async fn probe_round(&self, kind: ProbeKind) -> Result<ProbeReport> {
        let own = self.channel.listen_addr();
        let mut reachable = Vec::new();
        let mut unreachable = Vec::new();
        for addr in self.config.static_members.iter().copied().filter(|a| *a != own) {
            if self.is_reachable(addr).await {
                reachable.push(addr);
            } else {
                debug!("static member {} unreachable, skipping {:?}", addr, kind);
                unreachable.push(addr);
            }
        }
        let mut report = self.send_to(kind, reachable).await?;
        report.unreachable = unreachable;
        Ok(report)
    }

    async fn is_reachable(&self, addr: SocketAddr) -> bool {
        matches!(
            timeout(self.config.connect_timeout, TcpStream::connect(addr)).await,
            Ok(Ok(_))
        )
    }

    async fn send_to(&self, kind: ProbeKind, targets: Vec<SocketAddr>) -> Result<ProbeReport> {
        let local = self.channel.local_member();
        let payload = ProbeMessage::new(&self.config.membership_id, kind, &local)?.serialize()?;

        let mut calls = JoinSet::new();
        for addr in targets {
            let channel = self.channel.clone();
            let payload = payload.clone();
            let rpc_timeout = self.config.rpc_timeout;
            calls.spawn(async move { (addr, channel.rpc(addr, payload, rpc_timeout).await) });
        }

        let mut report = ProbeReport::default();
        while let Some(joined) = calls.join_next().await {
            let (addr, outcome) = match joined {
                Ok(result) => result,
                Err(e) => {
                    error!("Probe task failed: {}", e);
                    continue;
                }
            };
            match outcome.and_then(|data| ProbeReply::deserialize(&data)) {
                Ok(ProbeReply::Ack { member }) => match Member::from_frame(&member) {
                    Ok(member) => {
                        if kind != ProbeKind::Stop {
                            self.membership.member_alive(member.clone()).await?;
                        }
                        report.responded.push(member);
                    }
                    Err(e) => report.faulty.push(self.fault(addr, format!("bad member frame: {}", e))),
                },
                Ok(ProbeReply::ForeignGroup) => {
                    debug!("{} belongs to another membership group", addr);
                }
                Err(e) => report.faulty.push(self.fault(addr, e.to_string())),
            }
        }

        for faulty in &report.faulty {
            warn!(
                "[{}] {:?} to {} failed, removing: {}",
                local, kind, faulty.member, faulty.reason
            );
            self.membership.remove_member(faulty.member.clone()).await?;
            self.channel.forget_peer(&faulty.member);
        }
        Ok(report)
    }

    /// Resolve an address to the known member record, or a bare stand-in
    fn fault(&self, addr: SocketAddr, reason: String) -> FaultyMember {
        let member = self
            .membership
            .members()
            .iter()
            .find(|m| m.socket_addr() == Some(addr))
            .cloned()
            .unwrap_or_else(|| Member::new(addr.ip(), i32::from(addr.port()), [0; 16]));
        FaultyMember { member, reason }
    }

    async fn respond(&self, data: &[u8]) -> Result<ProbeReply> {
        let message = ProbeMessage::deserialize(data)?;
        if message.membership_id != self.config.membership_id {
            return Ok(ProbeReply::ForeignGroup);
        }
        let sender = message.sender()?;
        match message.kind {
            ProbeKind::Start | ProbeKind::Ping => {
                self.membership.member_alive(sender).await?;
            }
            ProbeKind::Stop => {
                info!("[{}] received STOP from {}", self.membership.local_member(), sender);
                self.membership.remove_member(sender).await?;
            }
        }
        Ok(ProbeReply::Ack {
            member: self.channel.local_member().to_frame()?,
        })
    }
}

async fn respond_loop(inner: Arc<ProbeInner>, mut rx: mpsc::Receiver<TcpRequest>) {
    while let Some(request) = rx.recv().await {
        let reply = match inner.respond(&request.data).await.and_then(|r| r.serialize()) {
            Ok(reply) => reply,
            Err(e) => {
                warn!("Unable to answer probe from {}: {}", request.peer_addr, e);
                // dropping the response channel closes the exchange on the caller
                continue;
            }
        };
        let _ = request.response_tx.send(reply);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_report_into_result() {
        let ok = ProbeReport::default();
        assert!(ok.into_result().unwrap().is_empty());

        let member = Member::new("127.0.0.1".parse().unwrap(), 4000, [1; 16]);
        let bad = ProbeReport {
            faulty: vec![FaultyMember {
                member,
                reason: "timeout".to_string(),
            }],
            ..ProbeReport::default()
        };
        match bad.into_result() {
            Err(ProbeError::FaultyMembers(f)) => assert_eq!(f.len(), 1),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_probe_message_carries_member() {
        let member = Member::new("127.0.0.1".parse().unwrap(), 4000, [1; 16]);
        let msg = ProbeMessage::new(b"group", ProbeKind::Ping, &member).unwrap();
        let decoded = ProbeMessage::deserialize(&msg.serialize().unwrap()).unwrap();
        assert_eq!(decoded.kind, ProbeKind::Ping);
        assert_eq!(decoded.sender().unwrap(), member);
    }
}
