//! Heartbeat service
//!
//! Two halves, started and stopped independently through a level bitmask:
//! the send half announces the local member every `mcast_frequency`, the
//! receive half feeds announcements into the membership controller and runs
//! the expiry check after every receive cycle.
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::net::UdpSocket;
use tokio::task::JoinHandle;
use tokio::time::{self, sleep, timeout};
use tracing::{debug, error, info, trace, warn};

use super::socket::{self, SocketRole};
use crate::error::Result;
use crate::membership::{Member, MembershipHandle, MAX_PACKET_SIZE, MEMBER_BEGIN, SHUTDOWN_PAYLOAD};
use crate::settings::HeartbeatConfig;

/// Start/stop level for the receive half
pub const MBR_RX_SEQ: u32 = 4;
/// Start/stop level for the send half
pub const MBR_TX_SEQ: u32 = 8;
pub const MBR_ALL_SEQ: u32 = MBR_RX_SEQ | MBR_TX_SEQ;

const RECEIVE_ERROR_BACKOFF: Duration = Duration::from_millis(500);

#[derive(Debug, Default)]
pub struct HeartbeatStats {
    pub frames_sent: AtomicU64,
    pub frames_received: AtomicU64,
    pub frames_rejected: AtomicU64,
    pub foreign_packets: AtomicU64,
    pub send_errors: AtomicU64,
    pub receive_errors: AtomicU64,
    pub recoveries: AtomicU64,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct FrozenHeartbeatStats {
    pub frames_sent: u64,
    pub frames_received: u64,
    pub frames_rejected: u64,
    pub foreign_packets: u64,
    pub send_errors: u64,
    pub receive_errors: u64,
    pub recoveries: u64,
}

impl HeartbeatStats {
    pub fn freeze(&self) -> FrozenHeartbeatStats {
        FrozenHeartbeatStats {
            frames_sent: self.frames_sent.load(Ordering::Relaxed),
            frames_received: self.frames_received.load(Ordering::Relaxed),
            frames_rejected: self.frames_rejected.load(Ordering::Relaxed),
            foreign_packets: self.foreign_packets.load(Ordering::Relaxed),
            send_errors: self.send_errors.load(Ordering::Relaxed),
            receive_errors: self.receive_errors.load(Ordering::Relaxed),
            recoveries: self.recoveries.load(Ordering::Relaxed),
        }
    }
}

#[derive(Default)]
struct Halves {
    receiver: Option<JoinHandle<()>>,
    sender: Option<JoinHandle<()>>,
    receive_addr: Option<SocketAddr>,
}

pub struct HeartbeatService {
    config: HeartbeatConfig,
    local: Arc<Mutex<Member>>,
    membership: MembershipHandle,
    stats: Arc<HeartbeatStats>,
    halves: Mutex<Halves>,
}

impl std::fmt::Debug for HeartbeatService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let halves = self.halves.lock();
        f.debug_struct("HeartbeatService")
            .field("local", &self.local.lock().name())
            .field("group", &self.config.group_addr())
            .field("receiving", &halves.receiver.is_some())
            .field("sending", &halves.sender.is_some())
            .finish()
    }
}

impl HeartbeatService {
    pub fn new(config: HeartbeatConfig, membership: MembershipHandle) -> Result<Self> {
        config.validate()?;
        let local = membership.local_member().clone();
        Ok(Self {
            config,
            local: Arc::new(Mutex::new(local)),
            membership,
            stats: Arc::new(HeartbeatStats::default()),
            halves: Mutex::new(Halves::default()),
        })
    }

    /// Start the halves named by `level`, then wait two announcement periods
    /// so the first round of frames can arrive.
    pub async fn start(&self, level: u32) -> Result<()> {
        let wants_rx = level & MBR_RX_SEQ == MBR_RX_SEQ;
        let wants_tx = level & MBR_TX_SEQ == MBR_TX_SEQ;
        if !wants_rx && !wants_tx {
            return Err(crate::lifecycle_error!("invalid heartbeat start level: {}", level));
        }
        {
            let halves = self.halves.lock();
            if wants_rx && halves.receiver.is_some() {
                return Err(crate::lifecycle_error!("heartbeat receiver already started"));
            }
            if wants_tx && halves.sender.is_some() {
                return Err(crate::lifecycle_error!("heartbeat sender already started"));
            }
        }

        {
            let mut local = self.local.lock();
            if local.service_start().is_none() {
                local.set_service_start(Some(now_ms()));
            }
            local.set_command(Vec::new());
        }

        let receive_socket = if wants_rx {
            Some(socket::bind_receiver(&self.config).await?)
        } else {
            None
        };
        let send_socket = if wants_tx {
            Some(socket::bind_sender(&self.config).await?)
        } else {
            None
        };

        let name = self.local.lock().name();
        {
            let mut halves = self.halves.lock();
            if let Some(sock) = receive_socket {
                halves.receive_addr = sock.local_addr().ok();
                info!(
                    "[{}] heartbeat receiver listening on {:?}",
                    name, halves.receive_addr
                );
                halves.receiver = Some(tokio::spawn(receive_loop(
                    self.config.clone(),
                    self.local.clone(),
                    self.membership.clone(),
                    self.stats.clone(),
                    sock,
                )));
            }
            if let Some(sock) = send_socket {
                info!(
                    "[{}] heartbeat sender announcing to {} every {:?}",
                    name,
                    self.config.group_addr(),
                    self.config.mcast_frequency
                );
                halves.sender = Some(tokio::spawn(send_loop(
                    self.config.clone(),
                    self.local.clone(),
                    self.stats.clone(),
                    sock,
                )));
            }
        }

        sleep(self.config.mcast_frequency * 2).await;
        Ok(())
    }

    /// Stop the halves named by `level`. When both halves end up stopped a
    /// single shutdown frame is broadcast. Returns true if nothing is left running.
    pub async fn stop(&self, level: u32) -> Result<bool> {
        let stops_rx = level & MBR_RX_SEQ == MBR_RX_SEQ;
        let stops_tx = level & MBR_TX_SEQ == MBR_TX_SEQ;
        if !stops_rx && !stops_tx {
            return Err(crate::lifecycle_error!("invalid heartbeat stop level: {}", level));
        }

        let (stopped_any, all_stopped) = {
            let mut halves = self.halves.lock();
            let mut stopped_any = false;
            if stops_rx {
                if let Some(handle) = halves.receiver.take() {
                    handle.abort();
                    halves.receive_addr = None;
                    stopped_any = true;
                }
            }
            if stops_tx {
                if let Some(handle) = halves.sender.take() {
                    handle.abort();
                    stopped_any = true;
                }
            }
            (stopped_any, halves.receiver.is_none() && halves.sender.is_none())
        };

        if stopped_any && all_stopped {
            self.send_shutdown_frame().await;
        }
        Ok(all_stopped)
    }

    async fn send_shutdown_frame(&self) {
        let frame = {
            let mut local = self.local.lock();
            local.set_command(SHUTDOWN_PAYLOAD.to_vec());
            local.refresh_alive_time(now_ms());
            local.to_frame()
        };
        let frame = match frame {
            Ok(frame) => frame,
            Err(e) => {
                error!("Unable to encode shutdown frame: {}", e);
                return;
            }
        };
        match socket::bind_sender(&self.config).await {
            Ok(sock) => {
                if let Err(e) = sock.send_to(&frame, self.config.group_addr()).await {
                    warn!("Unable to send shutdown frame: {}", e);
                } else {
                    info!(
                        "[{}] shutdown frame sent to {}",
                        self.local.lock().name(),
                        self.config.group_addr()
                    );
                    self.stats.frames_sent.fetch_add(1, Ordering::Relaxed);
                }
            }
            Err(e) => warn!("Unable to bind socket for shutdown frame: {}", e),
        }
    }

    pub fn is_receiving(&self) -> bool {
        self.halves.lock().receiver.is_some()
    }

    pub fn is_sending(&self) -> bool {
        self.halves.lock().sender.is_some()
    }

    /// Address the receive half is bound to, while it runs
    pub fn receive_addr(&self) -> Option<SocketAddr> {
        self.halves.lock().receive_addr
    }

    /// Current local record as it would be announced
    pub fn local_member(&self) -> Member {
        self.local.lock().clone()
    }

    /// Replace the application payload carried by future announcements
    pub fn set_payload(&self, payload: Vec<u8>) {
        self.local.lock().set_payload(payload);
    }

    pub fn set_domain(&self, domain: Vec<u8>) {
        self.local.lock().set_domain(domain);
    }

    pub fn membership(&self) -> &MembershipHandle {
        &self.membership
    }

    pub fn get_stats(&self) -> FrozenHeartbeatStats {
        self.stats.freeze()
    }
}

impl Drop for HeartbeatService {
    fn drop(&mut self) {
        let mut halves = self.halves.lock();
        if let Some(handle) = halves.receiver.take() {
            handle.abort();
        }
        if let Some(handle) = halves.sender.take() {
            handle.abort();
        }
    }
}

fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

async fn send_loop(
    config: HeartbeatConfig,
    local: Arc<Mutex<Member>>,
    stats: Arc<HeartbeatStats>,
    mut sock: UdpSocket,
) {
    let group = config.group_addr();
    let mut ticker = time::interval(config.mcast_frequency);
    let mut error_counter = 0u32;

    loop {
        ticker.tick().await;
        let frame = {
            let mut member = local.lock();
            member.inc();
            member.refresh_alive_time(now_ms());
            member.to_frame()
        };
        let frame = match frame {
            Ok(frame) => frame,
            Err(e) => {
                error!("Unable to encode local member frame: {}", e);
                continue;
            }
        };

        match sock.send_to(&frame, group).await {
            Ok(_) => {
                error_counter = 0;
                stats.frames_sent.fetch_add(1, Ordering::Relaxed);
                trace!("heartbeat frame of {} bytes sent to {}", frame.len(), group);
            }
            Err(e) => {
                error_counter += 1;
                stats.send_errors.fetch_add(1, Ordering::Relaxed);
                warn!("Unable to send heartbeat to {}: {}", group, e);
                if config.recovery_enabled && error_counter >= config.recovery_counter {
                    error_counter = 0;
                    stats.recoveries.fetch_add(1, Ordering::Relaxed);
                    sock = socket::recover(&config, SocketRole::Send).await;
                }
            }
        }
    }
}

async fn receive_loop(
    config: HeartbeatConfig,
    local: Arc<Mutex<Member>>,
    membership: MembershipHandle,
    stats: Arc<HeartbeatStats>,
    mut sock: UdpSocket,
) {
    let mut buf = vec![0u8; MAX_PACKET_SIZE];
    let mut error_counter = 0u32;
    let receive_timeout = config.receive_timeout();

    loop {
        match timeout(receive_timeout, sock.recv_from(&mut buf)).await {
            Ok(Ok((len, from))) => {
                error_counter = 0;
                let local_member = local.lock().clone();
                if let Err(e) =
                    handle_packet(&buf[..len], from, &local_member, &membership, &stats).await
                {
                    debug!("membership controller unavailable: {}", e);
                    break;
                }
            }
            Ok(Err(e)) => {
                error_counter += 1;
                stats.receive_errors.fetch_add(1, Ordering::Relaxed);
                warn!("Error receiving heartbeat: {}", e);
                sleep(RECEIVE_ERROR_BACKOFF).await;
                if config.recovery_enabled && error_counter >= config.recovery_counter {
                    error_counter = 0;
                    stats.recoveries.fetch_add(1, Ordering::Relaxed);
                    socket::leave_group(&sock, &config);
                    sock = socket::recover(&config, SocketRole::Receive).await;
                }
            }
            // no traffic this cycle; expiry still runs
            Err(_) => {}
        }

        if membership.expire(config.member_drop_time).await.is_err() {
            debug!("membership controller gone, stopping heartbeat receiver");
            break;
        }
    }
}

async fn handle_packet(
    data: &[u8],
    from: SocketAddr,
    local: &Member,
    membership: &MembershipHandle,
    stats: &HeartbeatStats,
) -> Result<()> {
    if !data.starts_with(&MEMBER_BEGIN) {
        stats.foreign_packets.fetch_add(1, Ordering::Relaxed);
        trace!("ignoring {} byte non-membership packet from {}", data.len(), from);
        return Ok(());
    }

    let member = match Member::from_frame(data) {
        Ok(member) => member,
        Err(e) => {
            stats.frames_rejected.fetch_add(1, Ordering::Relaxed);
            warn!("Dropping malformed heartbeat frame from {}: {}", from, e);
            return Ok(());
        }
    };
    stats.frames_received.fetch_add(1, Ordering::Relaxed);

    if &member == local {
        return Ok(());
    }
    if member.is_shutdown() {
        debug!("received shutdown frame from {}", member);
        membership.remove_member(member).await?;
    } else {
        trace!("heartbeat from {} via {}", member, from);
        membership.member_alive(member).await?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::membership::MembershipController;

    fn config() -> HeartbeatConfig {
        HeartbeatConfig {
            mcast_address: "127.0.0.1".parse().unwrap(),
            mcast_port: 0,
            mcast_frequency: Duration::from_millis(20),
            member_drop_time: Duration::from_millis(200),
            ..HeartbeatConfig::default()
        }
    }

    fn member(port: i32, id: u8) -> Member {
        Member::new("127.0.0.1".parse().unwrap(), port, [id; 16])
    }

    #[tokio::test]
    async fn test_invalid_level_rejected() {
        let handle = MembershipController::start(member(4000, 0));
        let service = HeartbeatService::new(config(), handle).unwrap();
        assert!(service.start(0).await.is_err());
        assert!(service.start(1).await.is_err());
        assert!(service.stop(2).await.is_err());
    }

    #[tokio::test]
    async fn test_double_start_rejected() {
        let handle = MembershipController::start(member(4000, 0));
        let service = HeartbeatService::new(config(), handle).unwrap();
        service.start(MBR_RX_SEQ).await.unwrap();
        assert!(service.start(MBR_RX_SEQ).await.is_err());
        assert!(service.is_receiving());
        assert!(!service.is_sending());
        assert!(service.stop(MBR_RX_SEQ).await.unwrap());
        assert!(!service.is_receiving());
    }

    #[tokio::test]
    async fn test_partial_stop_keeps_other_half() {
        let handle = MembershipController::start(member(4000, 0));
        let service = HeartbeatService::new(config(), handle).unwrap();
        service.start(MBR_ALL_SEQ).await.unwrap();
        assert!(!service.stop(MBR_TX_SEQ).await.unwrap());
        assert!(service.is_receiving());
        assert!(service.stop(MBR_RX_SEQ).await.unwrap());
    }

    #[tokio::test]
    async fn test_foreign_packet_ignored() {
        let handle = MembershipController::start(member(4000, 0));
        let stats = HeartbeatStats::default();
        handle_packet(
            b"not a frame",
            "127.0.0.1:9".parse().unwrap(),
            &member(4000, 0),
            &handle,
            &stats,
        )
        .await
        .unwrap();
        assert_eq!(stats.freeze().foreign_packets, 1);
        assert!(!handle.has_members());
    }

    #[tokio::test]
    async fn test_shutdown_frame_removes_member() {
        let handle = MembershipController::start(member(4000, 0));
        let stats = HeartbeatStats::default();
        let from = "127.0.0.1:9".parse().unwrap();
        let peer = member(4001, 1);
        let frame = peer.to_frame().unwrap();
        handle_packet(&frame, from, &member(4000, 0), &handle, &stats)
            .await
            .unwrap();
        assert_eq!(handle.members().len(), 1);

        let mut leaving = peer.clone();
        leaving.set_command(SHUTDOWN_PAYLOAD.to_vec());
        handle_packet(&leaving.to_frame().unwrap(), from, &member(4000, 0), &handle, &stats)
            .await
            .unwrap();
        assert!(!handle.has_members());
        assert_eq!(stats.freeze().frames_received, 2);
    }
}
