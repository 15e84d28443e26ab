//! Socket setup for the heartbeat service
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::UdpSocket;
use tokio::time::sleep;
use tracing::{info, warn};

use crate::error::Result;
use crate::settings::HeartbeatConfig;

fn unspecified_for(addr: IpAddr) -> IpAddr {
    match addr {
        IpAddr::V4(_) => IpAddr::V4(Ipv4Addr::UNSPECIFIED),
        IpAddr::V6(_) => IpAddr::V6(Ipv6Addr::UNSPECIFIED),
    }
}

/// Bind a UDP socket other processes on this host may bind as well, so
/// several nodes can listen on one group port.
fn bind_shared(bind_addr: SocketAddr) -> std::io::Result<UdpSocket> {
    let socket = Socket::new(Domain::for_address(bind_addr), Type::DGRAM, Some(Protocol::UDP))?;
    socket.set_reuse_address(true)?;
    #[cfg(all(unix, not(any(target_os = "solaris", target_os = "illumos"))))]
    socket.set_reuse_port(true)?;
    socket.set_nonblocking(true)?;
    socket.bind(&bind_addr.into())?;
    UdpSocket::from_std(socket.into())
}

/// Bind the socket announcements arrive on.
///
/// A multicast group address binds the wildcard address on the group port,
/// shared with other nodes on the host, and joins the group. Any other address is treated as a plain unicast endpoint,
/// which is what loopback tests and multicast-less hosts use.
pub async fn bind_receiver(config: &HeartbeatConfig) -> Result<UdpSocket> {
    let group = config.mcast_address;
    if group.is_multicast() {
        let bind_addr = SocketAddr::new(unspecified_for(group), config.mcast_port);
        let socket = bind_shared(bind_addr)
            .map_err(|e| crate::transport_error!("Heartbeat receive bind on {} failed: {}", bind_addr, e))?;
        join_group(&socket, config)?;
        Ok(socket)
    } else {
        let bind_addr = SocketAddr::new(config.mcast_bind_address.unwrap_or(group), config.mcast_port);
        UdpSocket::bind(bind_addr)
            .await
            .map_err(|e| crate::transport_error!("Heartbeat receive bind on {} failed: {}", bind_addr, e))
    }
}

/// Bind the socket announcements are sent from
pub async fn bind_sender(config: &HeartbeatConfig) -> Result<UdpSocket> {
    let group = config.mcast_address;
    let bind_ip = config
        .mcast_bind_address
        .filter(|ip| ip.is_ipv4() == group.is_ipv4())
        .unwrap_or_else(|| unspecified_for(group));
    let socket = UdpSocket::bind(SocketAddr::new(bind_ip, 0))
        .await
        .map_err(|e| crate::transport_error!("Heartbeat send bind failed: {}", e))?;
    if group.is_multicast() {
        apply_multicast_options(&socket, config)?;
    }
    Ok(socket)
}

fn join_group(socket: &UdpSocket, config: &HeartbeatConfig) -> Result<()> {
    match config.mcast_address {
        IpAddr::V4(group) => {
            let interface = match config.mcast_bind_address {
                Some(IpAddr::V4(iface)) => iface,
                _ => Ipv4Addr::UNSPECIFIED,
            };
            socket.join_multicast_v4(group, interface)?;
        }
        IpAddr::V6(group) => socket.join_multicast_v6(&group, 0)?,
    }
    apply_multicast_options(socket, config)
}

fn apply_multicast_options(socket: &UdpSocket, config: &HeartbeatConfig) -> Result<()> {
    let loopback = !config.local_loopback_disabled;
    match config.mcast_address {
        IpAddr::V4(_) => {
            socket.set_multicast_loop_v4(loopback)?;
            if let Some(ttl) = config.mcast_ttl {
                socket.set_multicast_ttl_v4(ttl)?;
            }
        }
        IpAddr::V6(_) => socket.set_multicast_loop_v6(loopback)?,
    }
    Ok(())
}

/// Leave the multicast group before the receive socket is dropped
pub fn leave_group(socket: &UdpSocket, config: &HeartbeatConfig) {
    let result = match config.mcast_address {
        IpAddr::V4(group) if group.is_multicast() => {
            let interface = match config.mcast_bind_address {
                Some(IpAddr::V4(iface)) => iface,
                _ => Ipv4Addr::UNSPECIFIED,
            };
            socket.leave_multicast_v4(group, interface)
        }
        IpAddr::V6(group) if group.is_multicast() => socket.leave_multicast_v6(&group, 0),
        _ => Ok(()),
    };
    if let Err(e) = result {
        warn!("Unable to leave multicast group {}: {}", config.mcast_address, e);
    }
}

/// Which socket a recovery attempt rebinds
#[derive(Clone, Copy, Debug)]
pub enum SocketRole {
    Receive,
    Send,
}

/// Rebind until it works, sleeping `recovery_sleep_time` between attempts.
pub async fn recover(config: &HeartbeatConfig, role: SocketRole) -> UdpSocket {
    let mut attempt = 0u64;
    loop {
        attempt += 1;
        let bound: Result<UdpSocket> = match role {
            SocketRole::Receive => bind_receiver(config).await,
            SocketRole::Send => bind_sender(config).await,
        };
        match bound {
            Ok(socket) => {
                info!("Heartbeat {:?} socket recovered after {} attempt(s)", role, attempt);
                return socket;
            }
            Err(e) => {
                warn!("Heartbeat {:?} recovery attempt {} failed: {}", role, attempt, e);
            }
        }
        sleep(config.recovery_sleep_time).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn unicast_config() -> HeartbeatConfig {
        HeartbeatConfig {
            mcast_address: "127.0.0.1".parse().unwrap(),
            mcast_port: 0,
            ..HeartbeatConfig::default()
        }
    }

    #[tokio::test]
    async fn test_unicast_receiver_binds_loopback() {
        let socket = bind_receiver(&unicast_config()).await.unwrap();
        let addr = socket.local_addr().unwrap();
        assert_eq!(addr.ip(), "127.0.0.1".parse::<IpAddr>().unwrap());
        assert_ne!(addr.port(), 0);
    }

    #[tokio::test]
    async fn test_two_receivers_share_a_port() {
        let port = std::net::UdpSocket::bind("0.0.0.0:0")
            .unwrap()
            .local_addr()
            .unwrap()
            .port();
        let addr = SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), port);

        let first = bind_shared(addr).unwrap();
        let second = bind_shared(addr).unwrap();
        assert_eq!(first.local_addr().unwrap().port(), port);
        assert_eq!(second.local_addr().unwrap().port(), port);
    }

    #[tokio::test]
    async fn test_sender_reaches_receiver() {
        let config = unicast_config();
        let receiver = bind_receiver(&config).await.unwrap();
        let sender = bind_sender(&config).await.unwrap();
        sender
            .send_to(b"ping", receiver.local_addr().unwrap())
            .await
            .unwrap();
        let mut buf = [0u8; 16];
        let (len, _) = receiver.recv_from(&mut buf).await.unwrap();
        assert_eq!(&buf[..len], b"ping");
    }
}
