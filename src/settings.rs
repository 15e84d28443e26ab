//! Replicon application settings
//!
//! Immutable configuration passed to each service at construction time.
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::Duration;

use serde::Serialize;

use crate::error::Result;

pub const APP_NAME: &str = env!("CARGO_PKG_NAME");
pub const APP_VERSION: &str = env!("CARGO_PKG_VERSION");

pub const DEFAULT_MCAST_PORT: &str = "45564";
pub const DEFAULT_MCAST_ADDRESS: &str = "228.0.0.4";
pub const DEFAULT_MCAST_FREQUENCY_MS: &str = "500";
pub const DEFAULT_MEMBER_DROP_TIME_MS: &str = "3000";
pub const DEFAULT_TCP_LISTEN_PORT: &str = "4000";
pub const DEFAULT_EXPIRATION_TIME_MS: &str = "5000";
pub const DEFAULT_CONNECT_TIMEOUT_MS: &str = "500";
pub const DEFAULT_RPC_TIMEOUT_MS: &str = "3000";
pub const DEFAULT_PING_INTERVAL_MS: &str = "1000";
pub const DEFAULT_STATE_TRANSFER_TIMEOUT_SECS: &str = "60";
pub const DEFAULT_MAX_INACTIVE_INTERVAL_SECS: &str = "1800";

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub enum MembershipMode {
    Multicast,
    Static,
}

impl std::fmt::Display for MembershipMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MembershipMode::Multicast => write!(f, "multicast"),
            MembershipMode::Static => write!(f, "static"),
        }
    }
}

impl std::str::FromStr for MembershipMode {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "multicast" | "mcast" => Ok(MembershipMode::Multicast),
            "static" | "probe" => Ok(MembershipMode::Static),
            _ => Err(format!("Invalid membership mode: {}", s)),
        }
    }
}

/// Identity this node advertises to the cluster
#[derive(Clone, Debug, Serialize)]
pub struct LocalMemberConfig {
    pub tcp_listen_host: IpAddr,
    pub tcp_listen_port: u16,
    pub secure_port: i32,
    pub udp_port: i32,
    pub domain: Vec<u8>,
    pub payload: Vec<u8>,
}

impl LocalMemberConfig {
    pub fn listen_addr(&self) -> SocketAddr {
        SocketAddr::new(self.tcp_listen_host, self.tcp_listen_port)
    }
}

impl Default for LocalMemberConfig {
    fn default() -> Self {
        Self {
            tcp_listen_host: IpAddr::V4(Ipv4Addr::LOCALHOST),
            tcp_listen_port: 4000,
            secure_port: -1,
            udp_port: -1,
            domain: Vec::new(),
            payload: Vec::new(),
        }
    }
}

/// Broadcast heartbeat settings
#[derive(Clone, Debug, Serialize)]
pub struct HeartbeatConfig {
    pub mcast_port: u16,
    pub mcast_address: IpAddr,
    pub mcast_bind_address: Option<IpAddr>,
    pub mcast_ttl: Option<u32>,
    // Receive timeout; doubles as the expiry check tick. Defaults to mcast_frequency.
    pub mcast_so_timeout: Option<Duration>,
    pub member_drop_time: Duration,
    pub mcast_frequency: Duration,
    pub local_loopback_disabled: bool,
    pub recovery_enabled: bool,
    pub recovery_counter: u32,
    pub recovery_sleep_time: Duration,
}

impl HeartbeatConfig {
    pub fn group_addr(&self) -> SocketAddr {
        SocketAddr::new(self.mcast_address, self.mcast_port)
    }

    pub fn receive_timeout(&self) -> Duration {
        match self.mcast_so_timeout {
            Some(timeout) if !timeout.is_zero() => timeout,
            _ => self.mcast_frequency,
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.mcast_frequency.is_zero() {
            return Err(crate::config_error!("mcast_frequency must be greater than zero"));
        }
        if self.member_drop_time < self.mcast_frequency {
            return Err(crate::config_error!(
                "member_drop_time ({:?}) must not be shorter than mcast_frequency ({:?})",
                self.member_drop_time,
                self.mcast_frequency
            ));
        }
        Ok(())
    }
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            mcast_port: 45564,
            mcast_address: IpAddr::V4(Ipv4Addr::new(228, 0, 0, 4)),
            mcast_bind_address: None,
            mcast_ttl: None,
            mcast_so_timeout: None,
            member_drop_time: Duration::from_millis(3000),
            mcast_frequency: Duration::from_millis(500),
            local_loopback_disabled: false,
            recovery_enabled: true,
            recovery_counter: 10,
            recovery_sleep_time: Duration::from_millis(5000),
        }
    }
}

/// Active-probe (static peer list) settings
#[derive(Clone, Debug, Serialize)]
pub struct ProbeConfig {
    pub static_members: Vec<SocketAddr>,
    pub membership_id: Vec<u8>,
    pub expiration_time: Duration,
    pub connect_timeout: Duration,
    pub rpc_timeout: Duration,
    pub ping_interval: Duration,
    pub use_thread: bool,
}

impl Default for ProbeConfig {
    fn default() -> Self {
        Self {
            static_members: Vec::new(),
            membership_id: b"replicon-static".to_vec(),
            expiration_time: Duration::from_millis(5000),
            connect_timeout: Duration::from_millis(500),
            rpc_timeout: Duration::from_millis(3000),
            ping_interval: Duration::from_millis(1000),
            use_thread: false,
        }
    }
}

/// Per-context replication manager settings
#[derive(Clone, Debug, Serialize)]
pub struct ReplicationConfig {
    pub context_name: String,
    pub record_all_actions: bool,
    pub state_transfer_timeout: Duration,
    pub expire_sessions_on_shutdown: bool,
    pub notify_listeners_on_replication: bool,
    pub domain_replication: bool,
    // Seconds; negative means sessions never idle out
    pub max_inactive_interval: i32,
    pub process_expires_frequency: Duration,
    pub tracker_pool_capacity: usize,
}

impl Default for ReplicationConfig {
    fn default() -> Self {
        Self {
            context_name: "/".to_string(),
            record_all_actions: false,
            state_transfer_timeout: Duration::from_secs(60),
            expire_sessions_on_shutdown: false,
            notify_listeners_on_replication: true,
            domain_replication: true,
            max_inactive_interval: 1800,
            process_expires_frequency: Duration::from_secs(10),
            tracker_pool_capacity: 64,
        }
    }
}

#[derive(Clone, Debug, Serialize)]
pub struct Settings {
    pub membership_mode: MembershipMode,
    pub local_member: LocalMemberConfig,
    pub heartbeat: HeartbeatConfig,
    pub probe: ProbeConfig,
    pub replication: ReplicationConfig,
}

impl Settings {
    pub fn validate(&self) -> Result<()> {
        match self.membership_mode {
            MembershipMode::Multicast => self.heartbeat.validate(),
            MembershipMode::Static => {
                if self.probe.static_members.is_empty() {
                    return Err(crate::config_error!(
                        "static membership requires at least one static member"
                    ));
                }
                Ok(())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_membership_mode_parse() {
        assert_eq!(
            "multicast".parse::<MembershipMode>().unwrap(),
            MembershipMode::Multicast
        );
        assert_eq!(
            "STATIC".parse::<MembershipMode>().unwrap(),
            MembershipMode::Static
        );
        assert!("gossip".parse::<MembershipMode>().is_err());
    }

    #[test]
    fn test_receive_timeout_defaults_to_frequency() {
        let mut config = HeartbeatConfig::default();
        assert_eq!(config.receive_timeout(), Duration::from_millis(500));

        config.mcast_so_timeout = Some(Duration::from_millis(250));
        assert_eq!(config.receive_timeout(), Duration::from_millis(250));
    }

    #[test]
    fn test_heartbeat_validation() {
        let mut config = HeartbeatConfig::default();
        assert!(config.validate().is_ok());

        config.member_drop_time = Duration::from_millis(100);
        assert!(config.validate().is_err());
    }
}
