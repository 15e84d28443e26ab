//! CLI for this application
//!
use std::net::{IpAddr, SocketAddr};
use std::time::Duration;

use crate::settings;

#[derive(Clone, Debug, clap::Parser)]
#[command(name = settings::APP_NAME, version = settings::APP_VERSION)]
pub struct Cli {
    // Advertised cluster address
    #[clap(
        long,
        default_value = "127.0.0.1",
        env("REPLICON_TCP_LISTEN_HOST"),
        help = "IP address the cluster channel listens on and advertises"
    )]
    pub tcp_listen_host: IpAddr,

    #[clap(
        long,
        default_value = settings::DEFAULT_TCP_LISTEN_PORT,
        env("REPLICON_TCP_LISTEN_PORT"),
        help = "Port for the cluster channel (0 picks a free port)"
    )]
    pub tcp_listen_port: u16,

    #[clap(
        long,
        default_value = "",
        env("REPLICON_DOMAIN"),
        help = "Replication domain tag announced with this member"
    )]
    pub domain: String,

    #[clap(
        long,
        default_value = "multicast",
        env("REPLICON_MEMBERSHIP"),
        help = "membership: 'multicast' or 'static'"
    )]
    pub membership: settings::MembershipMode,

    // Heartbeat options
    #[clap(
        long,
        default_value = settings::DEFAULT_MCAST_ADDRESS,
        env("REPLICON_MCAST_ADDRESS"),
        help = "Heartbeat group address"
    )]
    pub mcast_address: IpAddr,

    #[clap(
        long,
        default_value = settings::DEFAULT_MCAST_PORT,
        env("REPLICON_MCAST_PORT"),
        help = "Heartbeat group port"
    )]
    pub mcast_port: u16,

    #[clap(long, env("REPLICON_MCAST_BIND_ADDRESS"), help = "Interface to receive heartbeats on")]
    pub mcast_bind_address: Option<IpAddr>,

    #[clap(long, env("REPLICON_MCAST_TTL"), help = "Multicast time-to-live")]
    pub mcast_ttl: Option<u32>,

    #[clap(
        long,
        env("REPLICON_MCAST_SO_TIMEOUT_MS"),
        help = "Receive timeout in ms (defaults to the heartbeat frequency)"
    )]
    pub mcast_so_timeout_ms: Option<u64>,

    #[clap(
        long,
        default_value = settings::DEFAULT_MCAST_FREQUENCY_MS,
        env("REPLICON_MCAST_FREQUENCY_MS"),
        help = "Heartbeat interval in ms"
    )]
    pub mcast_frequency_ms: u64,

    #[clap(
        long,
        default_value = settings::DEFAULT_MEMBER_DROP_TIME_MS,
        env("REPLICON_MEMBER_DROP_TIME_MS"),
        help = "Silence in ms after which a member is dropped"
    )]
    pub member_drop_time_ms: u64,

    // Static membership options
    #[clap(
        long,
        env("REPLICON_STATIC_MEMBERS"),
        value_delimiter = ',',
        help = "Peer cluster addresses for static membership (e.g., 10.0.0.1:4000,10.0.0.2:4000)"
    )]
    pub static_members: Vec<SocketAddr>,

    #[clap(
        long,
        default_value = "replicon-static",
        env("REPLICON_MEMBERSHIP_ID"),
        help = "Group id shared by all static members"
    )]
    pub membership_id: String,

    #[clap(
        long,
        default_value = settings::DEFAULT_EXPIRATION_TIME_MS,
        env("REPLICON_EXPIRATION_TIME_MS")
    )]
    pub expiration_time_ms: u64,

    #[clap(
        long,
        default_value = settings::DEFAULT_CONNECT_TIMEOUT_MS,
        env("REPLICON_CONNECT_TIMEOUT_MS")
    )]
    pub connect_timeout_ms: u64,

    #[clap(
        long,
        default_value = settings::DEFAULT_RPC_TIMEOUT_MS,
        env("REPLICON_RPC_TIMEOUT_MS")
    )]
    pub rpc_timeout_ms: u64,

    #[clap(
        long,
        default_value = settings::DEFAULT_PING_INTERVAL_MS,
        env("REPLICON_PING_INTERVAL_MS")
    )]
    pub ping_interval_ms: u64,

    #[clap(long, env("REPLICON_USE_THREAD"), help = "Ping static members from a background task")]
    pub use_thread: bool,

    // Replication options
    #[clap(
        long,
        default_value = "/",
        env("REPLICON_CONTEXT_NAME"),
        help = "Name of the replicated context"
    )]
    pub context_name: String,

    #[clap(long, env("REPLICON_RECORD_ALL_ACTIONS"), help = "Queue every mutation instead of the latest per name")]
    pub record_all_actions: bool,

    #[clap(
        long,
        default_value = settings::DEFAULT_STATE_TRANSFER_TIMEOUT_SECS,
        env("REPLICON_STATE_TRANSFER_TIMEOUT_SECS")
    )]
    pub state_transfer_timeout_secs: u64,

    #[clap(long, env("REPLICON_EXPIRE_SESSIONS_ON_SHUTDOWN"))]
    pub expire_sessions_on_shutdown: bool,

    #[clap(
        long,
        default_value = settings::DEFAULT_MAX_INACTIVE_INTERVAL_SECS,
        env("REPLICON_MAX_INACTIVE_INTERVAL_SECS"),
        allow_negative_numbers = true,
        help = "Session idle timeout in seconds; negative never expires"
    )]
    pub max_inactive_interval_secs: i32,

    #[clap(long, env("REPLICON_LOG_JSON"), help = "Emit logs as JSON")]
    pub log_json: bool,
}

impl Cli {
    pub fn into_settings(self) -> settings::Settings {
        let local_member = settings::LocalMemberConfig {
            tcp_listen_host: self.tcp_listen_host,
            tcp_listen_port: self.tcp_listen_port,
            domain: self.domain.into_bytes(),
            ..settings::LocalMemberConfig::default()
        };
        let heartbeat = settings::HeartbeatConfig {
            mcast_port: self.mcast_port,
            mcast_address: self.mcast_address,
            mcast_bind_address: self.mcast_bind_address,
            mcast_ttl: self.mcast_ttl,
            mcast_so_timeout: self.mcast_so_timeout_ms.map(Duration::from_millis),
            member_drop_time: Duration::from_millis(self.member_drop_time_ms),
            mcast_frequency: Duration::from_millis(self.mcast_frequency_ms),
            ..settings::HeartbeatConfig::default()
        };
        let probe = settings::ProbeConfig {
            static_members: self.static_members,
            membership_id: self.membership_id.into_bytes(),
            expiration_time: Duration::from_millis(self.expiration_time_ms),
            connect_timeout: Duration::from_millis(self.connect_timeout_ms),
            rpc_timeout: Duration::from_millis(self.rpc_timeout_ms),
            ping_interval: Duration::from_millis(self.ping_interval_ms),
            use_thread: self.use_thread,
        };
        let replication = settings::ReplicationConfig {
            context_name: self.context_name,
            record_all_actions: self.record_all_actions,
            state_transfer_timeout: Duration::from_secs(self.state_transfer_timeout_secs),
            expire_sessions_on_shutdown: self.expire_sessions_on_shutdown,
            max_inactive_interval: self.max_inactive_interval_secs,
            ..settings::ReplicationConfig::default()
        };
        settings::Settings {
            membership_mode: self.membership,
            local_member,
            heartbeat,
            probe,
            replication,
        }
    }
}

#[cfg(test)]
mod tests {
    use clap::Parser;

    use super::*;

    #[test]
    fn test_defaults_into_settings() {
        let cli = Cli::parse_from(["replicon"]);
        let settings = cli.into_settings();
        assert_eq!(settings.membership_mode, settings::MembershipMode::Multicast);
        assert_eq!(settings.heartbeat.mcast_port, 45564);
        assert_eq!(settings.heartbeat.mcast_frequency, Duration::from_millis(500));
        assert_eq!(settings.replication.max_inactive_interval, 1800);
        assert!(settings.validate().is_ok());
    }

    #[test]
    fn test_static_members_parse() {
        let cli = Cli::parse_from([
            "replicon",
            "--membership",
            "static",
            "--static-members",
            "10.0.0.1:4000,10.0.0.2:4000",
            "--max-inactive-interval-secs",
            "-1",
        ]);
        let settings = cli.into_settings();
        assert_eq!(settings.probe.static_members.len(), 2);
        assert_eq!(settings.replication.max_inactive_interval, -1);
        assert!(settings.validate().is_ok());
    }
}
