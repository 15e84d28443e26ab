//! Cluster transports
//!
//! [`ClusterChannel`] is what the replication layer sends through. The TCP
//! implementation frames every message with a 4-byte big-endian length and
//! expects a reply frame; the local hub keeps everything in process.
pub mod channel;
pub mod connection_pool;
pub mod local;
pub mod tcp_channel;
pub mod tcp_receiver;

pub use channel::{ChannelFrame, ClusterChannel, ReceivedMessage, Target};
pub use connection_pool::{FrozenPoolStats, TcpConnectionPool};
pub use local::{LocalChannel, LocalHub};
pub use tcp_channel::TcpChannel;
pub use tcp_receiver::{FrozenReceiverStats, ReceiverStats, TcpReceiver, TcpRequest};
