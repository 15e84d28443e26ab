//! Session replication between cluster members
pub mod cluster;
pub mod manager;
pub mod messages;

pub use cluster::ClusterRouter;
pub use manager::{FrozenManagerStats, ManagerStats, ReplicationManager, SessionLifecycleEvent};
pub use messages::{SessionEvent, SessionMessage};
