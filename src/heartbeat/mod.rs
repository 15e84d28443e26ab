//! Broadcast heartbeat transport feeding the membership table.
mod service;
pub mod socket;

pub use service::{
    FrozenHeartbeatStats, HeartbeatService, HeartbeatStats, MBR_ALL_SEQ, MBR_RX_SEQ, MBR_TX_SEQ,
};
