//! Active-probe membership for environments without multicast.
pub mod messages;
mod provider;

pub use messages::{ProbeKind, ProbeMessage, ProbeReply};
pub use provider::{ProbeReport, StaticMembershipProvider};
