//! Cluster membership: member records, the local membership table and the
//! controller task that owns it.
pub mod controller;
pub mod member;
pub mod table;

pub use controller::{
    MembershipCommand, MembershipController, MembershipEvent, MembershipHandle, MembershipListener,
};
pub use member::{
    by_alive_time, Member, UniqueId, MAX_PACKET_SIZE, MEMBER_BEGIN, MEMBER_END, SHUTDOWN_PAYLOAD,
};
pub use table::{MemberEntry, MemberHealth, Membership};
