use bincode::{Decode, Encode};

use crate::error::Result;
use crate::membership::Member;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Encode, Decode)]
pub enum ProbeKind {
    Start,
    Stop,
    Ping,
}

/// Request sent by the active-probe provider. `member` is the sender's
/// announcement frame, the same bytes the heartbeat transport broadcasts.
#[derive(Clone, Debug, PartialEq, Eq, Encode, Decode)]
pub struct ProbeMessage {
    pub membership_id: Vec<u8>,
    pub kind: ProbeKind,
    pub member: Vec<u8>,
}

#[derive(Clone, Debug, PartialEq, Eq, Encode, Decode)]
pub enum ProbeReply {
    Ack { member: Vec<u8> },
    ForeignGroup,
}

impl ProbeMessage {
    pub fn new(membership_id: &[u8], kind: ProbeKind, member: &Member) -> Result<Self> {
        Ok(Self {
            membership_id: membership_id.to_vec(),
            kind,
            member: member.to_frame()?,
        })
    }

    pub fn sender(&self) -> Result<Member> {
        Ok(Member::from_frame(&self.member)?)
    }

    pub fn serialize(&self) -> Result<Vec<u8>> {
        crate::codec::encode(self)
    }

    pub fn deserialize(data: &[u8]) -> Result<Self> {
        crate::codec::decode(data)
    }
}

impl ProbeReply {
    pub fn serialize(&self) -> Result<Vec<u8>> {
        crate::codec::encode(self)
    }

    pub fn deserialize(data: &[u8]) -> Result<Self> {
        crate::codec::decode(data)
    }
}
