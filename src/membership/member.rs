//! Member record and its announcement frame
//!
//! Frame layout, all integers big-endian:
//!
//! ```text
//! BEGIN(10) | body_len(4) | alive_ms(8) | port(4) | secure_port(4) | udp_port(4)
//! | host_len(1) | host | cmd_len(4) | cmd | domain_len(4) | domain
//! | unique_id(16) | payload_len(4) | payload | END(10)
//! ```
use std::cmp::Ordering;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

use bytes::{Buf, BufMut, BytesMut};
use serde::Serialize;

use crate::error::FrameError;

pub const MEMBER_BEGIN: [u8; 10] = [84, 82, 73, 66, 69, 83, 45, 66, 1, 0];
pub const MEMBER_END: [u8; 10] = [84, 82, 73, 66, 69, 83, 45, 69, 1, 0];

/// Command carried by the final frame of a departing member
pub const SHUTDOWN_PAYLOAD: [u8; 9] = [66, 65, 66, 89, 45, 65, 76, 69, 88];

pub const MAX_PACKET_SIZE: usize = 65535;

// begin + body_len + end
const FRAME_OVERHEAD: usize = MEMBER_BEGIN.len() + 4 + MEMBER_END.len();

pub type UniqueId = [u8; 16];

/// Identity and liveness metadata for one cluster node
#[derive(Clone, Debug, Serialize)]
pub struct Member {
    host: Vec<u8>,
    port: i32,
    secure_port: i32,
    udp_port: i32,
    unique_id: UniqueId,
    member_alive_time: i64,
    payload: Vec<u8>,
    domain: Vec<u8>,
    command: Vec<u8>,
    #[serde(skip)]
    msg_count: u64,
    #[serde(skip)]
    service_start_ms: Option<i64>,
}

impl Member {
    pub fn new(host: IpAddr, port: i32, unique_id: UniqueId) -> Self {
        Self {
            host: ip_to_bytes(host),
            port,
            secure_port: -1,
            udp_port: -1,
            unique_id,
            member_alive_time: 0,
            payload: Vec::new(),
            domain: Vec::new(),
            command: Vec::new(),
            msg_count: 0,
            service_start_ms: None,
        }
    }

    /// Build the record this node advertises, with a fresh random unique id
    pub fn local(config: &crate::settings::LocalMemberConfig) -> Self {
        let mut member = Self::new(
            config.tcp_listen_host,
            i32::from(config.tcp_listen_port),
            rand::random(),
        );
        member.secure_port = config.secure_port;
        member.udp_port = config.udp_port;
        member.domain = config.domain.clone();
        member.payload = config.payload.clone();
        member
    }

    pub fn host(&self) -> &[u8] {
        &self.host
    }

    pub fn host_ip(&self) -> Option<IpAddr> {
        match self.host.len() {
            4 => Some(IpAddr::V4(Ipv4Addr::new(
                self.host[0],
                self.host[1],
                self.host[2],
                self.host[3],
            ))),
            16 => {
                let mut octets = [0u8; 16];
                octets.copy_from_slice(&self.host);
                Some(IpAddr::V6(Ipv6Addr::from(octets)))
            }
            _ => None,
        }
    }

    /// TCP address the member listens on, when host and port are routable
    pub fn socket_addr(&self) -> Option<SocketAddr> {
        let port = u16::try_from(self.port).ok()?;
        self.host_ip().map(|ip| SocketAddr::new(ip, port))
    }

    pub fn port(&self) -> i32 {
        self.port
    }

    pub fn secure_port(&self) -> i32 {
        self.secure_port
    }

    pub fn udp_port(&self) -> i32 {
        self.udp_port
    }

    pub fn unique_id(&self) -> &UniqueId {
        &self.unique_id
    }

    pub fn member_alive_time(&self) -> i64 {
        self.member_alive_time
    }

    pub fn set_member_alive_time(&mut self, alive_ms: i64) {
        self.member_alive_time = alive_ms;
    }

    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    pub fn set_payload(&mut self, payload: Vec<u8>) {
        self.payload = payload;
    }

    pub fn domain(&self) -> &[u8] {
        &self.domain
    }

    pub fn set_domain(&mut self, domain: Vec<u8>) {
        self.domain = domain;
    }

    pub fn command(&self) -> &[u8] {
        &self.command
    }

    pub fn set_command(&mut self, command: Vec<u8>) {
        self.command = command;
    }

    pub fn is_shutdown(&self) -> bool {
        self.command == SHUTDOWN_PAYLOAD
    }

    /// Number of announcements this (local) member has sent
    pub fn msg_count(&self) -> u64 {
        self.msg_count
    }

    pub fn inc(&mut self) {
        self.msg_count = self.msg_count.wrapping_add(1);
    }

    pub fn set_service_start(&mut self, start_ms: Option<i64>) {
        self.service_start_ms = start_ms;
    }

    pub fn service_start(&self) -> Option<i64> {
        self.service_start_ms
    }

    /// Refresh alive time from the service start, if one is recorded
    pub fn refresh_alive_time(&mut self, now_ms: i64) {
        if let Some(start) = self.service_start_ms {
            self.member_alive_time = now_ms.saturating_sub(start);
        }
    }

    pub fn name(&self) -> String {
        format!("tcp://{}:{}", self.host_string(), self.port)
    }

    fn host_string(&self) -> String {
        match self.host_ip() {
            Some(ip) => ip.to_string(),
            None => self
                .host
                .iter()
                .map(|b| b.to_string())
                .collect::<Vec<_>>()
                .join("."),
        }
    }

    /// Length of the encoded frame for this member
    pub fn frame_len(&self) -> usize {
        FRAME_OVERHEAD
            + 8
            + 4
            + 4
            + 4
            + 1
            + self.host.len()
            + 4
            + self.command.len()
            + 4
            + self.domain.len()
            + 16
            + 4
            + self.payload.len()
    }

    /// Serialize this member into an announcement frame
    pub fn to_frame(&self) -> Result<Vec<u8>, FrameError> {
        let host_len = u8::try_from(self.host.len()).map_err(|_| FrameError::FieldTooLarge("host"))?;
        let total = self.frame_len();
        if total > MAX_PACKET_SIZE {
            return Err(FrameError::FieldTooLarge("frame"));
        }
        let body_len = (total - FRAME_OVERHEAD) as u32;

        let mut buf = BytesMut::with_capacity(total);
        buf.put_slice(&MEMBER_BEGIN);
        buf.put_u32(body_len);
        buf.put_i64(self.member_alive_time);
        buf.put_i32(self.port);
        buf.put_i32(self.secure_port);
        buf.put_i32(self.udp_port);
        buf.put_u8(host_len);
        buf.put_slice(&self.host);
        buf.put_u32(self.command.len() as u32);
        buf.put_slice(&self.command);
        buf.put_u32(self.domain.len() as u32);
        buf.put_slice(&self.domain);
        buf.put_slice(&self.unique_id);
        buf.put_u32(self.payload.len() as u32);
        buf.put_slice(&self.payload);
        buf.put_slice(&MEMBER_END);
        Ok(buf.to_vec())
    }

    /// Parse a member from an announcement frame
    pub fn from_frame(data: &[u8]) -> Result<Self, FrameError> {
        if !data.starts_with(&MEMBER_BEGIN) {
            return Err(FrameError::BadBeginMarker);
        }
        if data.len() < MEMBER_BEGIN.len() + 4 {
            return Err(FrameError::Truncated {
                needed: MEMBER_BEGIN.len() + 4,
                available: data.len(),
            });
        }

        let mut header = &data[MEMBER_BEGIN.len()..];
        let body_len = header.get_u32() as usize;
        let needed = body_len.saturating_add(FRAME_OVERHEAD);
        if data.len() < needed {
            return Err(FrameError::Truncated {
                needed,
                available: data.len(),
            });
        }

        let body_start = MEMBER_BEGIN.len() + 4;
        let body_end = body_start + body_len;
        if data[body_end..body_end + MEMBER_END.len()] != MEMBER_END {
            return Err(FrameError::BadEndMarker);
        }

        let mut body = BodyReader {
            buf: &data[body_start..body_end],
            body_len,
        };
        let alive = body.i64()?;
        let port = body.i32()?;
        let secure_port = body.i32()?;
        let udp_port = body.i32()?;
        let host_len = body.u8()? as usize;
        let host = body.bytes(host_len)?;
        let command_len = body.u32()? as usize;
        let command = body.bytes(command_len)?;
        let domain_len = body.u32()? as usize;
        let domain = body.bytes(domain_len)?;
        let mut unique_id = [0u8; 16];
        unique_id.copy_from_slice(&body.bytes(16)?);
        let payload_len = body.u32()? as usize;
        let payload = body.bytes(payload_len)?;

        Ok(Self {
            host,
            port,
            secure_port,
            udp_port,
            unique_id,
            member_alive_time: alive,
            payload,
            domain,
            command,
            msg_count: 0,
            service_start_ms: None,
        })
    }
}

struct BodyReader<'a> {
    buf: &'a [u8],
    body_len: usize,
}

impl BodyReader<'_> {
    fn ensure(&self, n: usize) -> Result<(), FrameError> {
        if self.buf.remaining() < n {
            return Err(FrameError::Truncated {
                needed: self.body_len - self.buf.remaining() + n,
                available: self.body_len,
            });
        }
        Ok(())
    }

    fn u8(&mut self) -> Result<u8, FrameError> {
        self.ensure(1)?;
        Ok(self.buf.get_u8())
    }

    fn u32(&mut self) -> Result<u32, FrameError> {
        self.ensure(4)?;
        Ok(self.buf.get_u32())
    }

    fn i32(&mut self) -> Result<i32, FrameError> {
        self.ensure(4)?;
        Ok(self.buf.get_i32())
    }

    fn i64(&mut self) -> Result<i64, FrameError> {
        self.ensure(8)?;
        Ok(self.buf.get_i64())
    }

    fn bytes(&mut self, n: usize) -> Result<Vec<u8>, FrameError> {
        self.ensure(n)?;
        let out = self.buf[..n].to_vec();
        self.buf.advance(n);
        Ok(out)
    }
}

/// Longer-lived members sort first
pub fn by_alive_time(a: &Member, b: &Member) -> Ordering {
    b.member_alive_time.cmp(&a.member_alive_time)
}

fn ip_to_bytes(ip: IpAddr) -> Vec<u8> {
    match ip {
        IpAddr::V4(v4) => v4.octets().to_vec(),
        IpAddr::V6(v6) => v6.octets().to_vec(),
    }
}

impl PartialEq for Member {
    fn eq(&self, other: &Self) -> bool {
        self.host == other.host && self.port == other.port && self.unique_id == other.unique_id
    }
}

impl Eq for Member {}

impl Hash for Member {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.host.hash(state);
        self.port.hash(state);
        self.unique_id.hash(state);
    }
}

impl fmt::Display for Member {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}
