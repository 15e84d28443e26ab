use std::fmt;

use crate::membership::Member;

/// Main error type for the replication core
#[derive(Debug)]
pub enum RepliconError {
    /// Configuration or CLI argument errors
    Config(String),

    /// Membership announcement frame errors
    Frame(FrameError),

    /// Active-probe membership errors
    Probe(ProbeError),

    /// Session replication errors
    Replication(String),

    /// Session state errors (invalid session, unknown id)
    Session(String),

    /// System I/O errors
    Io(std::io::Error),

    /// Transport layer errors
    Transport(String),

    /// Serialization/deserialization errors
    Serialization(SerializationError),

    /// Service lifecycle errors (start/stop ordering)
    Lifecycle(String),
}

/// Errors raised while decoding a member announcement frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FrameError {
    /// Frame does not start with the begin marker
    BadBeginMarker,

    /// Body is not followed by the end marker
    BadEndMarker,

    /// Declared lengths exceed the bytes actually received
    Truncated { needed: usize, available: usize },

    /// A field is too large to be encoded in its length prefix
    FieldTooLarge(&'static str),
}

/// Serialization related errors
#[derive(Debug)]
pub enum SerializationError {
    /// Binary encoding errors
    Encode(bincode::error::EncodeError),

    /// Binary decoding errors
    Decode(bincode::error::DecodeError),

    /// Value cannot cross the wire (node-local attribute)
    NotSerializable(String),
}

/// A peer that failed an active-probe RPC
#[derive(Debug, Clone)]
pub struct FaultyMember {
    pub member: Member,
    pub reason: String,
}

/// Active-probe membership errors
#[derive(Debug)]
pub enum ProbeError {
    /// One or more peers failed the RPC; they are removed locally
    FaultyMembers(Vec<FaultyMember>),
}

impl fmt::Display for RepliconError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RepliconError::Config(msg) => write!(f, "Configuration error: {}", msg),
            RepliconError::Frame(err) => write!(f, "Frame error: {}", err),
            RepliconError::Probe(err) => write!(f, "Probe error: {}", err),
            RepliconError::Replication(msg) => write!(f, "Replication error: {}", msg),
            RepliconError::Session(msg) => write!(f, "Session error: {}", msg),
            RepliconError::Io(err) => write!(f, "I/O error: {}", err),
            RepliconError::Transport(msg) => write!(f, "Transport error: {}", msg),
            RepliconError::Serialization(err) => write!(f, "Serialization error: {}", err),
            RepliconError::Lifecycle(msg) => write!(f, "Lifecycle error: {}", msg),
        }
    }
}

impl fmt::Display for FrameError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FrameError::BadBeginMarker => write!(f, "invalid package, begin marker missing"),
            FrameError::BadEndMarker => write!(f, "invalid package, end marker missing"),
            FrameError::Truncated { needed, available } => write!(
                f,
                "not enough bytes in package: needed {}, got {}",
                needed, available
            ),
            FrameError::FieldTooLarge(field) => write!(f, "field too large: {}", field),
        }
    }
}

impl fmt::Display for SerializationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SerializationError::Encode(err) => write!(f, "Encode: {}", err),
            SerializationError::Decode(err) => write!(f, "Decode: {}", err),
            SerializationError::NotSerializable(name) => {
                write!(f, "Value is not serializable: {}", name)
            }
        }
    }
}

impl fmt::Display for ProbeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProbeError::FaultyMembers(faulty) => {
                write!(f, "{} faulty member(s):", faulty.len())?;
                for fm in faulty {
                    write!(f, " [{}: {}]", fm.member, fm.reason)?;
                }
                Ok(())
            }
        }
    }
}

impl std::error::Error for RepliconError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            RepliconError::Io(err) => Some(err),
            RepliconError::Serialization(SerializationError::Encode(err)) => Some(err),
            RepliconError::Serialization(SerializationError::Decode(err)) => Some(err),
            _ => None,
        }
    }
}

impl std::error::Error for FrameError {}
impl std::error::Error for ProbeError {}
impl std::error::Error for SerializationError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            SerializationError::Encode(err) => Some(err),
            SerializationError::Decode(err) => Some(err),
            SerializationError::NotSerializable(_) => None,
        }
    }
}

// Convenient type alias for Results using our error type
pub type Result<T> = std::result::Result<T, RepliconError>;

impl RepliconError {
    /// Get the error type identifier
    pub fn error_type(&self) -> &'static str {
        match self {
            RepliconError::Config(_) => "configuration_error",
            RepliconError::Frame(_) => "frame_error",
            RepliconError::Probe(_) => "probe_error",
            RepliconError::Replication(_) => "replication_error",
            RepliconError::Session(_) => "session_error",
            RepliconError::Io(_) => "io_error",
            RepliconError::Transport(_) => "transport_error",
            RepliconError::Serialization(_) => "serialization_error",
            RepliconError::Lifecycle(_) => "lifecycle_error",
        }
    }

    /// Members reported as faulty by a probe RPC, if any
    pub fn faulty_members(&self) -> &[FaultyMember] {
        match self {
            RepliconError::Probe(ProbeError::FaultyMembers(faulty)) => faulty,
            _ => &[],
        }
    }
}

// Conversions from common error types
impl From<std::io::Error> for RepliconError {
    fn from(err: std::io::Error) -> Self {
        RepliconError::Io(err)
    }
}

impl From<bincode::error::EncodeError> for RepliconError {
    fn from(err: bincode::error::EncodeError) -> Self {
        RepliconError::Serialization(SerializationError::Encode(err))
    }
}

impl From<bincode::error::DecodeError> for RepliconError {
    fn from(err: bincode::error::DecodeError) -> Self {
        RepliconError::Serialization(SerializationError::Decode(err))
    }
}

impl From<FrameError> for RepliconError {
    fn from(err: FrameError) -> Self {
        RepliconError::Frame(err)
    }
}

impl From<ProbeError> for RepliconError {
    fn from(err: ProbeError) -> Self {
        RepliconError::Probe(err)
    }
}

impl From<SerializationError> for RepliconError {
    fn from(err: SerializationError) -> Self {
        RepliconError::Serialization(err)
    }
}

impl From<std::net::AddrParseError> for RepliconError {
    fn from(err: std::net::AddrParseError) -> Self {
        RepliconError::Config(format!("Invalid address: {}", err))
    }
}

// Helper macros for common error construction patterns
#[macro_export]
macro_rules! config_error {
    ($msg:expr) => {
        $crate::error::RepliconError::Config($msg.to_string())
    };
    ($fmt:expr, $($arg:tt)*) => {
        $crate::error::RepliconError::Config(format!($fmt, $($arg)*))
    };
}

#[macro_export]
macro_rules! transport_error {
    ($msg:expr) => {
        $crate::error::RepliconError::Transport($msg.to_string())
    };
    ($fmt:expr, $($arg:tt)*) => {
        $crate::error::RepliconError::Transport(format!($fmt, $($arg)*))
    };
}

#[macro_export]
macro_rules! replication_error {
    ($msg:expr) => {
        $crate::error::RepliconError::Replication($msg.to_string())
    };
    ($fmt:expr, $($arg:tt)*) => {
        $crate::error::RepliconError::Replication(format!($fmt, $($arg)*))
    };
}

#[macro_export]
macro_rules! lifecycle_error {
    ($msg:expr) => {
        $crate::error::RepliconError::Lifecycle($msg.to_string())
    };
    ($fmt:expr, $($arg:tt)*) => {
        $crate::error::RepliconError::Lifecycle(format!($fmt, $($arg)*))
    };
}
