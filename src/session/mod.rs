pub mod base;
pub mod delta;
pub mod listener;
pub mod replicated;
pub mod snapshot;
pub mod store;
pub mod value;

pub use base::{now_ms, Session};
pub use delta::{DeltaAction, DeltaRequest, DeltaRequestPool, TargetType};
pub use listener::{ListenerRegistry, SessionListener};
pub use replicated::{Expiry, ReplicatedSession};
pub use snapshot::{SessionBatch, SessionSnapshot};
pub use store::{SessionHost, SessionStore};
pub use value::{AttributeValue, Principal, WireValue};
