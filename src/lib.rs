pub mod cli;
pub mod codec;
pub mod error;
pub mod heartbeat;
pub mod membership;
pub mod node;
pub mod probe;
pub mod replication;
pub mod session;
pub mod settings;
pub mod transport;
