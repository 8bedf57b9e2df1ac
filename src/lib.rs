//! Nocturne core: store-and-forward messaging over onion services.
//!
//! Peers are addressed by v3 hidden-service addresses and exchange
//! encrypted payloads through a Ping -> Pong -> Message -> Message-ACK
//! handshake with at-least-once delivery, durable retry, and strong
//! per-payload deduplication. The overlay itself (proxy + hidden
//! service publication) and the contact database are supplied by the
//! embedding application; everything else lives here.

pub mod config;
pub mod crypto;
pub mod engine;
pub mod network;
pub mod protocol;
pub mod storage;
pub mod supervisor;

// Re-export main types
pub use config::{Config, ConfigError};
pub use crypto::Identity;
pub use engine::{Event, EventBus, RecvEngine, SendEngine, SendOptions};
pub use network::{validate_onion_address, PingSessionStore, Transport};
pub use protocol::{
    ContactDirectory, ContactId, ContactRecord, MemoryDirectory, MessageId, MessagePayload,
    PingId, WireType,
};
pub use storage::Store;
pub use supervisor::{Supervisor, SystemStatus};

// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Get library version
pub fn get_version() -> &'static str {
    VERSION
}
