//! Send and receive engines, the download flow, and the event bus.

pub mod download;
pub mod events;
pub mod recv;
pub mod send;

use thiserror::Error;

pub use events::{Event, EventBus};
pub use recv::{Listeners, RecvEngine};
pub use send::{SendEngine, SendOptions};

use crate::network::TransportError;
use crate::protocol::envelope::EnvelopeError;
use crate::protocol::payload::PayloadError;
use crate::protocol::ContactId;
use crate::storage::StorageError;

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("unknown contact {0}")]
    UnknownContact(ContactId),
    #[error("overlay not ready")]
    OverlayUnavailable,
    #[error("message expired")]
    PingExpired,
    #[error("download timed out — retry")]
    DownloadTimedOut,
    #[error("download failed")]
    DownloadFailed,
    #[error("cached ping wire bytes missing")]
    MissingWireBytes,
    #[error(transparent)]
    Envelope(#[from] EnvelopeError),
    #[error(transparent)]
    Payload(#[from] PayloadError),
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error(transparent)]
    Storage(#[from] StorageError),
    #[error(transparent)]
    Session(#[from] crate::crypto::SessionError),
}

/// Current time as epoch milliseconds, the unit every persisted
/// timestamp uses.
pub(crate) fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}
