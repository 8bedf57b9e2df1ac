pub mod contact;
pub mod envelope;
pub mod payload;
pub mod wire;

pub use contact::{ContactDirectory, ContactId, ContactRecord, MemoryDirectory};
pub use envelope::{
    build_ack, build_message, build_ping, build_pong, build_tap, frame_type, open_ack,
    open_message, open_ping, open_pong, open_tap, EnvelopeError, OpenedAck, OpenedMessage,
    OpenedPing, OpenedPong, OpenedTap, MIN_FRAME_LEN,
};
pub use payload::{MessagePayload, PayloadError, PaymentKind, ProfileUpdate};
pub use wire::{normalize_wire_bytes, MessageId, PingId, WireType};
