//! Wire-type bytes and protocol identifiers.
//!
//! The first byte of any frame names its type. Some historical clients
//! emitted Pings without the leading type byte; `normalize_wire_bytes`
//! accepts both forms on ingress. Egress is always canonical.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// First byte of every over-the-wire frame.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum WireType {
    Ping = 0x01,
    Pong = 0x02,
    Text = 0x03,
    Voice = 0x04,
    Tap = 0x05,
    PingAck = 0x06,
    FriendRequest = 0x07,
    MessageAck = 0x08,
    Image = 0x09,
    PaymentRequest = 0x0A,
    PaymentSent = 0x0B,
    PaymentAccepted = 0x0C,
    ProfileUpdate = 0x0F,
}

impl WireType {
    pub fn from_u8(v: u8) -> Option<Self> {
        match v {
            0x01 => Some(Self::Ping),
            0x02 => Some(Self::Pong),
            0x03 => Some(Self::Text),
            0x04 => Some(Self::Voice),
            0x05 => Some(Self::Tap),
            0x06 => Some(Self::PingAck),
            0x07 => Some(Self::FriendRequest),
            0x08 => Some(Self::MessageAck),
            0x09 => Some(Self::Image),
            0x0A => Some(Self::PaymentRequest),
            0x0B => Some(Self::PaymentSent),
            0x0C => Some(Self::PaymentAccepted),
            0x0F => Some(Self::ProfileUpdate),
            _ => None,
        }
    }

    /// True for types that carry a message payload (as opposed to the
    /// handshake and acknowledgement machinery).
    pub fn is_message(self) -> bool {
        matches!(
            self,
            Self::Text
                | Self::Voice
                | Self::Image
                | Self::PaymentRequest
                | Self::PaymentSent
                | Self::PaymentAccepted
                | Self::ProfileUpdate
        )
    }

    pub fn is_ack(self) -> bool {
        matches!(self, Self::PingAck | Self::MessageAck)
    }
}

#[derive(Error, Debug)]
pub enum IdError {
    #[error("invalid ping-id encoding")]
    InvalidPingId,
    #[error("invalid message-id encoding")]
    InvalidMessageId,
}

/// 24 random bytes identifying one logical message across all of its
/// retries. Hex-encoded (48 chars) wherever it appears as text.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct PingId([u8; 24]);

impl PingId {
    pub const LEN: usize = 24;

    /// Generate a fresh random ping-id. Assigned once per logical message
    /// at the sender and reused verbatim across retries.
    pub fn random() -> Self {
        let mut bytes = [0u8; 24];
        getrandom::getrandom(&mut bytes).expect("system RNG unavailable");
        Self(bytes)
    }

    pub fn from_bytes(bytes: [u8; 24]) -> Self {
        Self(bytes)
    }

    pub fn from_slice(slice: &[u8]) -> Result<Self, IdError> {
        let bytes: [u8; 24] = slice.try_into().map_err(|_| IdError::InvalidPingId)?;
        Ok(Self(bytes))
    }

    pub fn from_hex(s: &str) -> Result<Self, IdError> {
        let raw = hex::decode(s).map_err(|_| IdError::InvalidPingId)?;
        Self::from_slice(&raw)
    }

    pub fn as_bytes(&self) -> &[u8; 24] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl std::fmt::Display for PingId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl std::fmt::Debug for PingId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "PingId({})", self.to_hex())
    }
}

/// 32-character message tag, unique within a peer's store.
///
/// Incoming messages derive it from (content || sender address) so that a
/// re-delivered payload maps to the same id; outgoing messages use a
/// random UUID.
#[derive(Clone, PartialEq, Eq, Hash, Debug)]
pub struct MessageId(String);

impl MessageId {
    pub const LEN: usize = 32;

    /// Random id for an outgoing message.
    pub fn random() -> Self {
        Self(uuid::Uuid::new_v4().simple().to_string())
    }

    /// Deterministic id for an incoming message: the first 16 bytes of
    /// blake3(content || sender_address), hex-encoded.
    pub fn for_incoming(content: &[u8], sender_address: &str) -> Self {
        let mut hasher = blake3::Hasher::new();
        hasher.update(content);
        hasher.update(sender_address.as_bytes());
        let digest = hasher.finalize();
        Self(hex::encode(&digest.as_bytes()[..16]))
    }

    pub fn from_string(s: String) -> Result<Self, IdError> {
        if s.len() != Self::LEN || !s.bytes().all(|b| b.is_ascii_alphanumeric()) {
            return Err(IdError::InvalidMessageId);
        }
        Ok(Self(s))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for MessageId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Accept legacy type-less frames: if the first byte already names the
/// expected type the bytes are canonical, otherwise the type byte is
/// prepended. Emitters always produce the canonical form.
pub fn normalize_wire_bytes(expected: WireType, bytes: &[u8]) -> Vec<u8> {
    if bytes.first() == Some(&(expected as u8)) {
        return bytes.to_vec();
    }
    let mut canonical = Vec::with_capacity(1 + bytes.len());
    canonical.push(expected as u8);
    canonical.extend_from_slice(bytes);
    canonical
}
