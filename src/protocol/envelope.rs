//! Envelope codec: build and open every frame the protocol speaks.
//!
//! Frame layout (bit-exact, all numeric fields big-endian):
//!
//! ```text
//! [type: 1][sender_x25519: 32][body]
//! body = [version: 1][sequence: 8][nonce: 24][ciphertext || tag: 16]
//! ```
//!
//! The body is sealed under the session key derived from the static
//! X25519 pair of the two peers. The codec is pure: sequence numbers are
//! allocated and checked by the callers against the persisted counters.

use ed25519_dalek::{Signature, Verifier, VerifyingKey};
use thiserror::Error;

use crate::crypto::{derive_session_key, open_body, seal_body, Identity, SessionError};
use crate::protocol::wire::{PingId, WireType};

/// Cleartext frame header: type byte plus the sender's X25519 key.
pub const FRAME_HEADER_LEN: usize = 1 + 32;

/// Shortest valid frame: header plus a sealed empty body.
pub const MIN_FRAME_LEN: usize = FRAME_HEADER_LEN + crate::crypto::BODY_OVERHEAD;

/// Ping plaintext: ping-id(24) + timestamp(8) + identity signature(64).
const PING_BODY_LEN: usize = 24 + 8 + 64;
/// Pong plaintext: ping-id(24) + authenticated flag(1).
const PONG_BODY_LEN: usize = 24 + 1;
/// Tap plaintext: tap nonce(24).
const TAP_BODY_LEN: usize = 24;

#[derive(Error, Debug)]
pub enum EnvelopeError {
    #[error("bad frame: {0}")]
    BadFrame(&'static str),
    #[error("decryption failed")]
    DecryptionFailed,
    #[error("bad signature")]
    BadSignature,
    #[error("stale sequence: received {received}, highest accepted {highest}")]
    StaleSequence { received: u64, highest: u64 },
}

pub type Result<T> = std::result::Result<T, EnvelopeError>;

impl From<SessionError> for EnvelopeError {
    fn from(e: SessionError) -> Self {
        match e {
            SessionError::BodyTooShort | SessionError::UnsupportedVersion(_) => {
                EnvelopeError::BadFrame("sealed body malformed")
            }
            _ => EnvelopeError::DecryptionFailed,
        }
    }
}

/// An opened PING: the sender announces a pending message.
#[derive(Clone, Debug)]
pub struct OpenedPing {
    pub ping_id: PingId,
    pub timestamp_ms: i64,
    pub sender_x25519: [u8; 32],
    pub sequence: u64,
    identity_sig: [u8; 64],
}

impl OpenedPing {
    /// Verify the identity signature against the sender's long-term
    /// Ed25519 key (looked up from the contact record).
    pub fn verify_identity(&self, sender_ed25519: &VerifyingKey) -> bool {
        let message = ping_signing_bytes(&self.ping_id, self.timestamp_ms, sender_ed25519);
        let sig = Signature::from_bytes(&self.identity_sig);
        sender_ed25519.verify(&message, &sig).is_ok()
    }
}

/// An opened PONG: the recipient consents (or declines) to receive.
#[derive(Clone, Debug)]
pub struct OpenedPong {
    pub ping_id: PingId,
    pub authenticated: bool,
    pub sender_x25519: [u8; 32],
    pub sequence: u64,
}

/// An opened TAP presence beacon.
#[derive(Clone, Debug)]
pub struct OpenedTap {
    pub tap_id: [u8; 24],
    pub sender_x25519: [u8; 32],
    pub sequence: u64,
}

/// An opened PING_ACK or MESSAGE_ACK.
#[derive(Clone, Debug)]
pub struct OpenedAck {
    pub kind: WireType,
    pub acked_id: String,
    pub sender_x25519: [u8; 32],
    pub sequence: u64,
}

/// An opened message frame: the type-specific payload, still encoded.
#[derive(Clone, Debug)]
pub struct OpenedMessage {
    pub wire_type: WireType,
    pub plaintext: Vec<u8>,
    pub sender_x25519: [u8; 32],
    pub sequence: u64,
}

fn ping_signing_bytes(ping_id: &PingId, timestamp_ms: i64, sender_idk: &VerifyingKey) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(24 + 8 + 32);
    bytes.extend_from_slice(ping_id.as_bytes());
    bytes.extend_from_slice(&timestamp_ms.to_be_bytes());
    bytes.extend_from_slice(&sender_idk.to_bytes());
    bytes
}

fn seal_frame(
    identity: &Identity,
    recipient_x25519: &[u8; 32],
    wire_type: WireType,
    sequence: u64,
    plaintext: &[u8],
) -> Result<Vec<u8>> {
    let key = derive_session_key(identity.agreement_secret(), recipient_x25519)?;
    let body = seal_body(&key, sequence, plaintext)?;

    let mut frame = Vec::with_capacity(FRAME_HEADER_LEN + body.len());
    frame.push(wire_type as u8);
    frame.extend_from_slice(&identity.x25519_public());
    frame.extend_from_slice(&body);
    Ok(frame)
}

struct OpenedFrame {
    wire_type: WireType,
    sender_x25519: [u8; 32],
    sequence: u64,
    plaintext: Vec<u8>,
}

fn open_frame(wire: &[u8], identity: &Identity) -> Result<OpenedFrame> {
    if wire.len() < MIN_FRAME_LEN {
        return Err(EnvelopeError::BadFrame("frame too short"));
    }
    let wire_type =
        WireType::from_u8(wire[0]).ok_or(EnvelopeError::BadFrame("unknown type byte"))?;

    let mut sender_x25519 = [0u8; 32];
    sender_x25519.copy_from_slice(&wire[1..33]);

    let key = derive_session_key(identity.agreement_secret(), &sender_x25519)?;
    let (sequence, plaintext) = open_body(&key, &wire[FRAME_HEADER_LEN..])?;

    Ok(OpenedFrame {
        wire_type,
        sender_x25519,
        sequence,
        plaintext,
    })
}

/// Peek at a frame's type byte without decrypting.
pub fn frame_type(wire: &[u8]) -> Option<WireType> {
    wire.first().copied().and_then(WireType::from_u8)
}

// ---- PING ----

/// Build a PING frame announcing `ping_id` to the recipient.
///
/// The plaintext carries an Ed25519 signature binding (ping-id,
/// timestamp) to the sender's identity key, so a receiver can check that
/// whoever owns the agreement key also owns the claimed identity.
pub fn build_ping(
    identity: &Identity,
    recipient_x25519: &[u8; 32],
    ping_id: &PingId,
    timestamp_ms: i64,
    sequence: u64,
) -> Result<Vec<u8>> {
    let sig = identity.sign(&ping_signing_bytes(
        ping_id,
        timestamp_ms,
        &identity.verifying_key(),
    ));

    let mut plaintext = Vec::with_capacity(PING_BODY_LEN);
    plaintext.extend_from_slice(ping_id.as_bytes());
    plaintext.extend_from_slice(&timestamp_ms.to_be_bytes());
    plaintext.extend_from_slice(&sig.to_bytes());

    seal_frame(identity, recipient_x25519, WireType::Ping, sequence, &plaintext)
}

pub fn open_ping(wire: &[u8], identity: &Identity) -> Result<OpenedPing> {
    let frame = open_frame(wire, identity)?;
    if frame.wire_type != WireType::Ping {
        return Err(EnvelopeError::BadFrame("not a ping frame"));
    }
    if frame.plaintext.len() != PING_BODY_LEN {
        return Err(EnvelopeError::BadFrame("ping body malformed"));
    }

    let ping_id = PingId::from_slice(&frame.plaintext[..24])
        .map_err(|_| EnvelopeError::BadFrame("ping body malformed"))?;
    let timestamp_ms = i64::from_be_bytes(
        frame.plaintext[24..32]
            .try_into()
            .map_err(|_| EnvelopeError::BadFrame("ping body malformed"))?,
    );
    let mut identity_sig = [0u8; 64];
    identity_sig.copy_from_slice(&frame.plaintext[32..96]);

    Ok(OpenedPing {
        ping_id,
        timestamp_ms,
        sender_x25519: frame.sender_x25519,
        sequence: frame.sequence,
        identity_sig,
    })
}

// ---- PONG ----

/// Build a PONG consenting (`authenticated = true`) or declining to
/// receive the payload announced by `ping_id`.
pub fn build_pong(
    identity: &Identity,
    recipient_x25519: &[u8; 32],
    ping_id: &PingId,
    authenticated: bool,
    sequence: u64,
) -> Result<Vec<u8>> {
    let mut plaintext = Vec::with_capacity(PONG_BODY_LEN);
    plaintext.extend_from_slice(ping_id.as_bytes());
    plaintext.push(authenticated as u8);

    seal_frame(identity, recipient_x25519, WireType::Pong, sequence, &plaintext)
}

pub fn open_pong(wire: &[u8], identity: &Identity) -> Result<OpenedPong> {
    let frame = open_frame(wire, identity)?;
    if frame.wire_type != WireType::Pong {
        return Err(EnvelopeError::BadFrame("not a pong frame"));
    }
    if frame.plaintext.len() != PONG_BODY_LEN {
        return Err(EnvelopeError::BadFrame("pong body malformed"));
    }

    let ping_id = PingId::from_slice(&frame.plaintext[..24])
        .map_err(|_| EnvelopeError::BadFrame("pong body malformed"))?;

    Ok(OpenedPong {
        ping_id,
        authenticated: frame.plaintext[24] != 0,
        sender_x25519: frame.sender_x25519,
        sequence: frame.sequence,
    })
}

// ---- TAP ----

/// Build a TAP presence beacon.
pub fn build_tap(
    identity: &Identity,
    recipient_x25519: &[u8; 32],
    tap_id: &[u8; 24],
    sequence: u64,
) -> Result<Vec<u8>> {
    seal_frame(identity, recipient_x25519, WireType::Tap, sequence, tap_id)
}

pub fn open_tap(wire: &[u8], identity: &Identity) -> Result<OpenedTap> {
    let frame = open_frame(wire, identity)?;
    if frame.wire_type != WireType::Tap {
        return Err(EnvelopeError::BadFrame("not a tap frame"));
    }
    if frame.plaintext.len() != TAP_BODY_LEN {
        return Err(EnvelopeError::BadFrame("tap body malformed"));
    }

    let mut tap_id = [0u8; 24];
    tap_id.copy_from_slice(&frame.plaintext);

    Ok(OpenedTap {
        tap_id,
        sender_x25519: frame.sender_x25519,
        sequence: frame.sequence,
    })
}

// ---- ACK ----

/// Build a PING_ACK or MESSAGE_ACK carrying the acknowledged id
/// (hex ping-id or message-id tag).
pub fn build_ack(
    identity: &Identity,
    recipient_x25519: &[u8; 32],
    kind: WireType,
    acked_id: &str,
    sequence: u64,
) -> Result<Vec<u8>> {
    if !kind.is_ack() {
        return Err(EnvelopeError::BadFrame("not an ack type"));
    }
    seal_frame(identity, recipient_x25519, kind, sequence, acked_id.as_bytes())
}

pub fn open_ack(wire: &[u8], identity: &Identity) -> Result<OpenedAck> {
    let frame = open_frame(wire, identity)?;
    if !frame.wire_type.is_ack() {
        return Err(EnvelopeError::BadFrame("not an ack frame"));
    }

    let acked_id = String::from_utf8(frame.plaintext)
        .map_err(|_| EnvelopeError::BadFrame("ack body malformed"))?;
    if acked_id.is_empty() || acked_id.len() > 64 {
        return Err(EnvelopeError::BadFrame("ack body malformed"));
    }

    Ok(OpenedAck {
        kind: frame.wire_type,
        acked_id,
        sender_x25519: frame.sender_x25519,
        sequence: frame.sequence,
    })
}

// ---- MESSAGE ----

/// Build a message frame. `wire_type` must be one of the payload-bearing
/// types; `payload` is the already-encoded inner payload.
pub fn build_message(
    identity: &Identity,
    recipient_x25519: &[u8; 32],
    wire_type: WireType,
    payload: &[u8],
    sequence: u64,
) -> Result<Vec<u8>> {
    if !wire_type.is_message() {
        return Err(EnvelopeError::BadFrame("not a message type"));
    }
    seal_frame(identity, recipient_x25519, wire_type, sequence, payload)
}

pub fn open_message(wire: &[u8], identity: &Identity) -> Result<OpenedMessage> {
    let frame = open_frame(wire, identity)?;
    if !frame.wire_type.is_message() {
        return Err(EnvelopeError::BadFrame("not a message frame"));
    }

    Ok(OpenedMessage {
        wire_type: frame.wire_type,
        plaintext: frame.plaintext,
        sender_x25519: frame.sender_x25519,
        sequence: frame.sequence,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::wire::normalize_wire_bytes;

    fn pair() -> (Identity, Identity) {
        (Identity::generate(), Identity::generate())
    }

    #[test]
    fn test_ping_round_trip() {
        let (alice, bob) = pair();
        let ping_id = PingId::random();
        let ts = 1_700_000_000_123i64;

        let wire = build_ping(&alice, &bob.x25519_public(), &ping_id, ts, 1).unwrap();
        let opened = open_ping(&wire, &bob).unwrap();

        assert_eq!(opened.ping_id, ping_id);
        assert_eq!(opened.timestamp_ms, ts);
        assert_eq!(opened.sender_x25519, alice.x25519_public());
        assert_eq!(opened.sequence, 1);
        assert!(opened.verify_identity(&alice.verifying_key()));
    }

    #[test]
    fn test_ping_identity_mismatch_detected() {
        let (alice, bob) = pair();
        let mallory = Identity::generate();
        let wire =
            build_ping(&alice, &bob.x25519_public(), &PingId::random(), 0, 1).unwrap();
        let opened = open_ping(&wire, &bob).unwrap();
        assert!(!opened.verify_identity(&mallory.verifying_key()));
    }

    #[test]
    fn test_pong_round_trip() {
        let (alice, bob) = pair();
        let ping_id = PingId::random();

        let accept = build_pong(&bob, &alice.x25519_public(), &ping_id, true, 1).unwrap();
        let opened = open_pong(&accept, &alice).unwrap();
        assert_eq!(opened.ping_id, ping_id);
        assert!(opened.authenticated);

        let decline = build_pong(&bob, &alice.x25519_public(), &ping_id, false, 2).unwrap();
        assert!(!open_pong(&decline, &alice).unwrap().authenticated);
    }

    #[test]
    fn test_ack_round_trip() {
        let (alice, bob) = pair();
        let id = PingId::random().to_hex();

        let wire = build_ack(&bob, &alice.x25519_public(), WireType::PingAck, &id, 1).unwrap();
        let opened = open_ack(&wire, &alice).unwrap();
        assert_eq!(opened.kind, WireType::PingAck);
        assert_eq!(opened.acked_id, id);
    }

    #[test]
    fn test_message_round_trip() {
        let (alice, bob) = pair();
        let wire =
            build_message(&alice, &bob.x25519_public(), WireType::Text, b"hi", 9).unwrap();
        let opened = open_message(&wire, &bob).unwrap();
        assert_eq!(opened.wire_type, WireType::Text);
        assert_eq!(opened.plaintext, b"hi");
        assert_eq!(opened.sequence, 9);
    }

    #[test]
    fn test_minimum_text_frame_is_82_bytes() {
        let (alice, bob) = pair();
        let wire =
            build_message(&alice, &bob.x25519_public(), WireType::Text, b"", 1).unwrap();
        assert_eq!(wire.len(), 82);
        assert_eq!(wire.len(), MIN_FRAME_LEN);

        // One byte less is a bad frame before any crypto runs.
        assert!(matches!(
            open_message(&wire[..81], &bob),
            Err(EnvelopeError::BadFrame(_))
        ));
    }

    #[test]
    fn test_wrong_recipient_cannot_open() {
        let (alice, bob) = pair();
        let eve = Identity::generate();
        let wire =
            build_message(&alice, &bob.x25519_public(), WireType::Text, b"secret", 1).unwrap();
        assert!(matches!(
            open_message(&wire, &eve),
            Err(EnvelopeError::DecryptionFailed)
        ));
    }

    #[test]
    fn test_open_ping_rejects_other_types() {
        let (alice, bob) = pair();
        let wire =
            build_message(&alice, &bob.x25519_public(), WireType::Text, b"x", 1).unwrap();
        assert!(matches!(
            open_ping(&wire, &bob),
            Err(EnvelopeError::BadFrame(_))
        ));
    }

    #[test]
    fn test_legacy_ping_normalization() {
        // Pick a sender whose agreement key does not start with the Ping
        // type byte, so the stripped frame below is unambiguous legacy input.
        let alice = (0u8..=255)
            .map(|i| Identity::from_seed(&[i; 32]))
            .find(|id| id.x25519_public()[0] != WireType::Ping as u8)
            .unwrap();
        let bob = Identity::from_seed(&[4u8; 32]);
        let canonical =
            build_ping(&alice, &bob.x25519_public(), &PingId::random(), 5, 1).unwrap();

        // A legacy client would have sent everything after the type byte.
        let legacy = &canonical[1..];
        let restored = normalize_wire_bytes(WireType::Ping, legacy);
        assert_eq!(restored, canonical);
        assert!(open_ping(&restored, &bob).is_ok());
    }
}
