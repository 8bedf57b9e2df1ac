//! Inner payload encoding for message frames.
//!
//! The outer wire-type byte says what kind of message a frame carries;
//! the encrypted payload adds its own leading discriminator only where
//! the content needs structure the outer byte cannot give:
//!
//! - text: raw UTF-8, no discriminator
//! - voice: `0x01 || duration_ms: 4 BE || audio bytes`
//! - image: `0x02 || image bytes`
//! - payment records: opaque JSON, no discriminator
//! - profile update: JSON, no discriminator
//!
//! Voice duration lives only here, inside the ciphertext; putting it in
//! the outer frame would leak call lengths to the network.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::protocol::wire::WireType;

const INNER_VOICE: u8 = 0x01;
const INNER_IMAGE: u8 = 0x02;

#[derive(Error, Debug)]
pub enum PayloadError {
    #[error("payload malformed for {0:?}")]
    Malformed(WireType),
    #[error("payload is not valid UTF-8")]
    NotUtf8,
    #[error("payload is not valid JSON: {0}")]
    BadJson(#[from] serde_json::Error),
    #[error("{0:?} does not carry a message payload")]
    NotAMessageType(WireType),
}

pub type Result<T> = std::result::Result<T, PayloadError>;

/// Which stage of a payment exchange a record belongs to.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum PaymentKind {
    Request,
    Sent,
    Accepted,
}

impl PaymentKind {
    pub fn wire_type(self) -> WireType {
        match self {
            Self::Request => WireType::PaymentRequest,
            Self::Sent => WireType::PaymentSent,
            Self::Accepted => WireType::PaymentAccepted,
        }
    }
}

/// A profile update pushed by a contact.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProfileUpdate {
    pub display_name: String,
}

/// A decoded message payload, one variant per payload-bearing wire type.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum MessagePayload {
    Text(String),
    Voice { duration_ms: u32, audio: Vec<u8> },
    Image(Vec<u8>),
    Payment { kind: PaymentKind, record: Vec<u8> },
    Profile(ProfileUpdate),
}

impl MessagePayload {
    /// The outer wire type this payload travels under.
    pub fn wire_type(&self) -> WireType {
        match self {
            Self::Text(_) => WireType::Text,
            Self::Voice { .. } => WireType::Voice,
            Self::Image(_) => WireType::Image,
            Self::Payment { kind, .. } => kind.wire_type(),
            Self::Profile(_) => WireType::ProfileUpdate,
        }
    }

    /// Encode into the inner byte form carried inside the sealed body.
    pub fn encode(&self) -> Result<Vec<u8>> {
        match self {
            Self::Text(text) => Ok(text.as_bytes().to_vec()),
            Self::Voice { duration_ms, audio } => {
                let mut out = Vec::with_capacity(5 + audio.len());
                out.push(INNER_VOICE);
                out.extend_from_slice(&duration_ms.to_be_bytes());
                out.extend_from_slice(audio);
                Ok(out)
            }
            Self::Image(bytes) => {
                let mut out = Vec::with_capacity(1 + bytes.len());
                out.push(INNER_IMAGE);
                out.extend_from_slice(bytes);
                Ok(out)
            }
            Self::Payment { record, .. } => Ok(record.clone()),
            Self::Profile(update) => Ok(serde_json::to_vec(update)?),
        }
    }

    /// Decode the inner bytes of a message frame of the given wire type.
    pub fn decode(wire_type: WireType, plaintext: &[u8]) -> Result<Self> {
        match wire_type {
            WireType::Text => Ok(Self::Text(
                String::from_utf8(plaintext.to_vec()).map_err(|_| PayloadError::NotUtf8)?,
            )),
            WireType::Voice => {
                if plaintext.len() < 5 || plaintext[0] != INNER_VOICE {
                    return Err(PayloadError::Malformed(wire_type));
                }
                let duration_ms = u32::from_be_bytes(
                    plaintext[1..5]
                        .try_into()
                        .map_err(|_| PayloadError::Malformed(wire_type))?,
                );
                Ok(Self::Voice {
                    duration_ms,
                    audio: plaintext[5..].to_vec(),
                })
            }
            WireType::Image => {
                if plaintext.is_empty() || plaintext[0] != INNER_IMAGE {
                    return Err(PayloadError::Malformed(wire_type));
                }
                Ok(Self::Image(plaintext[1..].to_vec()))
            }
            WireType::PaymentRequest => Ok(Self::Payment {
                kind: PaymentKind::Request,
                record: plaintext.to_vec(),
            }),
            WireType::PaymentSent => Ok(Self::Payment {
                kind: PaymentKind::Sent,
                record: plaintext.to_vec(),
            }),
            WireType::PaymentAccepted => Ok(Self::Payment {
                kind: PaymentKind::Accepted,
                record: plaintext.to_vec(),
            }),
            WireType::ProfileUpdate => Ok(Self::Profile(serde_json::from_slice(plaintext)?)),
            other => Err(PayloadError::NotAMessageType(other)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_text_round_trip() {
        let p = MessagePayload::Text("hi".into());
        let bytes = p.encode().unwrap();
        assert_eq!(bytes, b"hi");
        assert_eq!(MessagePayload::decode(WireType::Text, &bytes).unwrap(), p);
    }

    #[test]
    fn test_voice_carries_duration_inside() {
        let p = MessagePayload::Voice {
            duration_ms: 3_250,
            audio: vec![0xAB; 64],
        };
        let bytes = p.encode().unwrap();
        assert_eq!(bytes[0], 0x01);
        assert_eq!(&bytes[1..5], &3_250u32.to_be_bytes());
        assert_eq!(MessagePayload::decode(WireType::Voice, &bytes).unwrap(), p);
    }

    #[test]
    fn test_voice_too_short_rejected() {
        assert!(MessagePayload::decode(WireType::Voice, &[0x01, 0, 0]).is_err());
    }

    #[test]
    fn test_image_round_trip() {
        let p = MessagePayload::Image(vec![1, 2, 3]);
        let bytes = p.encode().unwrap();
        assert_eq!(bytes[0], 0x02);
        assert_eq!(MessagePayload::decode(WireType::Image, &bytes).unwrap(), p);
    }

    #[test]
    fn test_profile_update_json() {
        let p = MessagePayload::Profile(ProfileUpdate {
            display_name: "nyx".into(),
        });
        let bytes = p.encode().unwrap();
        assert_eq!(
            MessagePayload::decode(WireType::ProfileUpdate, &bytes).unwrap(),
            p
        );
    }

    #[test]
    fn test_payment_record_opaque() {
        let record = br#"{"amount":"12.50","currency":"XMR"}"#.to_vec();
        let p = MessagePayload::Payment {
            kind: PaymentKind::Request,
            record: record.clone(),
        };
        assert_eq!(p.wire_type(), WireType::PaymentRequest);
        let bytes = p.encode().unwrap();
        assert_eq!(bytes, record);
    }

    #[test]
    fn test_decode_rejects_non_message_types() {
        assert!(MessagePayload::decode(WireType::Ping, b"x").is_err());
    }
}
