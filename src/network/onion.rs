//! v3 onion address helpers.
//!
//! An address encodes `base32(pubkey || checksum[2] || 0x03) + ".onion"`,
//! where the checksum is SHA3-256(".onion checksum" || pubkey || 0x03)
//! truncated to two bytes. The protocol treats addresses as opaque; the
//! helpers here only validate shape and derive our own address from the
//! hidden-service key.

use ed25519_dalek::VerifyingKey;
use sha3::{Digest, Sha3_256};

const ONION_VERSION: u8 = 0x03;
const CHECKSUM_PREFIX: &[u8] = b".onion checksum";

/// Derive the v3 onion address published for an Ed25519 key.
pub fn onion_address_from_ed25519(key: &VerifyingKey) -> String {
    let pubkey = key.to_bytes();

    let mut hasher = Sha3_256::new();
    hasher.update(CHECKSUM_PREFIX);
    hasher.update(pubkey);
    hasher.update([ONION_VERSION]);
    let checksum = hasher.finalize();

    let mut raw = Vec::with_capacity(35);
    raw.extend_from_slice(&pubkey);
    raw.extend_from_slice(&checksum[..2]);
    raw.push(ONION_VERSION);

    let encoded = base32::encode(base32::Alphabet::Rfc4648Lower { padding: false }, &raw);
    format!("{encoded}.onion")
}

/// Validate the shape and checksum of a v3 onion address.
pub fn validate_onion_address(address: &str) -> bool {
    let Some(body) = address.strip_suffix(".onion") else {
        return false;
    };
    if body.len() != 56 {
        return false;
    }

    let Some(raw) = base32::decode(base32::Alphabet::Rfc4648Lower { padding: false }, body) else {
        return false;
    };
    if raw.len() != 35 || raw[34] != ONION_VERSION {
        return false;
    }

    let mut hasher = Sha3_256::new();
    hasher.update(CHECKSUM_PREFIX);
    hasher.update(&raw[..32]);
    hasher.update([ONION_VERSION]);
    let checksum = hasher.finalize();

    raw[32..34] == checksum[..2]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::Identity;

    #[test]
    fn test_derived_address_validates() {
        let id = Identity::generate();
        let address = onion_address_from_ed25519(&id.verifying_key());
        assert_eq!(address.len(), 56 + ".onion".len());
        assert!(validate_onion_address(&address));
    }

    #[test]
    fn test_derivation_is_deterministic() {
        let id = Identity::from_seed(&[5u8; 32]);
        let a = onion_address_from_ed25519(&id.verifying_key());
        let b = onion_address_from_ed25519(&id.verifying_key());
        assert_eq!(a, b);
    }

    #[test]
    fn test_rejects_malformed_addresses() {
        assert!(!validate_onion_address("example.com"));
        assert!(!validate_onion_address("short.onion"));
        assert!(!validate_onion_address(&format!("{}.onion", "A".repeat(56))));

        // Flip one character of a valid address: checksum breaks.
        let id = Identity::generate();
        let mut address = onion_address_from_ed25519(&id.verifying_key());
        let flipped = if address.starts_with('a') { 'b' } else { 'a' };
        address.replace_range(0..1, &flipped.to_string());
        assert!(!validate_onion_address(&address));
    }
}
