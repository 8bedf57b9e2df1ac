//! Long-term peer identity.
//!
//! Each peer owns an Ed25519 signing key; the X25519 agreement key is
//! derived from it deterministically via the birational map between the
//! Edwards and Montgomery forms of Curve25519. Same seed, same identity,
//! same agreement key forever.

use ed25519_dalek::{Signature, Signer, SigningKey, VerifyingKey};
use rand::rngs::OsRng;
use thiserror::Error;
use x25519_dalek::StaticSecret;

#[derive(Error, Debug)]
pub enum IdentityError {
    #[error("invalid key length")]
    InvalidKeyLength,
    #[error("invalid public key encoding")]
    InvalidPublicKey,
}

pub type Result<T> = std::result::Result<T, IdentityError>;

/// A peer's long-term key pair: Ed25519 for signing, X25519 for agreement.
pub struct Identity {
    signing: SigningKey,
    agreement: StaticSecret,
    agreement_public: [u8; 32],
}

impl Identity {
    /// Generate a fresh random identity.
    pub fn generate() -> Self {
        let signing = SigningKey::generate(&mut OsRng);
        Self::from_signing_key(signing)
    }

    /// Rebuild an identity from a 32-byte Ed25519 seed.
    pub fn from_seed(seed: &[u8; 32]) -> Self {
        Self::from_signing_key(SigningKey::from_bytes(seed))
    }

    fn from_signing_key(signing: SigningKey) -> Self {
        // Clamped scalar of the Ed25519 key doubles as the X25519 secret;
        // the Montgomery u-coordinate of the public point is the X25519 public.
        let agreement = StaticSecret::from(signing.to_scalar_bytes());
        let agreement_public = signing.verifying_key().to_montgomery().to_bytes();
        Self {
            signing,
            agreement,
            agreement_public,
        }
    }

    /// Ed25519 verifying (public) key.
    pub fn verifying_key(&self) -> VerifyingKey {
        self.signing.verifying_key()
    }

    /// Ed25519 public key bytes.
    pub fn public_bytes(&self) -> [u8; 32] {
        self.signing.verifying_key().to_bytes()
    }

    /// X25519 agreement public key bytes.
    pub fn x25519_public(&self) -> [u8; 32] {
        self.agreement_public
    }

    /// Sign a message under the long-term identity.
    pub fn sign(&self, message: &[u8]) -> Signature {
        self.signing.sign(message)
    }

    pub(crate) fn agreement_secret(&self) -> &StaticSecret {
        &self.agreement
    }
}

/// Derive the X25519 public key matching a peer's Ed25519 identity key.
///
/// Contact records carry both keys; this lets a consumer cross-check that
/// the pair actually belongs together.
pub fn x25519_public_of(ed25519: &VerifyingKey) -> [u8; 32] {
    ed25519.to_montgomery().to_bytes()
}
