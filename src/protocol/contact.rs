//! Read-only view of the contact database.
//!
//! The core does not own contact storage; the embedding application
//! supplies a [`ContactDirectory`] the engines consult to resolve
//! inbound frames (by X25519 key) and outbound targets (by contact id).

use std::collections::HashMap;
use std::sync::Mutex;

use ed25519_dalek::VerifyingKey;

use crate::crypto::eq_32;

pub type ContactId = i64;

/// One contact as the core sees it. Keys are immutable for the lifetime
/// of the record; the messaging address may be updated by the app.
#[derive(Clone, Debug)]
pub struct ContactRecord {
    pub id: ContactId,
    pub display_name: String,
    /// Hidden-service address messages are dialed to (`<56 base32>.onion`).
    pub messaging_onion: String,
    pub ed25519_pub: [u8; 32],
    pub x25519_pub: [u8; 32],
}

impl ContactRecord {
    /// The contact's Ed25519 key as a verifier, if well-formed.
    pub fn verifying_key(&self) -> Option<VerifyingKey> {
        VerifyingKey::from_bytes(&self.ed25519_pub).ok()
    }
}

/// Read-only contact lookup the engines depend on.
pub trait ContactDirectory: Send + Sync {
    fn get(&self, id: ContactId) -> Option<ContactRecord>;

    /// Resolve the sender of an inbound frame by the X25519 key carried
    /// in its cleartext header.
    fn find_by_x25519(&self, key: &[u8; 32]) -> Option<ContactRecord>;

    fn all(&self) -> Vec<ContactRecord>;
}

/// In-memory directory for tests and simple embedders.
#[derive(Default)]
pub struct MemoryDirectory {
    contacts: Mutex<HashMap<ContactId, ContactRecord>>,
}

impl MemoryDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, record: ContactRecord) {
        self.contacts
            .lock()
            .expect("contact directory lock poisoned")
            .insert(record.id, record);
    }
}

impl ContactDirectory for MemoryDirectory {
    fn get(&self, id: ContactId) -> Option<ContactRecord> {
        self.contacts
            .lock()
            .expect("contact directory lock poisoned")
            .get(&id)
            .cloned()
    }

    fn find_by_x25519(&self, key: &[u8; 32]) -> Option<ContactRecord> {
        self.contacts
            .lock()
            .expect("contact directory lock poisoned")
            .values()
            .find(|c| eq_32(&c.x25519_pub, key))
            .cloned()
    }

    fn all(&self) -> Vec<ContactRecord> {
        self.contacts
            .lock()
            .expect("contact directory lock poisoned")
            .values()
            .cloned()
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::Identity;

    fn record(id: ContactId, identity: &Identity) -> ContactRecord {
        ContactRecord {
            id,
            display_name: format!("peer-{id}"),
            messaging_onion: format!("{}.onion", "a".repeat(56)),
            ed25519_pub: identity.public_bytes(),
            x25519_pub: identity.x25519_public(),
        }
    }

    #[test]
    fn test_lookup_by_x25519() {
        let dir = MemoryDirectory::new();
        let alice = Identity::generate();
        let bob = Identity::generate();
        dir.add(record(1, &alice));
        dir.add(record(2, &bob));

        let found = dir.find_by_x25519(&bob.x25519_public()).unwrap();
        assert_eq!(found.id, 2);
        assert!(dir.find_by_x25519(&[0u8; 32]).is_none());
    }

    #[test]
    fn test_verifying_key_round_trips() {
        let alice = Identity::generate();
        let rec = record(1, &alice);
        assert_eq!(
            rec.verifying_key().unwrap().to_bytes(),
            alice.public_bytes()
        );
    }
}
