//! Constant-time comparisons for key material.
//!
//! Key and id comparisons on untrusted input must not leak position of the
//! first differing byte through timing.

use subtle::ConstantTimeEq;

/// Constant-time equality for 24-byte values (ping-ids, nonces).
pub fn eq_24(a: &[u8; 24], b: &[u8; 24]) -> bool {
    a[..].ct_eq(&b[..]).into()
}

/// Constant-time equality for 32-byte values (public keys, session keys).
pub fn eq_32(a: &[u8; 32], b: &[u8; 32]) -> bool {
    a[..].ct_eq(&b[..]).into()
}

/// Constant-time equality for arbitrary equal-length slices.
/// Returns false immediately on length mismatch (length is not secret).
pub fn eq_slices(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.ct_eq(b).into()
}
