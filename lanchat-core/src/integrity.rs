//! Integrity: whole-file SHA-256 digest, computed by the sender and checked on receive.

use sha2::{Digest, Sha256};

/// Hash a payload. Returns 32-byte digest.
pub fn hash_payload(payload: &[u8]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(payload);
    hasher.finalize().into()
}

/// Verify payload against expected hash.
pub fn verify_payload(payload: &[u8], expected_hash: &[u8; 32]) -> bool {
    hash_payload(payload) == *expected_hash
}
