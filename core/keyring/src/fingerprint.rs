//! Human-readable key fingerprints.
//!
//! Users compare fingerprints over a trusted channel to verify each
//! other's identity keys and detect man-in-the-middle substitution.

use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;

use cipherchat_crypto::IdentityPublicKey;

/// Render a public key as a verification fingerprint.
///
/// Format: the first 16 bytes of the SHA-256 digest as uppercase hex,
/// in 8 space-separated groups of 4 characters, e.g.
/// `1A2B 3C4D 5E6F 7A8B 9C0D 1E2F 3A4B 5C6D`.
pub fn key_fingerprint(key: &IdentityPublicKey) -> String {
    let digest = Sha256::digest(key.as_bytes());

    let hex: String = digest[..16]
        .iter()
        .map(|b| format!("{:02X}", b))
        .collect();

    hex.as_bytes()
        .chunks(4)
        .map(|chunk| std::str::from_utf8(chunk).unwrap_or_default())
        .collect::<Vec<_>>()
        .join(" ")
}

/// Compare two rendered fingerprints in constant time.
///
/// Length mismatch returns false without leaking where they differ.
pub fn fingerprints_match(a: &str, b: &str) -> bool {
    a.as_bytes().ct_eq(b.as_bytes()).into()
}
