//! Content verification hashes and random tokens.

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine as _};
use rand::RngCore;
use sha3::{Digest, Sha3_256};

/// Hash data for integrity verification (not encryption).
///
/// Clients hash the plaintext before encrypting so recipients can verify
/// the decrypted content; the server stores the hash alongside the
/// ciphertext without learning anything about the plaintext.
///
/// Returns the SHA3-256 digest as lowercase hex.
pub fn verification_hash(data: &[u8]) -> String {
    let digest = Sha3_256::digest(data);
    digest.iter().map(|b| format!("{:02x}", b)).collect()
}

/// Generate a cryptographically secure random token.
///
/// `len` is the number of random bytes; the result is URL-safe base64
/// without padding. Used for room key ids and session tokens.
pub fn generate_secure_token(len: usize) -> String {
    let mut bytes = vec![0u8; len];
    rand::thread_rng().fill_bytes(&mut bytes);
    URL_SAFE_NO_PAD.encode(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_verification_hash_deterministic() {
        let h1 = verification_hash(b"hello");
        let h2 = verification_hash(b"hello");
        assert_eq!(h1, h2);
    }

    #[test]
    fn test_verification_hash_format() {
        let hash = verification_hash(b"message");
        assert_eq!(hash.len(), 64);
        assert!(hash.chars().all(|c| c.is_ascii_hexdigit()));
        assert_eq!(hash, hash.to_lowercase());
    }

    #[test]
    fn test_verification_hash_differs() {
        assert_ne!(verification_hash(b"a"), verification_hash(b"b"));
    }

    #[test]
    fn test_token_uniqueness() {
        let t1 = generate_secure_token(32);
        let t2 = generate_secure_token(32);
        assert_ne!(t1, t2);
    }

    #[test]
    fn test_token_is_url_safe() {
        let token = generate_secure_token(64);
        assert!(!token.contains('+'));
        assert!(!token.contains('/'));
        assert!(!token.contains('='));
    }

    #[test]
    fn test_token_length_scales() {
        // 16 random bytes encode to 22 base64 characters
        assert_eq!(generate_secure_token(16).len(), 22);
    }
}
