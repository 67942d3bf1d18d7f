//! Key types with secure memory handling.
//!
//! All secret key types zeroize their memory on drop and print a redacted
//! Debug representation so key material cannot leak through logging.

use serde::{Deserialize, Serialize};
use std::fmt;
use zeroize::{Zeroize, ZeroizeOnDrop};

/// Length of symmetric encryption keys in bytes (256-bit).
pub const KEY_LENGTH: usize = 32;

/// Length of Argon2id salts in bytes.
pub const SALT_LENGTH: usize = 16;

/// Domain tag for at-rest key wrapping.
///
/// The keyring wraps user identity keys and room keys under separate
/// subkeys so a blob sealed in one domain cannot be opened in the other.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyDomain {
    /// User identity secrets escrowed by the server.
    User,
    /// Room symmetric keys sealed at rest.
    Room,
}

impl KeyDomain {
    fn label(self) -> &'static [u8] {
        match self {
            KeyDomain::User => b"userkeys",
            KeyDomain::Room => b"roomkeys",
        }
    }
}

/// Master key derived from the keyring password.
///
/// This key is the root of the at-rest key hierarchy; wrap keys for each
/// [`KeyDomain`] are derived from it and it never encrypts data directly.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct MasterKey {
    key: [u8; KEY_LENGTH],
}

impl MasterKey {
    /// Create a master key from raw bytes.
    pub fn from_bytes(key: [u8; KEY_LENGTH]) -> Self {
        Self { key }
    }

    /// Get the key bytes.
    ///
    /// # Security
    /// The returned slice should be used immediately and not stored.
    pub fn as_bytes(&self) -> &[u8; KEY_LENGTH] {
        &self.key
    }

    /// Derive the wrap key for a key domain.
    ///
    /// Uses Blake2b for domain-separated key derivation.
    pub fn derive_wrap_key(&self, domain: KeyDomain) -> WrapKey {
        use blake2::digest::consts::U32;
        use blake2::{Blake2b, Digest};

        let mut hasher = Blake2b::<U32>::new();
        hasher.update(self.key);
        hasher.update(domain.label());
        hasher.update(b"wrapkey");

        let result = hasher.finalize();
        let mut derived = [0u8; KEY_LENGTH];
        derived.copy_from_slice(&result);
        WrapKey::from_bytes(derived)
    }
}

impl fmt::Debug for MasterKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "MasterKey([REDACTED])")
    }
}

/// Key used to wrap other keys at rest.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct WrapKey {
    key: [u8; KEY_LENGTH],
}

impl WrapKey {
    /// Create a wrap key from raw bytes.
    pub fn from_bytes(key: [u8; KEY_LENGTH]) -> Self {
        Self { key }
    }

    /// Get the key bytes.
    pub fn as_bytes(&self) -> &[u8; KEY_LENGTH] {
        &self.key
    }
}

impl fmt::Debug for WrapKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "WrapKey([REDACTED])")
    }
}

/// Shared symmetric key for a chat room.
///
/// Distributed to members wrapped under their identity keys; see
/// [`crate::envelope::wrap_room_key`].
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct RoomKey {
    key: [u8; KEY_LENGTH],
}

impl RoomKey {
    /// Generate a random room key.
    pub fn generate() -> Self {
        use rand::RngCore;
        let mut key = [0u8; KEY_LENGTH];
        rand::thread_rng().fill_bytes(&mut key);
        Self { key }
    }

    /// Create a room key from raw bytes.
    ///
    /// # Errors
    /// - Returns error if the slice is not exactly KEY_LENGTH bytes
    pub fn from_bytes(bytes: &[u8]) -> cipherchat_common::Result<Self> {
        if bytes.len() != KEY_LENGTH {
            return Err(cipherchat_common::Error::Crypto(format!(
                "Invalid room key length: expected {}, got {}",
                KEY_LENGTH,
                bytes.len()
            )));
        }
        let mut key = [0u8; KEY_LENGTH];
        key.copy_from_slice(bytes);
        Ok(Self { key })
    }

    /// Get the key bytes.
    pub fn as_bytes(&self) -> &[u8; KEY_LENGTH] {
        &self.key
    }

    /// Encode as standard base64, the form room keys take inside
    /// key-distribution envelopes.
    pub fn to_base64(&self) -> String {
        use base64::{engine::general_purpose::STANDARD, Engine as _};
        STANDARD.encode(self.key)
    }

    /// Decode from standard base64.
    ///
    /// # Errors
    /// - Returns error on invalid base64 or wrong decoded length
    pub fn from_base64(encoded: &str) -> cipherchat_common::Result<Self> {
        use base64::{engine::general_purpose::STANDARD, Engine as _};
        let bytes = STANDARD
            .decode(encoded)
            .map_err(|e| cipherchat_common::Error::Crypto(format!("Invalid room key encoding: {}", e)))?;
        Self::from_bytes(&bytes)
    }
}

impl fmt::Debug for RoomKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "RoomKey([REDACTED])")
    }
}

/// Symmetric key derived for one conversation via key exchange.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct SessionKey {
    key: [u8; KEY_LENGTH],
}

impl SessionKey {
    /// Create a session key from raw bytes.
    pub fn from_bytes(key: [u8; KEY_LENGTH]) -> Self {
        Self { key }
    }

    /// Get the key bytes.
    pub fn as_bytes(&self) -> &[u8; KEY_LENGTH] {
        &self.key
    }
}

impl fmt::Debug for SessionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SessionKey([REDACTED])")
    }
}

/// Salt for password key derivation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Salt(pub [u8; SALT_LENGTH]);

impl Salt {
    /// Generate a random salt.
    pub fn generate() -> Self {
        use rand::RngCore;
        let mut salt = [0u8; SALT_LENGTH];
        rand::thread_rng().fill_bytes(&mut salt);
        Self(salt)
    }

    /// Create from bytes.
    pub fn from_bytes(bytes: [u8; SALT_LENGTH]) -> Self {
        Self(bytes)
    }

    /// Get the salt bytes.
    pub fn as_bytes(&self) -> &[u8; SALT_LENGTH] {
        &self.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wrap_key_domain_separation() {
        let master = MasterKey::from_bytes([7u8; KEY_LENGTH]);

        let user_key = master.derive_wrap_key(KeyDomain::User);
        let room_key = master.derive_wrap_key(KeyDomain::Room);

        assert_ne!(user_key.as_bytes(), room_key.as_bytes());

        // Same domain should produce the same key
        let again = master.derive_wrap_key(KeyDomain::User);
        assert_eq!(user_key.as_bytes(), again.as_bytes());
    }

    #[test]
    fn test_room_key_generate() {
        let key1 = RoomKey::generate();
        let key2 = RoomKey::generate();
        assert_ne!(key1.as_bytes(), key2.as_bytes());
    }

    #[test]
    fn test_room_key_base64_roundtrip() {
        let key = RoomKey::generate();
        let encoded = key.to_base64();
        let restored = RoomKey::from_base64(&encoded).unwrap();
        assert_eq!(key.as_bytes(), restored.as_bytes());
    }

    #[test]
    fn test_room_key_rejects_wrong_length() {
        assert!(RoomKey::from_bytes(&[0u8; 16]).is_err());
        assert!(RoomKey::from_base64("AAAA").is_err());
        assert!(RoomKey::from_base64("not base64!!!").is_err());
    }

    #[test]
    fn test_salt_generate() {
        let salt1 = Salt::generate();
        let salt2 = Salt::generate();
        assert_ne!(salt1.as_bytes(), salt2.as_bytes());
    }

    #[test]
    fn test_secret_debug_redacted() {
        let master = MasterKey::from_bytes([1u8; KEY_LENGTH]);
        let room = RoomKey::generate();
        let session = SessionKey::from_bytes([2u8; KEY_LENGTH]);

        assert!(format!("{:?}", master).contains("REDACTED"));
        assert!(format!("{:?}", room).contains("REDACTED"));
        assert!(format!("{:?}", session).contains("REDACTED"));
    }
}
