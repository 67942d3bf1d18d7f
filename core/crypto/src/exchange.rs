//! X25519 Diffie-Hellman key exchange with HKDF-SHA256 key derivation.
//!
//! Every user has a long-term X25519 identity keypair. Two users derive the
//! same session key from their own secret and the peer's public key, which
//! then drives XChaCha20-Poly1305 for direct messages and room key
//! distribution.
//!
//! ## Security Notes
//!
//! - Secret keys are zeroized on drop and are not cloneable
//! - Shared secrets are never used directly; HKDF-SHA256 derives the
//!   actual encryption key

use hkdf::Hkdf;
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use x25519_dalek::{PublicKey as DalekPublic, StaticSecret};
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::keys::{SessionKey, KEY_LENGTH};
use cipherchat_common::{Error, Result};

/// Size of X25519 public keys in bytes.
pub const PUBLIC_KEY_SIZE: usize = 32;

/// Size of X25519 secret keys in bytes.
pub const SECRET_KEY_SIZE: usize = 32;

/// HKDF info string binding derived keys to this protocol.
pub const E2E_INFO: &[u8] = b"cipherchat-e2e-v1";

/// X25519 public key identifying a user.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdentityPublicKey {
    bytes: [u8; PUBLIC_KEY_SIZE],
}

impl IdentityPublicKey {
    /// Create from raw bytes.
    ///
    /// # Errors
    /// - Returns error if the slice is not exactly 32 bytes
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        if bytes.len() != PUBLIC_KEY_SIZE {
            return Err(Error::Crypto(format!(
                "Invalid public key length: expected {}, got {}",
                PUBLIC_KEY_SIZE,
                bytes.len()
            )));
        }
        let mut arr = [0u8; PUBLIC_KEY_SIZE];
        arr.copy_from_slice(bytes);
        Ok(Self { bytes: arr })
    }

    /// Get the key as bytes.
    pub fn as_bytes(&self) -> &[u8; PUBLIC_KEY_SIZE] {
        &self.bytes
    }

    /// Convert to a byte array.
    pub fn to_bytes(&self) -> [u8; PUBLIC_KEY_SIZE] {
        self.bytes
    }

    /// Encode as standard base64, the directory representation.
    pub fn to_base64(&self) -> String {
        use base64::{engine::general_purpose::STANDARD, Engine as _};
        STANDARD.encode(self.bytes)
    }

    /// Decode from standard base64.
    ///
    /// # Errors
    /// - Returns error on invalid base64 or wrong decoded length
    pub fn from_base64(encoded: &str) -> Result<Self> {
        use base64::{engine::general_purpose::STANDARD, Engine as _};
        let bytes = STANDARD
            .decode(encoded)
            .map_err(|e| Error::Crypto(format!("Invalid public key encoding: {}", e)))?;
        Self::from_bytes(&bytes)
    }
}

impl std::fmt::Debug for IdentityPublicKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "IdentityPublicKey({:02x}{:02x}..)",
            self.bytes[0], self.bytes[1]
        )
    }
}

/// X25519 secret key for a user identity.
///
/// Clone is intentionally not implemented; secret material should not be
/// duplicated in memory. Persisted copies go through
/// password wrapping in the keyring crate.
#[derive(Zeroize, ZeroizeOnDrop)]
pub struct IdentitySecretKey {
    bytes: [u8; SECRET_KEY_SIZE],
}

impl IdentitySecretKey {
    /// Generate a new random secret key.
    pub fn generate() -> Self {
        let secret = StaticSecret::random_from_rng(OsRng);
        Self {
            bytes: secret.to_bytes(),
        }
    }

    /// Create from raw bytes.
    ///
    /// # Security
    /// Only use bytes from a secure source.
    ///
    /// # Errors
    /// - Returns error if the slice is not exactly 32 bytes
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        if bytes.len() != SECRET_KEY_SIZE {
            return Err(Error::Crypto(format!(
                "Invalid secret key length: expected {}, got {}",
                SECRET_KEY_SIZE,
                bytes.len()
            )));
        }
        let mut arr = [0u8; SECRET_KEY_SIZE];
        arr.copy_from_slice(bytes);
        Ok(Self { bytes: arr })
    }

    /// Get the corresponding public key.
    pub fn public_key(&self) -> IdentityPublicKey {
        let secret = StaticSecret::from(self.bytes);
        let public = DalekPublic::from(&secret);
        IdentityPublicKey {
            bytes: public.to_bytes(),
        }
    }

    /// Perform Diffie-Hellman key exchange with a peer's public key.
    pub fn diffie_hellman(&self, peer: &IdentityPublicKey) -> SharedSecret {
        let secret = StaticSecret::from(self.bytes);
        let peer_key = DalekPublic::from(peer.bytes);
        let shared = secret.diffie_hellman(&peer_key);
        SharedSecret {
            bytes: shared.to_bytes(),
        }
    }

    /// Get raw bytes for password wrapping.
    ///
    /// # Security
    /// Handle with care; this exposes the secret key.
    pub fn as_bytes(&self) -> &[u8; SECRET_KEY_SIZE] {
        &self.bytes
    }
}

impl std::fmt::Debug for IdentitySecretKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "IdentitySecretKey([REDACTED])")
    }
}

/// A user's identity keypair.
pub struct Keypair {
    /// The secret half, zeroized on drop.
    pub secret: IdentitySecretKey,
    /// The shareable public half.
    pub public: IdentityPublicKey,
}

impl Keypair {
    /// Generate a fresh identity keypair.
    pub fn generate() -> Self {
        let secret = IdentitySecretKey::generate();
        let public = secret.public_key();
        Self { secret, public }
    }
}

impl std::fmt::Debug for Keypair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Keypair {{ public: {:?} }}", self.public)
    }
}

/// Shared secret from Diffie-Hellman key exchange.
///
/// Raw curve output; always passed through HKDF before use as a key.
#[derive(Zeroize, ZeroizeOnDrop)]
pub struct SharedSecret {
    bytes: [u8; KEY_LENGTH],
}

impl SharedSecret {
    /// Derive the direct-message session key for this pair of identities.
    ///
    /// Uses HKDF-SHA256 with the protocol info string; both sides of the
    /// exchange derive the same key.
    pub fn derive_session_key(&self) -> Result<SessionKey> {
        derive_subkey(&self.bytes, None, E2E_INFO)
    }

    /// Get the raw shared secret bytes.
    ///
    /// # Security
    /// Only for feeding a KDF; never use directly as an encryption key.
    pub fn as_bytes(&self) -> &[u8; KEY_LENGTH] {
        &self.bytes
    }
}

impl std::fmt::Debug for SharedSecret {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "SharedSecret([REDACTED])")
    }
}

/// Derive a 32-byte subkey from input key material via HKDF-SHA256.
///
/// The salt provides context separation (e.g. per-session contexts) and
/// the info string binds the key to its purpose.
pub fn derive_subkey(ikm: &[u8], salt: Option<&[u8]>, info: &[u8]) -> Result<SessionKey> {
    let hk = Hkdf::<Sha256>::new(salt, ikm);
    let mut okm = [0u8; KEY_LENGTH];
    hk.expand(info, &mut okm)
        .map_err(|_| Error::Crypto("HKDF expansion failed".to_string()))?;
    Ok(SessionKey::from_bytes(okm))
}
