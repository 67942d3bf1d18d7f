//! Server-side key manager.
//!
//! The key manager holds a master key derived from a deployment password
//! and seals user identity keys and room keys for database storage. User
//! and room material is wrapped under separate subkeys, so blobs from one
//! domain cannot be opened in the other.

use base64::{engine::general_purpose::STANDARD, Engine as _};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;

use cipherchat_common::{Error, Result, SensitiveBytes};
use cipherchat_crypto::{
    aead, derive_key, generate_secure_token, KdfParams, Keypair, KeyDomain, MasterKey, RoomKey,
    Salt,
};

/// Current key format version, stored with every generated key.
pub const KEY_VERSION: u32 = 1;

/// Age at which room keys should be rotated.
pub const ROTATION_INTERVAL_DAYS: i64 = 30;

/// Sealed user identity keys, ready for database storage.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredUserKeys {
    /// Identity secret sealed under the keyring master key.
    pub sealed_secret: String,
    /// Public key in standard base64.
    pub public_key: String,
    /// Key format version.
    pub key_version: u32,
    /// When the keypair was generated.
    pub created_at: DateTime<Utc>,
}

/// Sealed room key, ready for database storage.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredRoomKey {
    /// Room key sealed under the keyring master key.
    pub sealed_key: String,
    /// Public identifier for this key (URL-safe token).
    pub key_id: String,
    /// Key format version.
    pub key_version: u32,
    /// When the key was generated.
    pub created_at: DateTime<Utc>,
    /// Previous sealed key, kept after rotation so existing history stays
    /// decryptable until re-encryption completes.
    pub previous_sealed_key: Option<String>,
}

/// Manages at-rest encryption of user and room keys.
pub struct KeyManager {
    salt: Salt,
    master: MasterKey,
}

impl KeyManager {
    /// Create a key manager with a fresh random salt.
    ///
    /// # Errors
    /// - Returns error if the password is empty or key derivation fails
    pub fn new(master_password: &[u8], params: &KdfParams) -> Result<Self> {
        Self::with_salt(master_password, Salt::generate(), params)
    }

    /// Re-open a key manager with a persisted salt.
    ///
    /// The same password and salt always yield the same master key, so
    /// blobs sealed by an earlier instance remain openable.
    pub fn with_salt(master_password: &[u8], salt: Salt, params: &KdfParams) -> Result<Self> {
        let master = derive_key(master_password, &salt, params)?;
        Ok(Self { salt, master })
    }

    /// The salt this manager derives its master key from.
    ///
    /// Must be persisted alongside the sealed keys.
    pub fn salt(&self) -> &Salt {
        &self.salt
    }

    /// Seal raw key material for storage.
    ///
    /// # Postconditions
    /// - Returns a base64 blob openable only by [`Self::open_key`] with the
    ///   same domain
    pub fn seal_key(&self, domain: KeyDomain, key: &[u8]) -> Result<String> {
        let wrap = self.master.derive_wrap_key(domain);
        let sealed = aead::encrypt(wrap.as_bytes(), key)?;
        Ok(STANDARD.encode(sealed))
    }

    /// Open a sealed key blob.
    ///
    /// # Errors
    /// - Returns error on invalid base64 or if the blob was sealed under a
    ///   different password or domain
    pub fn open_key(&self, domain: KeyDomain, sealed: &str) -> Result<SensitiveBytes> {
        let blob = STANDARD
            .decode(sealed)
            .map_err(|e| Error::Keyring(format!("Invalid sealed key encoding: {}", e)))?;
        let wrap = self.master.derive_wrap_key(domain);
        let key = aead::decrypt(wrap.as_bytes(), &blob)?;
        Ok(SensitiveBytes::new(key))
    }

    /// Generate a new identity keypair, sealed for storage.
    ///
    /// Used when the server escrows keys on behalf of a user; the sealed
    /// secret goes to the database, the public key to the user directory.
    pub fn generate_user_keys(&self) -> Result<StoredUserKeys> {
        let pair = Keypair::generate();
        let sealed_secret = self.seal_key(KeyDomain::User, pair.secret.as_bytes())?;

        debug!("Generated sealed user keypair");

        Ok(StoredUserKeys {
            sealed_secret,
            public_key: pair.public.to_base64(),
            key_version: KEY_VERSION,
            created_at: Utc::now(),
        })
    }

    /// Reassemble a keypair from its stored parts.
    ///
    /// # Errors
    /// - Returns error if the sealed secret cannot be opened or the parts
    ///   do not form a valid keypair
    pub fn load_user_keys(&self, sealed_secret: &str, public_key: &str) -> Result<Keypair> {
        let secret_bytes = self.open_key(KeyDomain::User, sealed_secret)?;
        let secret = cipherchat_crypto::IdentitySecretKey::from_bytes(secret_bytes.as_bytes())?;
        let public = cipherchat_crypto::IdentityPublicKey::from_base64(public_key)?;

        if secret.public_key() != public {
            return Err(Error::Keyring(
                "Stored public key does not match sealed secret".to_string(),
            ));
        }

        Ok(Keypair { secret, public })
    }

    /// Generate a new room key, sealed for storage.
    pub fn generate_room_key(&self) -> Result<StoredRoomKey> {
        let key = RoomKey::generate();
        let sealed_key = self.seal_key(KeyDomain::Room, key.as_bytes())?;

        debug!("Generated sealed room key");

        Ok(StoredRoomKey {
            sealed_key,
            key_id: generate_secure_token(16),
            key_version: KEY_VERSION,
            created_at: Utc::now(),
            previous_sealed_key: None,
        })
    }

    /// Open a sealed room key.
    pub fn open_room_key(&self, sealed: &str) -> Result<RoomKey> {
        let bytes = self.open_key(KeyDomain::Room, sealed)?;
        RoomKey::from_bytes(bytes.as_bytes())
    }

    /// Check whether a key is due for rotation based on its age.
    pub fn should_rotate(created_at: DateTime<Utc>) -> bool {
        Utc::now() - created_at > Duration::days(ROTATION_INTERVAL_DAYS)
    }

    /// Rotate a room key.
    ///
    /// # Preconditions
    /// - `old_sealed` must open under this manager
    ///
    /// # Postconditions
    /// - Returns a fresh sealed key carrying the old blob as
    ///   `previous_sealed_key`
    ///
    /// Messages encrypted with the old key need to be re-encrypted by the
    /// room members; until then the previous key stays available.
    pub fn rotate_room_key(&self, old_sealed: &str) -> Result<StoredRoomKey> {
        // Refuse to rotate a key we cannot open
        self.open_room_key(old_sealed)?;

        let mut rotated = self.generate_room_key()?;
        rotated.previous_sealed_key = Some(old_sealed.to_string());
        Ok(rotated)
    }
}

impl std::fmt::Debug for KeyManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "KeyManager {{ master: [REDACTED] }}")
    }
}
