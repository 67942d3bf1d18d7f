//! Password-wrapped identity secrets.
//!
//! A user's identity secret never touches the database in the clear: at
//! registration it is sealed under a key derived from the login password,
//! and only a successful unseal at login puts it back in memory.
//!
//! Blob layout, base64-encoded as one string:
//! `salt(16) || nonce(24) || ciphertext || tag`.

use base64::{engine::general_purpose::STANDARD, Engine as _};

use cipherchat_common::{Error, Result};
use cipherchat_crypto::keys::SALT_LENGTH;
use cipherchat_crypto::{aead, derive_key, IdentitySecretKey, KdfParams, Salt};

/// An identity secret sealed under a password-derived key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockedIdentity {
    blob: String,
}

impl LockedIdentity {
    /// Seal an identity secret under a password.
    ///
    /// # Postconditions
    /// - A fresh salt is generated, so sealing the same secret twice
    ///   produces different blobs
    ///
    /// # Errors
    /// - Returns error if the password is empty
    pub fn seal(
        secret: &IdentitySecretKey,
        password: &[u8],
        params: &KdfParams,
    ) -> Result<Self> {
        let salt = Salt::generate();
        let key = derive_key(password, &salt, params)?;
        let sealed = aead::encrypt(key.as_bytes(), secret.as_bytes())?;

        let mut blob = Vec::with_capacity(SALT_LENGTH + sealed.len());
        blob.extend_from_slice(salt.as_bytes());
        blob.extend_from_slice(&sealed);

        Ok(Self {
            blob: STANDARD.encode(blob),
        })
    }

    /// Unseal the identity secret with the password.
    ///
    /// # Errors
    /// - Returns a `Crypto` error on a wrong password (authentication
    ///   failure); callers treat this as a failed login
    pub fn unseal(&self, password: &[u8], params: &KdfParams) -> Result<IdentitySecretKey> {
        let blob = STANDARD
            .decode(&self.blob)
            .map_err(|e| Error::Keyring(format!("Invalid locked identity encoding: {}", e)))?;

        if blob.len() <= SALT_LENGTH {
            return Err(Error::Keyring("Locked identity blob too short".to_string()));
        }

        let (salt_bytes, sealed) = blob.split_at(SALT_LENGTH);
        let mut salt = [0u8; SALT_LENGTH];
        salt.copy_from_slice(salt_bytes);

        let key = derive_key(password, &Salt::from_bytes(salt), params)?;
        let secret_bytes = aead::decrypt(key.as_bytes(), sealed)?;

        IdentitySecretKey::from_bytes(&secret_bytes)
    }

    /// Wrap an already-encoded blob loaded from storage.
    pub fn from_blob(blob: impl Into<String>) -> Self {
        Self { blob: blob.into() }
    }

    /// The storable blob string.
    pub fn blob(&self) -> &str {
        &self.blob
    }
}
