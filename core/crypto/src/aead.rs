//! Authenticated encryption using XChaCha20-Poly1305.
//!
//! XChaCha20-Poly1305 provides both confidentiality and authenticity,
//! with a 24-byte nonce that is safe for random generation.
//!
//! Two forms are offered: the combined form prepends the nonce to the
//! ciphertext (used for at-rest key blobs), and the detached form returns
//! the nonce separately (used by message envelopes, whose wire format
//! carries the nonce as its own field).

use chacha20poly1305::{
    aead::{generic_array::GenericArray, Aead, AeadCore, KeyInit, OsRng},
    XChaCha20Poly1305,
};

use crate::keys::KEY_LENGTH;
use cipherchat_common::{Error, Result};

/// Nonce size for XChaCha20-Poly1305 (24 bytes).
pub const NONCE_SIZE: usize = 24;

/// Authentication tag size (16 bytes).
pub const TAG_SIZE: usize = 16;

fn cipher_for(key: &[u8]) -> Result<XChaCha20Poly1305> {
    if key.len() != KEY_LENGTH {
        return Err(Error::Crypto(format!(
            "Invalid key length: expected {}, got {}",
            KEY_LENGTH,
            key.len()
        )));
    }
    Ok(XChaCha20Poly1305::new(GenericArray::from_slice(key)))
}

/// Encrypt plaintext, returning `nonce || ciphertext || tag`.
///
/// # Postconditions
/// - The nonce is randomly generated
/// - Output length is plaintext length + NONCE_SIZE + TAG_SIZE
///
/// # Errors
/// - Returns error if key length is incorrect
/// - Returns error if encryption fails
pub fn encrypt(key: &[u8], plaintext: &[u8]) -> Result<Vec<u8>> {
    let cipher = cipher_for(key)?;
    let nonce = XChaCha20Poly1305::generate_nonce(&mut OsRng);

    let ciphertext = cipher
        .encrypt(&nonce, plaintext)
        .map_err(|e| Error::Crypto(format!("Encryption failed: {}", e)))?;

    let mut result = Vec::with_capacity(NONCE_SIZE + ciphertext.len());
    result.extend_from_slice(&nonce);
    result.extend_from_slice(&ciphertext);

    Ok(result)
}

/// Decrypt `nonce || ciphertext || tag` produced by [`encrypt`].
///
/// # Errors
/// - Returns error if key length is incorrect
/// - Returns error if ciphertext is too short
/// - Returns error if authentication fails (tampered data)
pub fn decrypt(key: &[u8], ciphertext: &[u8]) -> Result<Vec<u8>> {
    if ciphertext.len() < NONCE_SIZE + TAG_SIZE {
        return Err(Error::Crypto("Ciphertext too short".to_string()));
    }

    let (nonce_bytes, encrypted) = ciphertext.split_at(NONCE_SIZE);
    let nonce = GenericArray::from_slice(nonce_bytes);

    cipher_for(key)?
        .decrypt(nonce, encrypted)
        .map_err(|e| Error::Crypto(format!("Decryption failed: {}", e)))
}

/// Encrypt plaintext with a fresh random nonce, returned separately.
///
/// # Postconditions
/// - Returns `(nonce, ciphertext || tag)`
pub fn seal_detached(key: &[u8], plaintext: &[u8]) -> Result<([u8; NONCE_SIZE], Vec<u8>)> {
    let cipher = cipher_for(key)?;
    let nonce = XChaCha20Poly1305::generate_nonce(&mut OsRng);

    let ciphertext = cipher
        .encrypt(&nonce, plaintext)
        .map_err(|e| Error::Crypto(format!("Encryption failed: {}", e)))?;

    let mut nonce_bytes = [0u8; NONCE_SIZE];
    nonce_bytes.copy_from_slice(nonce.as_slice());
    Ok((nonce_bytes, ciphertext))
}

/// Decrypt a detached-nonce ciphertext produced by [`seal_detached`].
///
/// # Errors
/// - Returns error if key length is incorrect
/// - Returns error if ciphertext is shorter than the tag
/// - Returns error if authentication fails
pub fn open_detached(key: &[u8], nonce: &[u8; NONCE_SIZE], ciphertext: &[u8]) -> Result<Vec<u8>> {
    if ciphertext.len() < TAG_SIZE {
        return Err(Error::Crypto("Ciphertext too short".to_string()));
    }

    let nonce = GenericArray::from_slice(nonce);
    cipher_for(key)?
        .decrypt(nonce, ciphertext)
        .map_err(|e| Error::Crypto(format!("Decryption failed: {}", e)))
}
