//! Key derivation using Argon2id.
//!
//! Argon2id is a memory-hard password hashing function that provides
//! resistance to both GPU and time-memory trade-off attacks. It derives
//! the keyring master key and the keys that wrap user identity secrets.

use argon2::{Algorithm, Argon2, Params, Version};
use serde::{Deserialize, Serialize};
use subtle::ConstantTimeEq;

use crate::keys::{MasterKey, Salt, KEY_LENGTH};
use cipherchat_common::{Error, Result};

/// Parameters for Argon2id key derivation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KdfParams {
    /// Memory cost in KiB (e.g., 65536 = 64 MiB).
    pub memory_cost: u32,
    /// Number of iterations.
    pub time_cost: u32,
    /// Degree of parallelism.
    pub parallelism: u32,
}

impl KdfParams {
    /// Create parameters suitable for interactive use.
    ///
    /// These parameters provide a balance between security and usability,
    /// targeting approximately 0.5-1 second of derivation time per login.
    pub fn interactive() -> Self {
        Self {
            memory_cost: 65536, // 64 MiB
            time_cost: 3,
            parallelism: 4,
        }
    }

    /// Create higher-cost parameters for long-lived keys.
    pub fn sensitive() -> Self {
        Self {
            memory_cost: 262144, // 256 MiB
            time_cost: 4,
            parallelism: 4,
        }
    }

    /// Create moderate parameters for constrained devices and tests.
    pub fn moderate() -> Self {
        Self {
            memory_cost: 32768, // 32 MiB
            time_cost: 3,
            parallelism: 2,
        }
    }
}

impl Default for KdfParams {
    fn default() -> Self {
        Self::interactive()
    }
}

/// Derive a key from a password and salt using Argon2id.
///
/// # Preconditions
/// - `password` must not be empty
///
/// # Postconditions
/// - The derived key is deterministic given the same inputs
///
/// # Errors
/// - Returns error if password is empty
/// - Returns error if Argon2id parameters are invalid
///
/// # Security
/// - Password is not stored or logged
pub fn derive_key(password: &[u8], salt: &Salt, params: &KdfParams) -> Result<MasterKey> {
    if password.is_empty() {
        return Err(Error::InvalidInput("Password cannot be empty".to_string()));
    }

    let argon2_params = Params::new(
        params.memory_cost,
        params.time_cost,
        params.parallelism,
        Some(KEY_LENGTH),
    )
    .map_err(|e| Error::Crypto(format!("Invalid KDF parameters: {}", e)))?;

    let argon2 = Argon2::new(Algorithm::Argon2id, Version::V0x13, argon2_params);

    let mut key_bytes = [0u8; KEY_LENGTH];
    argon2
        .hash_password_into(password, salt.as_bytes(), &mut key_bytes)
        .map_err(|e| Error::Crypto(format!("Key derivation failed: {}", e)))?;

    Ok(MasterKey::from_bytes(key_bytes))
}

/// Verify that a password produces the expected key.
///
/// The comparison runs in constant time to prevent timing attacks.
pub fn verify_password(
    password: &[u8],
    salt: &Salt,
    params: &KdfParams,
    expected: &MasterKey,
) -> Result<bool> {
    let derived = derive_key(password, salt, params)?;
    Ok(derived.as_bytes().ct_eq(expected.as_bytes()).into())
}
