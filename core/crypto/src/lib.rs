//! Cryptographic primitives for CipherChat.
//!
//! This module provides:
//! - Key derivation from passwords using Argon2id
//! - Authenticated encryption using XChaCha20-Poly1305
//! - X25519 key exchange with HKDF-SHA256 session key derivation
//! - Message envelopes for direct, room, and key-distribution traffic
//! - Content verification hashes and random tokens
//!
//! # Security Guarantees
//! - All key material is automatically zeroized on drop
//! - No plaintext or key material is ever logged
//! - Constant-time operations for sensitive comparisons

pub mod aead;
pub mod envelope;
pub mod exchange;
pub mod hash;
pub mod kdf;
pub mod keys;

pub use aead::{decrypt, encrypt, open_detached, seal_detached};
pub use envelope::Envelope;
pub use exchange::{IdentityPublicKey, IdentitySecretKey, Keypair, SharedSecret};
pub use hash::{generate_secure_token, verification_hash};
pub use kdf::{derive_key, verify_password, KdfParams};
pub use keys::{KeyDomain, MasterKey, RoomKey, Salt, SessionKey, WrapKey};
