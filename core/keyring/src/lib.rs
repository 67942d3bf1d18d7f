//! Key management for CipherChat.
//!
//! This module provides:
//! - Server-side sealing of user and room keys under a master password
//! - Password wrapping of user identity secrets
//! - Ephemeral per-session key derivation for forward secrecy
//! - Shareable public key bundles and human-readable fingerprints
//!
//! # Architecture
//! The keyring sits between the account/room services and the crypto
//! primitives: services hand it raw key material and store only the opaque
//! sealed blobs it returns.

pub mod bundle;
pub mod fingerprint;
pub mod locked;
pub mod manager;
pub mod session;

pub use bundle::PublicKeyBundle;
pub use fingerprint::{fingerprints_match, key_fingerprint};
pub use locked::LockedIdentity;
pub use manager::{KeyManager, StoredRoomKey, StoredUserKeys};
pub use session::SessionKeyManager;
