//! Account management for CipherChat.
//!
//! This module provides:
//! - Registration with identity key generation and password wrapping
//! - Login with lockout protection and session issuance
//! - Password changes that re-wrap the identity secret
//! - The public key directory lookup
//!
//! Every security-relevant transition is written to the audit trail.

pub mod service;

pub use service::{AccountService, AuthenticatedUser, SESSION_TTL_HOURS};
