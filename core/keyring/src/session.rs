//! Ephemeral session keys for forward secrecy.
//!
//! Each connection derives per-peer keys bound to its session id, so
//! compromise of one session's keys does not expose traffic from other
//! sessions between the same identities.

use std::collections::HashMap;

use cipherchat_common::Result;
use cipherchat_crypto::exchange::derive_subkey;
use cipherchat_crypto::{IdentityPublicKey, IdentitySecretKey, SessionKey};

/// HKDF info string for session key derivation.
pub const SESSION_INFO: &[u8] = b"session-key-v1";

/// Derives and caches per-session keys for one connection.
pub struct SessionKeyManager {
    session_id: String,
    secret: IdentitySecretKey,
    cache: HashMap<String, SessionKey>,
}

impl SessionKeyManager {
    /// Create a manager for one session.
    pub fn new(secret: IdentitySecretKey, session_id: impl Into<String>) -> Self {
        Self {
            session_id: session_id.into(),
            secret,
            cache: HashMap::new(),
        }
    }

    /// The session this manager is bound to.
    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    /// Derive the session key for a peer.
    ///
    /// The base shared secret is run through HKDF-SHA256 salted with
    /// `"{session_id}:{context}"`, so the same peer yields different keys
    /// in different sessions and contexts. Results are cached per peer.
    pub fn derive_session_key(
        &mut self,
        peer: &IdentityPublicKey,
        context: &str,
    ) -> Result<SessionKey> {
        let base = self.secret.diffie_hellman(peer).derive_session_key()?;

        let session_context = format!("{}:{}", self.session_id, context);
        let key = derive_subkey(
            base.as_bytes(),
            Some(session_context.as_bytes()),
            SESSION_INFO,
        )?;

        self.cache.insert(peer.to_base64(), key.clone());
        Ok(key)
    }

    /// Get a previously derived key for a peer, if any.
    pub fn cached(&self, peer: &IdentityPublicKey) -> Option<&SessionKey> {
        self.cache.get(&peer.to_base64())
    }

    /// Drop all cached session keys.
    ///
    /// Key material is zeroized as the cache entries drop.
    pub fn clear(&mut self) {
        self.cache.clear();
    }
}

impl std::fmt::Debug for SessionKeyManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "SessionKeyManager {{ session_id: {:?}, cached: {} }}",
            self.session_id,
            self.cache.len()
        )
    }
}
