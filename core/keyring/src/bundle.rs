//! Shareable public key bundles.
//!
//! Bundles let users exchange public keys out of band (QR codes, links)
//! for identity verification. The payload is JSON wrapped in URL-safe
//! base64 so it survives copy/paste and URLs.

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine as _};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use cipherchat_common::{Error, Result};

use crate::manager::KEY_VERSION;

/// Key exchange algorithm identifier carried in bundles.
pub const BUNDLE_ALGORITHM: &str = "X25519";

/// A public key in shareable form.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PublicKeyBundle {
    /// Public key in standard base64.
    pub public_key: String,
    /// Key exchange algorithm, always `"X25519"`.
    pub algorithm: String,
    /// Key format version.
    pub version: u32,
    /// When the bundle was exported.
    pub exported_at: DateTime<Utc>,
}

impl PublicKeyBundle {
    /// Create a bundle for a public key.
    pub fn new(public_key: impl Into<String>) -> Self {
        Self {
            public_key: public_key.into(),
            algorithm: BUNDLE_ALGORITHM.to_string(),
            version: KEY_VERSION,
            exported_at: Utc::now(),
        }
    }

    /// Export as a URL-safe string.
    pub fn export(&self) -> Result<String> {
        let json = serde_json::to_vec(self).map_err(|e| Error::Serialization(e.to_string()))?;
        Ok(URL_SAFE_NO_PAD.encode(json))
    }

    /// Import a bundle from its exported form.
    ///
    /// # Errors
    /// - Returns error on malformed encoding or JSON
    /// - Returns error if the algorithm is not X25519
    pub fn import(encoded: &str) -> Result<Self> {
        let json = URL_SAFE_NO_PAD
            .decode(encoded)
            .map_err(|e| Error::Serialization(format!("Invalid bundle encoding: {}", e)))?;
        let bundle: Self =
            serde_json::from_slice(&json).map_err(|e| Error::Serialization(e.to_string()))?;

        if bundle.algorithm != BUNDLE_ALGORITHM {
            return Err(Error::InvalidInput(format!(
                "Unsupported bundle algorithm: {}",
                bundle.algorithm
            )));
        }

        Ok(bundle)
    }
}
