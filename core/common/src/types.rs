//! Common identifier types used throughout CipherChat.
//!
//! Users, rooms, and messages are all keyed by UUIDs. Each gets its own
//! newtype so that a room id cannot be passed where a user id is expected.

use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;
use zeroize::Zeroize;

/// Unique identifier for a user account.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct UserId(Uuid);

impl UserId {
    /// Generate a fresh random id.
    pub fn generate() -> Self {
        Self(Uuid::new_v4())
    }

    /// Parse from a canonical UUID string.
    ///
    /// # Errors
    /// - Returns error if the string is not a valid UUID
    pub fn parse(id: &str) -> crate::Result<Self> {
        Uuid::parse_str(id)
            .map(Self)
            .map_err(|e| crate::Error::InvalidInput(format!("Invalid user id: {}", e)))
    }

    /// Get the inner UUID.
    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Unique identifier for a chat room.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RoomId(Uuid);

impl RoomId {
    /// Generate a fresh random id.
    pub fn generate() -> Self {
        Self(Uuid::new_v4())
    }

    /// Parse from a canonical UUID string.
    ///
    /// # Errors
    /// - Returns error if the string is not a valid UUID
    pub fn parse(id: &str) -> crate::Result<Self> {
        Uuid::parse_str(id)
            .map(Self)
            .map_err(|e| crate::Error::InvalidInput(format!("Invalid room id: {}", e)))
    }

    /// Get the inner UUID.
    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl fmt::Display for RoomId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Unique identifier for a stored message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MessageId(Uuid);

impl MessageId {
    /// Generate a fresh random id.
    pub fn generate() -> Self {
        Self(Uuid::new_v4())
    }

    /// Parse from a canonical UUID string.
    ///
    /// # Errors
    /// - Returns error if the string is not a valid UUID
    pub fn parse(id: &str) -> crate::Result<Self> {
        Uuid::parse_str(id)
            .map(Self)
            .map_err(|e| crate::Error::InvalidInput(format!("Invalid message id: {}", e)))
    }

    /// Get the inner UUID.
    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Sensitive data wrapper that zeroizes on drop.
///
/// Used for unwrapped key material in transit between the keyring and
/// callers. Never logged; Debug output is redacted.
#[derive(Clone, Zeroize)]
#[zeroize(drop)]
pub struct SensitiveBytes(Vec<u8>);

impl SensitiveBytes {
    /// Create new sensitive bytes.
    pub fn new(data: Vec<u8>) -> Self {
        Self(data)
    }

    /// Get a reference to the inner bytes.
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    /// Get the length.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Check if empty.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Debug for SensitiveBytes {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SensitiveBytes([REDACTED; {} bytes])", self.0.len())
    }
}
