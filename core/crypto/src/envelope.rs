//! Message envelopes for end-to-end encrypted traffic.
//!
//! An [`Envelope`] carries the nonce, the sender's public key, and the
//! ciphertext of one message. The same shape is used for direct messages
//! (encrypted under the DH-derived session key), room messages (encrypted
//! under the shared room key), and wrapped room keys handed to members.
//!
//! The relay and the database only ever see the storage-string form, a
//! single base64 string with the fixed layout
//! `nonce(24) || sender_public(32) || ciphertext`.

use base64::{engine::general_purpose::STANDARD, Engine as _};
use serde::{Deserialize, Serialize};

use crate::aead::{self, NONCE_SIZE, TAG_SIZE};
use crate::exchange::{IdentityPublicKey, IdentitySecretKey, PUBLIC_KEY_SIZE};
use crate::keys::RoomKey;
use cipherchat_common::{Error, Result};

/// Minimum decoded length of a storage string: nonce, sender key, and the
/// AEAD tag of an empty plaintext.
pub const STORAGE_MIN_LEN: usize = NONCE_SIZE + PUBLIC_KEY_SIZE + TAG_SIZE;

/// An encrypted message with its delivery metadata.
#[derive(Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "EnvelopeWire", into = "EnvelopeWire")]
pub struct Envelope {
    nonce: [u8; NONCE_SIZE],
    sender_public: IdentityPublicKey,
    ciphertext: Vec<u8>,
}

/// JSON representation: every field is a base64 string, matching the wire
/// dictionaries the clients exchange.
#[derive(Serialize, Deserialize)]
struct EnvelopeWire {
    ciphertext: String,
    nonce: String,
    sender_public_key: String,
}

impl TryFrom<EnvelopeWire> for Envelope {
    type Error = Error;

    fn try_from(wire: EnvelopeWire) -> Result<Self> {
        let nonce_bytes = STANDARD
            .decode(&wire.nonce)
            .map_err(|e| Error::Serialization(format!("Invalid nonce encoding: {}", e)))?;
        if nonce_bytes.len() != NONCE_SIZE {
            return Err(Error::Serialization(format!(
                "Invalid nonce length: expected {}, got {}",
                NONCE_SIZE,
                nonce_bytes.len()
            )));
        }
        let mut nonce = [0u8; NONCE_SIZE];
        nonce.copy_from_slice(&nonce_bytes);

        let sender_public = IdentityPublicKey::from_base64(&wire.sender_public_key)?;

        let ciphertext = STANDARD
            .decode(&wire.ciphertext)
            .map_err(|e| Error::Serialization(format!("Invalid ciphertext encoding: {}", e)))?;

        Ok(Self {
            nonce,
            sender_public,
            ciphertext,
        })
    }
}

impl From<Envelope> for EnvelopeWire {
    fn from(env: Envelope) -> Self {
        Self {
            ciphertext: STANDARD.encode(&env.ciphertext),
            nonce: STANDARD.encode(env.nonce),
            sender_public_key: env.sender_public.to_base64(),
        }
    }
}

impl Envelope {
    /// Assemble an envelope from its parts.
    pub fn new(
        nonce: [u8; NONCE_SIZE],
        sender_public: IdentityPublicKey,
        ciphertext: Vec<u8>,
    ) -> Self {
        Self {
            nonce,
            sender_public,
            ciphertext,
        }
    }

    /// The message nonce.
    pub fn nonce(&self) -> &[u8; NONCE_SIZE] {
        &self.nonce
    }

    /// The sender's public key.
    pub fn sender_public(&self) -> &IdentityPublicKey {
        &self.sender_public
    }

    /// The ciphertext including the authentication tag.
    pub fn ciphertext(&self) -> &[u8] {
        &self.ciphertext
    }

    /// Encode as a single base64 string for database storage.
    ///
    /// Layout: `nonce(24) || sender_public(32) || ciphertext`.
    pub fn to_storage_string(&self) -> String {
        let mut combined =
            Vec::with_capacity(NONCE_SIZE + PUBLIC_KEY_SIZE + self.ciphertext.len());
        combined.extend_from_slice(&self.nonce);
        combined.extend_from_slice(self.sender_public.as_bytes());
        combined.extend_from_slice(&self.ciphertext);
        STANDARD.encode(combined)
    }

    /// Reconstruct from a storage string.
    ///
    /// # Errors
    /// - Returns error on invalid base64
    /// - Returns error if the decoded payload is shorter than
    ///   [`STORAGE_MIN_LEN`]
    pub fn from_storage_string(data: &str) -> Result<Self> {
        let combined = STANDARD
            .decode(data)
            .map_err(|e| Error::Serialization(format!("Invalid storage encoding: {}", e)))?;

        if combined.len() < STORAGE_MIN_LEN {
            return Err(Error::Serialization(format!(
                "Storage payload too short: expected at least {}, got {}",
                STORAGE_MIN_LEN,
                combined.len()
            )));
        }

        let mut nonce = [0u8; NONCE_SIZE];
        nonce.copy_from_slice(&combined[..NONCE_SIZE]);

        let sender_public =
            IdentityPublicKey::from_bytes(&combined[NONCE_SIZE..NONCE_SIZE + PUBLIC_KEY_SIZE])?;

        let ciphertext = combined[NONCE_SIZE + PUBLIC_KEY_SIZE..].to_vec();

        Ok(Self {
            nonce,
            sender_public,
            ciphertext,
        })
    }
}

impl std::fmt::Debug for Envelope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Envelope {{ sender: {:?}, ciphertext: {} bytes }}",
            self.sender_public,
            self.ciphertext.len()
        )
    }
}

/// Encrypt a direct message to a recipient.
///
/// Derives the session key via X25519 + HKDF and seals the plaintext with
/// a fresh random nonce. The sender's public key is embedded so the
/// recipient can derive the same key.
pub fn seal_direct(
    plaintext: &[u8],
    sender: &IdentitySecretKey,
    recipient: &IdentityPublicKey,
) -> Result<Envelope> {
    let key = sender.diffie_hellman(recipient).derive_session_key()?;
    let (nonce, ciphertext) = aead::seal_detached(key.as_bytes(), plaintext)?;

    Ok(Envelope {
        nonce,
        sender_public: sender.public_key(),
        ciphertext,
    })
}

/// Decrypt a direct message with the recipient's secret key.
///
/// # Errors
/// - Returns error if authentication fails (wrong recipient or tampering)
pub fn open_direct(envelope: &Envelope, recipient: &IdentitySecretKey) -> Result<Vec<u8>> {
    let key = recipient
        .diffie_hellman(&envelope.sender_public)
        .derive_session_key()?;
    aead::open_detached(key.as_bytes(), &envelope.nonce, &envelope.ciphertext)
}

/// Encrypt a message for a room using the shared room key.
///
/// The sender's public key is carried for attribution only; it plays no
/// part in the encryption.
pub fn seal_room(
    plaintext: &[u8],
    room_key: &RoomKey,
    sender_public: &IdentityPublicKey,
) -> Result<Envelope> {
    let (nonce, ciphertext) = aead::seal_detached(room_key.as_bytes(), plaintext)?;

    Ok(Envelope {
        nonce,
        sender_public: sender_public.clone(),
        ciphertext,
    })
}

/// Decrypt a room message with the shared room key.
pub fn open_room(envelope: &Envelope, room_key: &RoomKey) -> Result<Vec<u8>> {
    aead::open_detached(
        room_key.as_bytes(),
        &envelope.nonce,
        &envelope.ciphertext,
    )
}

/// Wrap a room key for a specific member.
///
/// Used when adding users to a room: the room key is base64-encoded and
/// sealed as a direct message from the admin to the member.
pub fn wrap_room_key(
    room_key: &RoomKey,
    recipient: &IdentityPublicKey,
    admin: &IdentitySecretKey,
) -> Result<Envelope> {
    seal_direct(room_key.to_base64().as_bytes(), admin, recipient)
}

/// Unwrap a room key with the member's secret key.
pub fn unwrap_room_key(envelope: &Envelope, member: &IdentitySecretKey) -> Result<RoomKey> {
    let encoded = open_direct(envelope, member)?;
    let encoded = String::from_utf8(encoded)
        .map_err(|_| Error::Crypto("Wrapped room key is not valid UTF-8".to_string()))?;
    RoomKey::from_base64(&encoded)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exchange::Keypair;

    #[test]
    fn test_direct_message_roundtrip() {
        let alice = Keypair::generate();
        let bob = Keypair::generate();

        let envelope = seal_direct(b"hello bob", &alice.secret, &bob.public).unwrap();
        let plaintext = open_direct(&envelope, &bob.secret).unwrap();

        assert_eq!(plaintext, b"hello bob");
        assert_eq!(envelope.sender_public(), &alice.public);
    }

    #[test]
    fn test_direct_message_wrong_recipient_fails() {
        let alice = Keypair::generate();
        let bob = Keypair::generate();
        let eve = Keypair::generate();

        let envelope = seal_direct(b"for bob only", &alice.secret, &bob.public).unwrap();
        assert!(open_direct(&envelope, &eve.secret).is_err());
    }

    #[test]
    fn test_room_message_roundtrip() {
        let sender = Keypair::generate();
        let room_key = RoomKey::generate();

        let envelope = seal_room(b"hello room", &room_key, &sender.public).unwrap();
        let plaintext = open_room(&envelope, &room_key).unwrap();

        assert_eq!(plaintext, b"hello room");
    }

    #[test]
    fn test_room_message_wrong_key_fails() {
        let sender = Keypair::generate();
        let room_key = RoomKey::generate();
        let other_key = RoomKey::generate();

        let envelope = seal_room(b"secret", &room_key, &sender.public).unwrap();
        assert!(open_room(&envelope, &other_key).is_err());
    }

    #[test]
    fn test_storage_string_roundtrip() {
        let alice = Keypair::generate();
        let bob = Keypair::generate();

        let envelope = seal_direct(b"persisted", &alice.secret, &bob.public).unwrap();
        let stored = envelope.to_storage_string();
        let restored = Envelope::from_storage_string(&stored).unwrap();

        assert_eq!(envelope, restored);
        assert_eq!(open_direct(&restored, &bob.secret).unwrap(), b"persisted");
    }

    #[test]
    fn test_storage_string_layout() {
        let alice = Keypair::generate();
        let bob = Keypair::generate();

        let envelope = seal_direct(b"x", &alice.secret, &bob.public).unwrap();
        let decoded = STANDARD.decode(envelope.to_storage_string()).unwrap();

        assert_eq!(&decoded[..NONCE_SIZE], envelope.nonce());
        assert_eq!(
            &decoded[NONCE_SIZE..NONCE_SIZE + PUBLIC_KEY_SIZE],
            alice.public.as_bytes()
        );
        assert_eq!(
            &decoded[NONCE_SIZE + PUBLIC_KEY_SIZE..],
            envelope.ciphertext()
        );
    }

    #[test]
    fn test_storage_string_rejects_truncated() {
        assert!(Envelope::from_storage_string("").is_err());
        assert!(Envelope::from_storage_string("AAAA").is_err());
        assert!(Envelope::from_storage_string("not base64 at all!").is_err());
    }

    #[test]
    fn test_json_wire_format() {
        let alice = Keypair::generate();
        let bob = Keypair::generate();

        let envelope = seal_direct(b"json", &alice.secret, &bob.public).unwrap();
        let json = serde_json::to_string(&envelope).unwrap();

        assert!(json.contains("\"ciphertext\""));
        assert!(json.contains("\"nonce\""));
        assert!(json.contains("\"sender_public_key\""));

        let restored: Envelope = serde_json::from_str(&json).unwrap();
        assert_eq!(envelope, restored);
    }

    #[test]
    fn test_room_key_wrap_roundtrip() {
        let admin = Keypair::generate();
        let member = Keypair::generate();
        let room_key = RoomKey::generate();

        let wrapped = wrap_room_key(&room_key, &member.public, &admin.secret).unwrap();
        let unwrapped = unwrap_room_key(&wrapped, &member.secret).unwrap();

        assert_eq!(room_key.as_bytes(), unwrapped.as_bytes());
    }

    #[test]
    fn test_room_key_wrap_wrong_member_fails() {
        let admin = Keypair::generate();
        let member = Keypair::generate();
        let outsider = Keypair::generate();
        let room_key = RoomKey::generate();

        let wrapped = wrap_room_key(&room_key, &member.public, &admin.secret).unwrap();
        assert!(unwrap_room_key(&wrapped, &outsider.secret).is_err());
    }
}
