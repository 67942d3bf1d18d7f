//! Message relay and history.
//!
//! The message service stores and forwards opaque ciphertext. It checks
//! membership and envelope shape, never content; decryption keys stay
//! with the clients.

use chrono::Utc;
use std::sync::Arc;
use tracing::{debug, info};

use cipherchat_common::{Error, MessageId, Result, RoomId, UserId};
use cipherchat_crypto::Envelope;
use cipherchat_store::{ChatStore, MessageRecord, RoomRole};

use crate::protocol::ServerFrame;
use cipherchat_store::store::HISTORY_LIMIT;

/// A client-encrypted message ready to post.
#[derive(Debug, Clone)]
pub struct OutgoingMessage {
    /// Envelope storage string.
    pub encrypted_content: String,
    /// Sender public key in base64, for recipient-side verification.
    pub sender_public_key: String,
    /// SHA3-256 of the plaintext, computed client-side.
    pub content_hash: String,
    /// Unencrypted type tag: text, image, file.
    pub message_type: String,
}

/// Message relay service.
#[derive(Clone)]
pub struct MessageService {
    store: Arc<dyn ChatStore>,
}

impl MessageService {
    /// Create a service over a store.
    pub fn new(store: Arc<dyn ChatStore>) -> Self {
        Self { store }
    }

    /// Post an encrypted message to a room.
    ///
    /// # Preconditions
    /// - The sender must be an unmuted member of the room
    /// - The content must be a well-formed envelope storage string
    ///
    /// # Postconditions
    /// - The message is persisted and the broadcast frame returned
    pub async fn post(
        &self,
        sender_id: UserId,
        sender_username: &str,
        room_id: RoomId,
        outgoing: OutgoingMessage,
    ) -> Result<(MessageRecord, ServerFrame)> {
        let membership = self.store.membership(sender_id, room_id).await.map_err(not_a_member)?;
        if membership.is_muted {
            return Err(Error::NotPermitted("You are muted in this room".to_string()));
        }

        if outgoing.encrypted_content.is_empty() {
            return Err(Error::InvalidInput("Missing encrypted content".to_string()));
        }
        // Shape check only; the relay cannot and does not decrypt
        Envelope::from_storage_string(&outgoing.encrypted_content)?;

        let record = MessageRecord::new(
            room_id,
            sender_id,
            outgoing.encrypted_content,
            outgoing.sender_public_key,
            outgoing.content_hash,
            outgoing.message_type,
        );
        self.store.append_message(record.clone()).await?;

        debug!(room = %room_id, message = %record.id, "Message stored");

        let frame = ServerFrame::Message {
            message_id: record.id,
            encrypted_content: record.encrypted_content.clone(),
            sender_public_key: record.sender_public_key.clone(),
            content_hash: record.content_hash.clone(),
            message_type: record.message_type.clone(),
            sender_id,
            sender_username: sender_username.to_string(),
            timestamp: record.timestamp,
        };

        Ok((record, frame))
    }

    /// Recent room history, oldest first, soft-deleted messages excluded.
    ///
    /// `limit` is clamped to 100.
    pub async fn history(
        &self,
        user_id: UserId,
        room_id: RoomId,
        limit: usize,
    ) -> Result<Vec<MessageRecord>> {
        self.store.membership(user_id, room_id).await.map_err(not_a_member)?;
        self.store.recent_messages(room_id, limit.min(HISTORY_LIMIT)).await
    }

    /// Edit a message's ciphertext. Sender only.
    pub async fn edit(
        &self,
        user_id: UserId,
        message_id: MessageId,
        new_content: String,
        new_hash: String,
    ) -> Result<MessageRecord> {
        let mut message = self.store.message(message_id).await?;

        if message.sender_id != Some(user_id) {
            return Err(Error::NotPermitted(
                "Only the sender can edit a message".to_string(),
            ));
        }
        if message.is_deleted {
            return Err(Error::NotPermitted("Cannot edit a deleted message".to_string()));
        }
        Envelope::from_storage_string(&new_content)?;

        message.encrypted_content = new_content;
        message.content_hash = new_hash;
        message.is_edited = true;
        message.edited_at = Some(Utc::now());
        self.store.update_message(&message).await?;

        info!(message = %message_id, "Message edited");
        Ok(message)
    }

    /// Soft-delete a message.
    ///
    /// Allowed for the sender, and for members whose role can moderate
    /// (admins and moderators). The ciphertext is cleared; the row
    /// remains.
    pub async fn delete(&self, user_id: UserId, message_id: MessageId) -> Result<()> {
        let mut message = self.store.message(message_id).await?;

        if message.sender_id != Some(user_id) {
            let membership = self
                .store
                .membership(user_id, message.room_id)
                .await
                .map_err(not_a_member)?;
            if !membership.role.can_remove(RoomRole::Member) {
                return Err(Error::NotPermitted(
                    "Only the sender or a moderator can delete a message".to_string(),
                ));
            }
        }

        message.soft_delete();
        self.store.update_message(&message).await?;

        info!(message = %message_id, "Message deleted");
        Ok(())
    }

    /// Record that a user read a message.
    ///
    /// Idempotent per (message, user); also advances the reader's
    /// membership watermark. Returns the broadcast frame.
    pub async fn mark_read(&self, user_id: UserId, message_id: MessageId) -> Result<ServerFrame> {
        let message = self.store.message(message_id).await?;
        let mut membership = self
            .store
            .membership(user_id, message.room_id)
            .await
            .map_err(not_a_member)?;

        let receipt = cipherchat_store::ReadReceiptRecord::new(message_id, user_id);
        let read_at = receipt.read_at;
        self.store.record_receipt(receipt).await?;

        membership.last_read_at = read_at;
        self.store.update_membership(&membership).await?;

        Ok(ServerFrame::ReadReceipt {
            message_id,
            user_id,
            read_at,
        })
    }
}

fn not_a_member(e: Error) -> Error {
    match e {
        Error::NotFound(msg) => Error::NotPermitted(msg),
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cipherchat_accounts::{AccountService, AuthenticatedUser};
    use cipherchat_crypto::{envelope, verification_hash, KdfParams};
    use cipherchat_keyring::KeyManager;
    use cipherchat_store::{MemoryStore, RoomType};

    use crate::rooms::{CreateRoomOpts, RoomService};

    struct Fixture {
        store: Arc<dyn ChatStore>,
        accounts: AccountService,
        rooms: RoomService,
        messages: MessageService,
    }

    fn fixture() -> Fixture {
        let store: Arc<dyn ChatStore> = Arc::new(MemoryStore::new());
        let keyring =
            Arc::new(KeyManager::new(b"server-master", &KdfParams::moderate()).unwrap());
        Fixture {
            store: store.clone(),
            accounts: AccountService::new(store.clone(), KdfParams::moderate()),
            rooms: RoomService::new(store.clone(), keyring),
            messages: MessageService::new(store),
        }
    }

    async fn login(f: &Fixture, name: &str) -> AuthenticatedUser {
        f.accounts.register(name, "password-1").await.unwrap();
        f.accounts.login(name, "password-1").await.unwrap()
    }

    async fn room_with(
        f: &Fixture,
        admin: &AuthenticatedUser,
        others: &[(&AuthenticatedUser, RoomRole)],
    ) -> RoomId {
        let room = f
            .rooms
            .create_room(admin, "general", RoomType::Private, CreateRoomOpts::default())
            .await
            .unwrap();
        for (user, role) in others {
            f.rooms
                .add_member(admin, room.id, user.id(), *role)
                .await
                .unwrap();
        }
        room.id
    }

    async fn sealed_message(
        f: &Fixture,
        sender: &AuthenticatedUser,
        room_id: RoomId,
        text: &str,
    ) -> OutgoingMessage {
        let key = f.rooms.room_key(sender, room_id).await.unwrap();
        let env = envelope::seal_room(text.as_bytes(), &key, sender.public_key()).unwrap();
        OutgoingMessage {
            encrypted_content: env.to_storage_string(),
            sender_public_key: sender.public_key().to_base64(),
            content_hash: verification_hash(text.as_bytes()),
            message_type: "text".to_string(),
        }
    }

    #[tokio::test]
    async fn test_post_and_history_end_to_end() {
        let f = fixture();
        let alice = login(&f, "alice").await;
        let bob = login(&f, "bob").await;
        let room_id = room_with(&f, &alice, &[(&bob, RoomRole::Member)]).await;

        let outgoing = sealed_message(&f, &alice, room_id, "hello bob").await;
        let (record, frame) = f
            .messages
            .post(alice.id(), alice.username(), room_id, outgoing)
            .await
            .unwrap();

        match frame {
            ServerFrame::Message { message_id, .. } => assert_eq!(message_id, record.id),
            other => panic!("unexpected frame: {:?}", other),
        }

        // Bob fetches history and decrypts with his copy of the room key
        let history = f.messages.history(bob.id(), room_id, 50).await.unwrap();
        assert_eq!(history.len(), 1);

        let bob_key = f.rooms.room_key(&bob, room_id).await.unwrap();
        let env = Envelope::from_storage_string(&history[0].encrypted_content).unwrap();
        let plaintext = envelope::open_room(&env, &bob_key).unwrap();
        assert_eq!(plaintext, b"hello bob");

        // Content hash verifies the decrypted plaintext
        assert_eq!(history[0].content_hash, verification_hash(&plaintext));
    }

    #[tokio::test]
    async fn test_post_requires_membership() {
        let f = fixture();
        let alice = login(&f, "alice").await;
        let mallory = login(&f, "mallory").await;
        let room_id = room_with(&f, &alice, &[]).await;

        let outgoing = sealed_message(&f, &alice, room_id, "hi").await;
        let result = f
            .messages
            .post(mallory.id(), mallory.username(), room_id, outgoing)
            .await;
        assert!(matches!(result, Err(Error::NotPermitted(_))));
    }

    #[tokio::test]
    async fn test_post_rejects_malformed_content() {
        let f = fixture();
        let alice = login(&f, "alice").await;
        let room_id = room_with(&f, &alice, &[]).await;

        let empty = OutgoingMessage {
            encrypted_content: String::new(),
            sender_public_key: String::new(),
            content_hash: String::new(),
            message_type: "text".to_string(),
        };
        assert!(matches!(
            f.messages.post(alice.id(), "alice", room_id, empty).await,
            Err(Error::InvalidInput(_))
        ));

        let garbage = OutgoingMessage {
            encrypted_content: "QUJD".to_string(), // too short to be an envelope
            sender_public_key: String::new(),
            content_hash: String::new(),
            message_type: "text".to_string(),
        };
        assert!(f.messages.post(alice.id(), "alice", room_id, garbage).await.is_err());
    }

    #[tokio::test]
    async fn test_muted_member_cannot_post() {
        let f = fixture();
        let alice = login(&f, "alice").await;
        let bob = login(&f, "bob").await;
        let room_id = room_with(&f, &alice, &[(&bob, RoomRole::Member)]).await;

        let mut membership = f.store.membership(bob.id(), room_id).await.unwrap();
        membership.is_muted = true;
        f.store.update_membership(&membership).await.unwrap();

        let outgoing = sealed_message(&f, &bob, room_id, "let me speak").await;
        assert!(matches!(
            f.messages.post(bob.id(), "bob", room_id, outgoing).await,
            Err(Error::NotPermitted(_))
        ));
    }

    #[tokio::test]
    async fn test_edit_sender_only() {
        let f = fixture();
        let alice = login(&f, "alice").await;
        let bob = login(&f, "bob").await;
        let room_id = room_with(&f, &alice, &[(&bob, RoomRole::Member)]).await;

        let outgoing = sealed_message(&f, &alice, room_id, "first draft").await;
        let (record, _) = f
            .messages
            .post(alice.id(), "alice", room_id, outgoing)
            .await
            .unwrap();

        let revised = sealed_message(&f, &alice, room_id, "final version").await;

        // Bob cannot edit Alice's message
        assert!(f
            .messages
            .edit(
                bob.id(),
                record.id,
                revised.encrypted_content.clone(),
                revised.content_hash.clone()
            )
            .await
            .is_err());

        let edited = f
            .messages
            .edit(alice.id(), record.id, revised.encrypted_content, revised.content_hash)
            .await
            .unwrap();
        assert!(edited.is_edited);
        assert!(edited.edited_at.is_some());
    }

    #[tokio::test]
    async fn test_delete_rules_and_soft_delete() {
        let f = fixture();
        let alice = login(&f, "alice").await;
        let bob = login(&f, "bob").await;
        let carol = login(&f, "carol").await;
        let room_id = room_with(
            &f,
            &alice,
            &[(&bob, RoomRole::Member), (&carol, RoomRole::Member)],
        )
        .await;

        let outgoing = sealed_message(&f, &bob, room_id, "regrettable").await;
        let (record, _) = f.messages.post(bob.id(), "bob", room_id, outgoing).await.unwrap();

        // Another plain member cannot delete it
        assert!(f.messages.delete(carol.id(), record.id).await.is_err());

        // The room admin can
        f.messages.delete(alice.id(), record.id).await.unwrap();

        let stored = f.store.message(record.id).await.unwrap();
        assert!(stored.is_deleted);
        assert!(stored.encrypted_content.is_empty());

        // And it no longer appears in history
        let history = f.messages.history(bob.id(), room_id, 50).await.unwrap();
        assert!(history.is_empty());
    }

    #[tokio::test]
    async fn test_mark_read_idempotent() {
        let f = fixture();
        let alice = login(&f, "alice").await;
        let bob = login(&f, "bob").await;
        let room_id = room_with(&f, &alice, &[(&bob, RoomRole::Member)]).await;

        let outgoing = sealed_message(&f, &alice, room_id, "read me").await;
        let (record, _) = f
            .messages
            .post(alice.id(), "alice", room_id, outgoing)
            .await
            .unwrap();

        let frame = f.messages.mark_read(bob.id(), record.id).await.unwrap();
        match frame {
            ServerFrame::ReadReceipt { message_id, user_id, .. } => {
                assert_eq!(message_id, record.id);
                assert_eq!(user_id, bob.id());
            }
            other => panic!("unexpected frame: {:?}", other),
        }

        // Second read does not create another receipt
        f.messages.mark_read(bob.id(), record.id).await.unwrap();
        assert_eq!(
            f.store.receipts_for_message(record.id).await.unwrap().len(),
            1
        );
    }
}
