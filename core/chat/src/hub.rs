//! In-process relay hub.
//!
//! Each room gets a broadcast channel; connecting joins the channel,
//! announces the member, and marks them online. Inbound frames dispatch
//! to the services and the results fan out to every connection in the
//! room. Delivery rules mirror the chat surface: a member's own typing
//! indicator is not echoed back, and key-exchange frames reach only
//! their addressee.

use chrono::Utc;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{broadcast, RwLock};
use tracing::{debug, warn};

use cipherchat_accounts::AuthenticatedUser;
use cipherchat_common::{Error, Result, RoomId, UserId};
use cipherchat_store::{ChatStore, PresenceStatus, UserRecord};

use crate::messages::{MessageService, OutgoingMessage};
use crate::presence::PresenceService;
use crate::protocol::{parse_client_frame, ClientFrame, ServerFrame, CLOSE_NOT_A_MEMBER};

const CHANNEL_CAPACITY: usize = 256;

/// Relay hub managing per-room broadcast channels.
pub struct ChatHub {
    store: Arc<dyn ChatStore>,
    messages: MessageService,
    presence: PresenceService,
    channels: RwLock<HashMap<RoomId, broadcast::Sender<ServerFrame>>>,
}

impl ChatHub {
    /// Create a hub over the shared services.
    pub fn new(
        store: Arc<dyn ChatStore>,
        messages: MessageService,
        presence: PresenceService,
    ) -> Self {
        Self {
            store,
            messages,
            presence,
            channels: RwLock::new(HashMap::new()),
        }
    }

    async fn channel(&self, room_id: RoomId) -> broadcast::Sender<ServerFrame> {
        let mut channels = self.channels.write().await;
        channels
            .entry(room_id)
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0)
            .clone()
    }

    /// Connect an authenticated user to a room.
    ///
    /// # Postconditions
    /// - The member is subscribed to the room channel
    /// - Presence is set online with the room as current
    /// - A `user_join` frame is broadcast
    ///
    /// # Errors
    /// - `NotPermitted` if the user is not a member (close code 4003)
    pub async fn connect(
        &self,
        user: &AuthenticatedUser,
        room_id: RoomId,
    ) -> Result<RoomConnection> {
        if self.store.membership(user.id(), room_id).await.is_err() {
            return Err(Error::NotPermitted(format!(
                "Not a member of room {} (close code {})",
                room_id, CLOSE_NOT_A_MEMBER
            )));
        }

        let tx = self.channel(room_id).await;

        self.presence
            .set_status(user.id(), PresenceStatus::Online, Some(room_id))
            .await?;

        // Announce before subscribing: a connection only sees frames that
        // arrive after it joined, not its own announcement.
        let _ = tx.send(ServerFrame::UserJoin {
            user_id: user.id(),
            username: user.username().to_string(),
            timestamp: Utc::now(),
        });
        let rx = tx.subscribe();

        debug!(room = %room_id, user = %user.username(), "Connected to room");

        Ok(RoomConnection {
            user_id: user.id(),
            username: user.username().to_string(),
            room_id,
            messages: self.messages.clone(),
            presence: self.presence.clone(),
            tx,
            rx,
        })
    }
}

/// One member's live connection to a room.
pub struct RoomConnection {
    user_id: UserId,
    username: String,
    room_id: RoomId,
    messages: MessageService,
    presence: PresenceService,
    tx: broadcast::Sender<ServerFrame>,
    rx: broadcast::Receiver<ServerFrame>,
}

impl RoomConnection {
    /// The connected user.
    pub fn user_id(&self) -> UserId {
        self.user_id
    }

    /// The connected room.
    pub fn room_id(&self) -> RoomId {
        self.room_id
    }

    /// Handle an inbound frame from this member.
    ///
    /// Messages and read receipts go through the services before
    /// broadcasting; typing and key-exchange frames are relayed as-is.
    pub async fn send(&self, frame: ClientFrame) -> Result<()> {
        match frame {
            ClientFrame::Message {
                encrypted_content,
                sender_public_key,
                content_hash,
                message_type,
            } => {
                let (_, broadcast_frame) = self
                    .messages
                    .post(
                        self.user_id,
                        &self.username,
                        self.room_id,
                        OutgoingMessage {
                            encrypted_content,
                            sender_public_key,
                            content_hash,
                            message_type,
                        },
                    )
                    .await?;
                let _ = self.tx.send(broadcast_frame);
            }
            ClientFrame::Typing { is_typing } => {
                let _ = self.tx.send(ServerFrame::Typing {
                    user_id: self.user_id,
                    username: self.username.clone(),
                    is_typing,
                });
            }
            ClientFrame::ReadReceipt { message_id } => {
                let frame = self.messages.mark_read(self.user_id, message_id).await?;
                let _ = self.tx.send(frame);
            }
            ClientFrame::KeyExchange {
                recipient_id,
                public_key,
            } => {
                let _ = self.tx.send(ServerFrame::KeyExchange {
                    sender_id: self.user_id,
                    recipient_id,
                    public_key,
                });
            }
        }
        Ok(())
    }

    /// Handle a raw text frame.
    ///
    /// Returns an error frame to deliver back to this client on failure,
    /// None on success. Parse errors and service refusals never reach the
    /// room.
    pub async fn handle_raw(&self, text: &str) -> Option<ServerFrame> {
        let frame = match parse_client_frame(text) {
            Ok(frame) => frame,
            Err(_) => return Some(ServerFrame::error("Invalid JSON format")),
        };

        match self.send(frame).await {
            Ok(()) => None,
            Err(e) => Some(ServerFrame::error(e.to_string())),
        }
    }

    /// Receive the next frame addressed to this member.
    ///
    /// Applies delivery rules: own typing frames are skipped and
    /// key-exchange frames are delivered only to their recipient. Lagged
    /// slots are skipped with a warning.
    pub async fn recv(&mut self) -> Result<ServerFrame> {
        loop {
            match self.rx.recv().await {
                Ok(frame) => {
                    if self.should_deliver(&frame) {
                        return Ok(frame);
                    }
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(room = %self.room_id, skipped, "Connection lagged; frames dropped");
                }
                Err(broadcast::error::RecvError::Closed) => {
                    return Err(Error::Protocol("Room channel closed".to_string()));
                }
            }
        }
    }

    fn should_deliver(&self, frame: &ServerFrame) -> bool {
        match frame {
            ServerFrame::Typing { user_id, .. } => *user_id != self.user_id,
            ServerFrame::KeyExchange { recipient_id, .. } => *recipient_id == self.user_id,
            _ => true,
        }
    }

    /// Leave the room: announce the departure and go offline.
    pub async fn disconnect(self) -> Result<()> {
        let _ = self.tx.send(ServerFrame::UserLeave {
            user_id: self.user_id,
            username: self.username.clone(),
            timestamp: Utc::now(),
        });

        self.presence
            .set_status(self.user_id, PresenceStatus::Offline, None)
            .await?;

        debug!(room = %self.room_id, user = %self.username, "Disconnected from room");
        Ok(())
    }
}

/// Global presence hub.
///
/// Connections broadcast their status to everyone subscribed, independent
/// of rooms.
pub struct PresenceHub {
    presence: PresenceService,
    tx: broadcast::Sender<ServerFrame>,
}

impl PresenceHub {
    /// Create a presence hub.
    pub fn new(presence: PresenceService) -> Self {
        let (tx, _) = broadcast::channel(CHANNEL_CAPACITY);
        Self { presence, tx }
    }

    /// Connect a user: marks them online and broadcasts the change.
    pub async fn connect(&self, user: &UserRecord) -> Result<PresenceConnection> {
        self.presence
            .set_status(user.id, PresenceStatus::Online, None)
            .await?;

        let _ = self.tx.send(ServerFrame::Presence {
            user_id: user.id,
            username: user.username.clone(),
            status: PresenceStatus::Online,
        });
        let rx = self.tx.subscribe();

        Ok(PresenceConnection {
            user_id: user.id,
            username: user.username.clone(),
            presence: self.presence.clone(),
            tx: self.tx.clone(),
            rx,
        })
    }
}

/// One user's live presence subscription.
pub struct PresenceConnection {
    user_id: UserId,
    username: String,
    presence: PresenceService,
    tx: broadcast::Sender<ServerFrame>,
    rx: broadcast::Receiver<ServerFrame>,
}

impl PresenceConnection {
    /// Update this user's status.
    ///
    /// # Errors
    /// - `InvalidInput` for offline; only disconnect sets that
    pub async fn update(&self, status: PresenceStatus) -> Result<()> {
        PresenceService::ensure_client_status(status)?;

        self.presence.set_status(self.user_id, status, None).await?;
        let _ = self.tx.send(ServerFrame::Presence {
            user_id: self.user_id,
            username: self.username.clone(),
            status,
        });
        Ok(())
    }

    /// Receive the next presence frame.
    pub async fn recv(&mut self) -> Result<ServerFrame> {
        loop {
            match self.rx.recv().await {
                Ok(frame) => return Ok(frame),
                Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => {
                    return Err(Error::Protocol("Presence channel closed".to_string()));
                }
            }
        }
    }

    /// Disconnect: marks the user offline and broadcasts the change.
    pub async fn disconnect(self) -> Result<()> {
        self.presence
            .set_status(self.user_id, PresenceStatus::Offline, None)
            .await?;
        let _ = self.tx.send(ServerFrame::Presence {
            user_id: self.user_id,
            username: self.username,
            status: PresenceStatus::Offline,
        });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cipherchat_accounts::AccountService;
    use cipherchat_crypto::{envelope, verification_hash, KdfParams};
    use cipherchat_keyring::KeyManager;
    use cipherchat_store::{MemoryStore, RoomRole, RoomType};

    use crate::rooms::{CreateRoomOpts, RoomService};

    struct Fixture {
        store: Arc<dyn ChatStore>,
        accounts: AccountService,
        rooms: RoomService,
        hub: ChatHub,
    }

    fn fixture() -> Fixture {
        let store: Arc<dyn ChatStore> = Arc::new(MemoryStore::new());
        let keyring =
            Arc::new(KeyManager::new(b"server-master", &KdfParams::moderate()).unwrap());
        let messages = MessageService::new(store.clone());
        let presence = PresenceService::new(store.clone());
        Fixture {
            store: store.clone(),
            accounts: AccountService::new(store.clone(), KdfParams::moderate()),
            rooms: RoomService::new(store.clone(), keyring),
            hub: ChatHub::new(store, messages, presence),
        }
    }

    async fn login(f: &Fixture, name: &str) -> AuthenticatedUser {
        f.accounts.register(name, "password-1").await.unwrap();
        f.accounts.login(name, "password-1").await.unwrap()
    }

    async fn setup_room(f: &Fixture, alice: &AuthenticatedUser, bob: &AuthenticatedUser) -> RoomId {
        let room = f
            .rooms
            .create_room(alice, "general", RoomType::Private, CreateRoomOpts::default())
            .await
            .unwrap();
        f.rooms
            .add_member(alice, room.id, bob.id(), RoomRole::Member)
            .await
            .unwrap();
        room.id
    }

    #[tokio::test]
    async fn test_connect_requires_membership() {
        let f = fixture();
        let alice = login(&f, "alice").await;
        let mallory = login(&f, "mallory").await;
        let room = f
            .rooms
            .create_room(&alice, "general", RoomType::Private, CreateRoomOpts::default())
            .await
            .unwrap();

        assert!(f.hub.connect(&mallory, room.id).await.is_err());
        assert!(f.hub.connect(&alice, room.id).await.is_ok());
    }

    #[tokio::test]
    async fn test_join_announcement_and_presence() {
        let f = fixture();
        let alice = login(&f, "alice").await;
        let bob = login(&f, "bob").await;
        let room_id = setup_room(&f, &alice, &bob).await;

        let mut alice_conn = f.hub.connect(&alice, room_id).await.unwrap();
        let _bob_conn = f.hub.connect(&bob, room_id).await.unwrap();

        // Alice sees Bob's join
        let frame = alice_conn.recv().await.unwrap();
        match frame {
            ServerFrame::UserJoin { user_id, username, .. } => {
                assert_eq!(user_id, bob.id());
                assert_eq!(username, "bob");
            }
            other => panic!("unexpected frame: {:?}", other),
        }

        let presence = f.store.presence(bob.id()).await.unwrap().unwrap();
        assert_eq!(presence.status, PresenceStatus::Online);
        assert_eq!(presence.current_room, Some(room_id));
    }

    #[tokio::test]
    async fn test_encrypted_message_relay() {
        let f = fixture();
        let alice = login(&f, "alice").await;
        let bob = login(&f, "bob").await;
        let room_id = setup_room(&f, &alice, &bob).await;

        let alice_conn = f.hub.connect(&alice, room_id).await.unwrap();
        let mut bob_conn = f.hub.connect(&bob, room_id).await.unwrap();

        let key = f.rooms.room_key(&alice, room_id).await.unwrap();
        let env = envelope::seal_room(b"over the wire", &key, alice.public_key()).unwrap();
        alice_conn
            .send(ClientFrame::Message {
                encrypted_content: env.to_storage_string(),
                sender_public_key: alice.public_key().to_base64(),
                content_hash: verification_hash(b"over the wire"),
                message_type: "text".to_string(),
            })
            .await
            .unwrap();

        let frame = bob_conn.recv().await.unwrap();
        match frame {
            ServerFrame::Message {
                encrypted_content,
                sender_id,
                sender_username,
                ..
            } => {
                assert_eq!(sender_id, alice.id());
                assert_eq!(sender_username, "alice");

                // Bob decrypts with his own copy of the room key
                let bob_key = f.rooms.room_key(&bob, room_id).await.unwrap();
                let env =
                    cipherchat_crypto::Envelope::from_storage_string(&encrypted_content).unwrap();
                assert_eq!(envelope::open_room(&env, &bob_key).unwrap(), b"over the wire");
            }
            other => panic!("unexpected frame: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_typing_not_echoed_to_sender() {
        let f = fixture();
        let alice = login(&f, "alice").await;
        let bob = login(&f, "bob").await;
        let room_id = setup_room(&f, &alice, &bob).await;

        let mut alice_conn = f.hub.connect(&alice, room_id).await.unwrap();
        let mut bob_conn = f.hub.connect(&bob, room_id).await.unwrap();
        // Drain Bob's join as seen by Alice
        let _ = alice_conn.recv().await.unwrap();

        alice_conn
            .send(ClientFrame::Typing { is_typing: true })
            .await
            .unwrap();
        // Bob receives the indicator
        let frame = bob_conn.recv().await.unwrap();
        assert!(matches!(frame, ServerFrame::Typing { is_typing: true, .. }));

        // Alice does not see her own typing; the next thing she can see
        // must come from someone else
        bob_conn.send(ClientFrame::Typing { is_typing: false }).await.unwrap();
        let frame = alice_conn.recv().await.unwrap();
        match frame {
            ServerFrame::Typing { user_id, is_typing, .. } => {
                assert_eq!(user_id, bob.id());
                assert!(!is_typing);
            }
            other => panic!("unexpected frame: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_key_exchange_addressed_delivery() {
        let f = fixture();
        let alice = login(&f, "alice").await;
        let bob = login(&f, "bob").await;
        let carol = login(&f, "carol").await;
        let room_id = setup_room(&f, &alice, &bob).await;
        f.rooms
            .add_member(&alice, room_id, carol.id(), RoomRole::Member)
            .await
            .unwrap();

        let alice_conn = f.hub.connect(&alice, room_id).await.unwrap();
        let mut bob_conn = f.hub.connect(&bob, room_id).await.unwrap();
        let mut carol_conn = f.hub.connect(&carol, room_id).await.unwrap();
        // Drain join frames
        let _ = bob_conn.recv().await.unwrap(); // carol joins
        // carol's receiver starts after her join

        alice_conn
            .send(ClientFrame::KeyExchange {
                recipient_id: bob.id(),
                public_key: alice.public_key().to_base64(),
            })
            .await
            .unwrap();

        // Bob gets the key exchange
        let frame = bob_conn.recv().await.unwrap();
        match frame {
            ServerFrame::KeyExchange { sender_id, recipient_id, .. } => {
                assert_eq!(sender_id, alice.id());
                assert_eq!(recipient_id, bob.id());
            }
            other => panic!("unexpected frame: {:?}", other),
        }

        // Carol must not see it; prove it by sending a typing frame she
        // WILL see and checking it arrives first
        bob_conn.send(ClientFrame::Typing { is_typing: true }).await.unwrap();
        let frame = carol_conn.recv().await.unwrap();
        assert!(matches!(frame, ServerFrame::Typing { .. }));
    }

    #[tokio::test]
    async fn test_handle_raw_returns_local_errors() {
        let f = fixture();
        let alice = login(&f, "alice").await;
        let bob = login(&f, "bob").await;
        let room_id = setup_room(&f, &alice, &bob).await;

        let alice_conn = f.hub.connect(&alice, room_id).await.unwrap();

        let err = alice_conn.handle_raw("this is not json").await.unwrap();
        assert!(matches!(err, ServerFrame::Error { .. }));

        let err = alice_conn
            .handle_raw(r#"{"type": "message", "encrypted_content": ""}"#)
            .await
            .unwrap();
        match err {
            ServerFrame::Error { message } => assert!(message.contains("Missing encrypted content")),
            other => panic!("unexpected frame: {:?}", other),
        }

        // A valid frame produces no error
        let key = f.rooms.room_key(&alice, room_id).await.unwrap();
        let env = envelope::seal_room(b"ok", &key, alice.public_key()).unwrap();
        let raw = format!(
            r#"{{"type": "message", "encrypted_content": "{}"}}"#,
            env.to_storage_string()
        );
        assert!(alice_conn.handle_raw(&raw).await.is_none());
    }

    #[tokio::test]
    async fn test_disconnect_announces_and_goes_offline() {
        let f = fixture();
        let alice = login(&f, "alice").await;
        let bob = login(&f, "bob").await;
        let room_id = setup_room(&f, &alice, &bob).await;

        let mut alice_conn = f.hub.connect(&alice, room_id).await.unwrap();
        let bob_conn = f.hub.connect(&bob, room_id).await.unwrap();
        let _ = alice_conn.recv().await.unwrap(); // bob's join

        bob_conn.disconnect().await.unwrap();

        let frame = alice_conn.recv().await.unwrap();
        match frame {
            ServerFrame::UserLeave { user_id, .. } => assert_eq!(user_id, bob.id()),
            other => panic!("unexpected frame: {:?}", other),
        }

        let presence = f.store.presence(bob.id()).await.unwrap().unwrap();
        assert_eq!(presence.status, PresenceStatus::Offline);
    }

    #[tokio::test]
    async fn test_presence_hub() {
        let f = fixture();
        let alice = login(&f, "alice").await;
        let bob = login(&f, "bob").await;

        let presence_hub = PresenceHub::new(PresenceService::new(f.store.clone()));

        let mut alice_conn = presence_hub.connect(&alice.user).await.unwrap();
        let bob_conn = presence_hub.connect(&bob.user).await.unwrap();

        // Alice sees Bob come online
        let frame = alice_conn.recv().await.unwrap();
        match frame {
            ServerFrame::Presence { user_id, status, .. } => {
                assert_eq!(user_id, bob.id());
                assert_eq!(status, PresenceStatus::Online);
            }
            other => panic!("unexpected frame: {:?}", other),
        }

        // Offline cannot be set explicitly
        assert!(bob_conn.update(PresenceStatus::Offline).await.is_err());

        bob_conn.update(PresenceStatus::Busy).await.unwrap();
        let frame = alice_conn.recv().await.unwrap();
        assert!(matches!(
            frame,
            ServerFrame::Presence { status: PresenceStatus::Busy, .. }
        ));

        bob_conn.disconnect().await.unwrap();
        let frame = alice_conn.recv().await.unwrap();
        assert!(matches!(
            frame,
            ServerFrame::Presence { status: PresenceStatus::Offline, .. }
        ));

        let stored = f.store.presence(bob.id()).await.unwrap().unwrap();
        assert_eq!(stored.status, PresenceStatus::Offline);
    }
}
