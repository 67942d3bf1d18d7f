//! Room lifecycle and per-member key distribution.
//!
//! Every room has one symmetric key. The server keeps it sealed under the
//! keyring master key; each member additionally holds a copy wrapped to
//! their identity public key, created by whoever added them. Message
//! encryption happens client-side with the unwrapped key.

use chrono::{Duration, Utc};
use std::sync::Arc;
use tracing::{debug, info};

use cipherchat_accounts::AuthenticatedUser;
use cipherchat_common::{Error, Result, RoomId, UserId};
use cipherchat_crypto::{envelope, Envelope, RoomKey};
use cipherchat_keyring::KeyManager;
use cipherchat_store::{
    AuditEvent, AuditRecord, ChatStore, MembershipRecord, RoomRecord, RoomRole, RoomType,
};

/// Optional settings for room creation.
#[derive(Debug, Clone)]
pub struct CreateRoomOpts {
    pub description: String,
    pub max_members: u32,
    /// Days to keep messages; 0 keeps them forever.
    pub message_retention_days: u32,
}

impl Default for CreateRoomOpts {
    fn default() -> Self {
        Self {
            description: String::new(),
            max_members: RoomRecord::DEFAULT_MAX_MEMBERS,
            message_retention_days: RoomRecord::DEFAULT_RETENTION_DAYS,
        }
    }
}

/// Room management service.
pub struct RoomService {
    store: Arc<dyn ChatStore>,
    keyring: Arc<KeyManager>,
}

impl RoomService {
    /// Create a service over a store and keyring.
    pub fn new(store: Arc<dyn ChatStore>, keyring: Arc<KeyManager>) -> Self {
        Self { store, keyring }
    }

    /// Create a room.
    ///
    /// # Postconditions
    /// - A fresh room key is generated and sealed for the server
    /// - The creator becomes an Admin member holding the key wrapped to
    ///   their own identity
    pub async fn create_room(
        &self,
        creator: &AuthenticatedUser,
        name: &str,
        room_type: RoomType,
        opts: CreateRoomOpts,
    ) -> Result<RoomRecord> {
        if name.trim().is_empty() {
            return Err(Error::InvalidInput("Room name cannot be empty".to_string()));
        }

        let stored_key = self.keyring.generate_room_key()?;
        let room_key = self.keyring.open_room_key(&stored_key.sealed_key)?;

        let mut room = RoomRecord::new(
            name,
            room_type,
            stored_key.sealed_key,
            stored_key.key_id,
            stored_key.key_version,
            creator.id(),
        );
        room.description = opts.description;
        room.max_members = opts.max_members;
        room.message_retention_days = opts.message_retention_days;

        self.store.create_room(room.clone()).await?;

        let wrapped =
            envelope::wrap_room_key(&room_key, creator.public_key(), creator.secret())?;
        let membership = MembershipRecord::new(
            creator.id(),
            room.id,
            wrapped.to_storage_string(),
            RoomRole::Admin,
        );
        self.store.add_membership(membership).await?;

        info!(room = %room.id, name = %room.name, "Room created");
        Ok(room)
    }

    /// Add a member to a room.
    ///
    /// The actor unwraps their own copy of the room key and re-wraps it
    /// for the new member.
    ///
    /// # Errors
    /// - `NotPermitted` if the actor's role cannot add members
    /// - `NotPermitted` if the room is full
    /// - `AlreadyExists` if the user is already a member
    pub async fn add_member(
        &self,
        actor: &AuthenticatedUser,
        room_id: RoomId,
        user_id: UserId,
        role: RoomRole,
    ) -> Result<MembershipRecord> {
        let actor_membership = self.membership_of(actor.id(), room_id).await?;
        if !actor_membership.role.can_add_members() {
            return Err(Error::NotPermitted(
                "Only admins and moderators can add members".to_string(),
            ));
        }

        let room = self.store.room(room_id).await?;
        let members = self.store.room_members(room_id).await?;
        if members.len() as u32 >= room.max_members {
            return Err(Error::NotPermitted(format!(
                "Room is full ({} members)",
                room.max_members
            )));
        }

        let user = self.store.user(user_id).await?;
        let user_public = cipherchat_crypto::IdentityPublicKey::from_base64(&user.public_key)?;

        let room_key = self.unwrap_room_key(actor, &actor_membership)?;
        let wrapped = envelope::wrap_room_key(&room_key, &user_public, actor.secret())?;

        let membership =
            MembershipRecord::new(user_id, room_id, wrapped.to_storage_string(), role);
        self.store.add_membership(membership.clone()).await?;

        info!(room = %room_id, user = %user_id, role = role.as_str(), "Member added");
        Ok(membership)
    }

    /// Remove a member from a room.
    ///
    /// Members may always remove themselves (leave). Otherwise the
    /// actor's role decides what it can remove. Removal does not protect
    /// prior history; rotate the room key for that.
    pub async fn remove_member(
        &self,
        actor: &AuthenticatedUser,
        room_id: RoomId,
        user_id: UserId,
    ) -> Result<()> {
        if actor.id() != user_id {
            let actor_membership = self.membership_of(actor.id(), room_id).await?;
            let target_membership = self.membership_of(user_id, room_id).await?;
            if !actor_membership.role.can_remove(target_membership.role) {
                return Err(Error::NotPermitted(format!(
                    "Role {} cannot remove a {}",
                    actor_membership.role.as_str(),
                    target_membership.role.as_str()
                )));
            }
        }

        self.store.remove_membership(user_id, room_id).await?;
        info!(room = %room_id, user = %user_id, "Member removed");
        Ok(())
    }

    /// Unwrap the caller's copy of the room key.
    pub async fn room_key(
        &self,
        member: &AuthenticatedUser,
        room_id: RoomId,
    ) -> Result<RoomKey> {
        let membership = self.membership_of(member.id(), room_id).await?;
        self.unwrap_room_key(member, &membership)
    }

    /// Rotate a room's key.
    ///
    /// # Preconditions
    /// - The actor must be an Admin of the room
    ///
    /// # Postconditions
    /// - The room carries a fresh sealed key and key id, version bumped
    /// - The previous sealed key is retained
    /// - Every member's wrapped copy is replaced, wrapped by the actor
    pub async fn rotate_room_key(
        &self,
        actor: &AuthenticatedUser,
        room_id: RoomId,
    ) -> Result<RoomRecord> {
        let actor_membership = self.membership_of(actor.id(), room_id).await?;
        if actor_membership.role != RoomRole::Admin {
            return Err(Error::NotPermitted(
                "Only admins can rotate the room key".to_string(),
            ));
        }

        let mut room = self.store.room(room_id).await?;
        let rotated = self.keyring.rotate_room_key(&room.sealed_room_key)?;
        let new_key = self.keyring.open_room_key(&rotated.sealed_key)?;

        room.previous_sealed_room_key = rotated.previous_sealed_key;
        room.sealed_room_key = rotated.sealed_key;
        room.key_id = rotated.key_id;
        room.key_version += 1;
        room.updated_at = Utc::now();
        self.store.update_room(&room).await?;

        for mut membership in self.store.room_members(room_id).await? {
            let user = self.store.user(membership.user_id).await?;
            let user_public =
                cipherchat_crypto::IdentityPublicKey::from_base64(&user.public_key)?;
            let wrapped = envelope::wrap_room_key(&new_key, &user_public, actor.secret())?;
            membership.wrapped_room_key = wrapped.to_storage_string();
            self.store.update_membership(&membership).await?;
            debug!(room = %room_id, user = %membership.user_id, "Rewrapped room key");
        }

        self.store
            .append_audit(AuditRecord::new(
                actor.id(),
                AuditEvent::KeyRotation,
                serde_json::json!({"room": room_id.to_string(), "key_version": room.key_version}),
            ))
            .await?;

        info!(room = %room_id, key_version = room.key_version, "Room key rotated");
        Ok(room)
    }

    /// Whether the room's key is past the rotation interval.
    ///
    /// `updated_at` advances on rotation, so it tracks the current key's
    /// age.
    pub fn rotation_due(&self, room: &RoomRecord) -> bool {
        KeyManager::should_rotate(room.updated_at)
    }

    /// Delete messages older than the room's retention window.
    ///
    /// Returns the number removed; retention 0 means keep forever.
    pub async fn prune_expired_messages(&self, room_id: RoomId) -> Result<u64> {
        let room = self.store.room(room_id).await?;
        if room.message_retention_days == 0 {
            return Ok(0);
        }

        let cutoff = Utc::now() - Duration::days(room.message_retention_days as i64);
        let pruned = self.store.prune_messages_before(room_id, cutoff).await?;
        if pruned > 0 {
            info!(room = %room_id, pruned, "Expired messages pruned");
        }
        Ok(pruned)
    }

    /// All rooms the user belongs to.
    pub async fn list_rooms(&self, user_id: UserId) -> Result<Vec<RoomRecord>> {
        let mut rooms = Vec::new();
        for room_id in self.store.rooms_for_user(user_id).await? {
            rooms.push(self.store.room(room_id).await?);
        }
        Ok(rooms)
    }

    /// The membership list of a room, visible to members only.
    pub async fn members(
        &self,
        actor: &AuthenticatedUser,
        room_id: RoomId,
    ) -> Result<Vec<MembershipRecord>> {
        self.membership_of(actor.id(), room_id).await?;
        self.store.room_members(room_id).await
    }

    async fn membership_of(&self, user_id: UserId, room_id: RoomId) -> Result<MembershipRecord> {
        self.store.membership(user_id, room_id).await.map_err(|e| match e {
            Error::NotFound(_) => {
                Error::NotPermitted(format!("User {} is not a member of room {}", user_id, room_id))
            }
            other => other,
        })
    }

    fn unwrap_room_key(
        &self,
        member: &AuthenticatedUser,
        membership: &MembershipRecord,
    ) -> Result<RoomKey> {
        let wrapped = Envelope::from_storage_string(&membership.wrapped_room_key)?;
        envelope::unwrap_room_key(&wrapped, member.secret())
    }
}
