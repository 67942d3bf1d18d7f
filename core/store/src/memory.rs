//! In-memory store for testing.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use cipherchat_common::{Error, MessageId, Result, RoomId, UserId};

use crate::records::{
    AuditRecord, MembershipRecord, MessageRecord, PresenceRecord, ReadReceiptRecord, RoomRecord,
    SessionRecord, UserRecord,
};
use crate::store::{ChatStore, HISTORY_LIMIT};

#[derive(Default)]
struct Inner {
    users: HashMap<UserId, UserRecord>,
    usernames: HashMap<String, UserId>,
    rooms: HashMap<RoomId, RoomRecord>,
    memberships: HashMap<(UserId, RoomId), MembershipRecord>,
    messages: HashMap<MessageId, MessageRecord>,
    room_messages: HashMap<RoomId, Vec<MessageId>>,
    receipts: HashMap<(MessageId, UserId), ReadReceiptRecord>,
    presence: HashMap<UserId, PresenceRecord>,
    audit: Vec<AuditRecord>,
    sessions: HashMap<String, SessionRecord>,
}

/// In-memory chat store.
///
/// Useful for tests and development. All data is lost on drop.
pub struct MemoryStore {
    inner: Arc<RwLock<Inner>>,
}

impl MemoryStore {
    /// Create a new empty store.
    pub fn new() -> Self {
        Self {
            inner: Arc::new(RwLock::new(Inner::default())),
        }
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ChatStore for MemoryStore {
    fn name(&self) -> &str {
        "memory"
    }

    async fn create_user(&self, user: UserRecord) -> Result<()> {
        let mut inner = self.inner.write().unwrap();
        if inner.usernames.contains_key(&user.username) {
            return Err(Error::AlreadyExists(format!(
                "Username already taken: {}",
                user.username
            )));
        }
        inner.usernames.insert(user.username.clone(), user.id);
        inner.users.insert(user.id, user);
        Ok(())
    }

    async fn user(&self, id: UserId) -> Result<UserRecord> {
        self.inner
            .read()
            .unwrap()
            .users
            .get(&id)
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("User not found: {}", id)))
    }

    async fn user_by_username(&self, username: &str) -> Result<UserRecord> {
        let inner = self.inner.read().unwrap();
        let id = inner
            .usernames
            .get(username)
            .ok_or_else(|| Error::NotFound(format!("User not found: {}", username)))?;
        inner
            .users
            .get(id)
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("User not found: {}", username)))
    }

    async fn update_user(&self, user: &UserRecord) -> Result<()> {
        let mut inner = self.inner.write().unwrap();
        if !inner.users.contains_key(&user.id) {
            return Err(Error::NotFound(format!("User not found: {}", user.id)));
        }
        inner.users.insert(user.id, user.clone());
        Ok(())
    }

    async fn create_room(&self, room: RoomRecord) -> Result<()> {
        let mut inner = self.inner.write().unwrap();
        if inner.rooms.contains_key(&room.id) {
            return Err(Error::AlreadyExists(format!(
                "Room already exists: {}",
                room.id
            )));
        }
        inner.room_messages.entry(room.id).or_default();
        inner.rooms.insert(room.id, room);
        Ok(())
    }

    async fn room(&self, id: RoomId) -> Result<RoomRecord> {
        self.inner
            .read()
            .unwrap()
            .rooms
            .get(&id)
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("Room not found: {}", id)))
    }

    async fn update_room(&self, room: &RoomRecord) -> Result<()> {
        let mut inner = self.inner.write().unwrap();
        if !inner.rooms.contains_key(&room.id) {
            return Err(Error::NotFound(format!("Room not found: {}", room.id)));
        }
        inner.rooms.insert(room.id, room.clone());
        Ok(())
    }

    async fn add_membership(&self, membership: MembershipRecord) -> Result<()> {
        let mut inner = self.inner.write().unwrap();
        let key = (membership.user_id, membership.room_id);
        if inner.memberships.contains_key(&key) {
            return Err(Error::AlreadyExists(format!(
                "User {} is already a member of room {}",
                membership.user_id, membership.room_id
            )));
        }
        inner.memberships.insert(key, membership);
        Ok(())
    }

    async fn membership(&self, user: UserId, room: RoomId) -> Result<MembershipRecord> {
        self.inner
            .read()
            .unwrap()
            .memberships
            .get(&(user, room))
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("User {} is not a member of room {}", user, room)))
    }

    async fn update_membership(&self, membership: &MembershipRecord) -> Result<()> {
        let mut inner = self.inner.write().unwrap();
        let key = (membership.user_id, membership.room_id);
        if !inner.memberships.contains_key(&key) {
            return Err(Error::NotFound(format!(
                "User {} is not a member of room {}",
                membership.user_id, membership.room_id
            )));
        }
        inner.memberships.insert(key, membership.clone());
        Ok(())
    }

    async fn remove_membership(&self, user: UserId, room: RoomId) -> Result<()> {
        let mut inner = self.inner.write().unwrap();
        inner
            .memberships
            .remove(&(user, room))
            .map(|_| ())
            .ok_or_else(|| Error::NotFound(format!("User {} is not a member of room {}", user, room)))
    }

    async fn room_members(&self, room: RoomId) -> Result<Vec<MembershipRecord>> {
        let inner = self.inner.read().unwrap();
        let mut members: Vec<MembershipRecord> = inner
            .memberships
            .values()
            .filter(|m| m.room_id == room)
            .cloned()
            .collect();
        members.sort_by_key(|m| m.joined_at);
        Ok(members)
    }

    async fn rooms_for_user(&self, user: UserId) -> Result<Vec<RoomId>> {
        let inner = self.inner.read().unwrap();
        let mut memberships: Vec<&MembershipRecord> = inner
            .memberships
            .values()
            .filter(|m| m.user_id == user)
            .collect();
        memberships.sort_by_key(|m| m.joined_at);
        Ok(memberships.into_iter().map(|m| m.room_id).collect())
    }

    async fn append_message(&self, message: MessageRecord) -> Result<()> {
        let mut inner = self.inner.write().unwrap();
        inner
            .room_messages
            .entry(message.room_id)
            .or_default()
            .push(message.id);
        inner.messages.insert(message.id, message);
        Ok(())
    }

    async fn message(&self, id: MessageId) -> Result<MessageRecord> {
        self.inner
            .read()
            .unwrap()
            .messages
            .get(&id)
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("Message not found: {}", id)))
    }

    async fn update_message(&self, message: &MessageRecord) -> Result<()> {
        let mut inner = self.inner.write().unwrap();
        if !inner.messages.contains_key(&message.id) {
            return Err(Error::NotFound(format!(
                "Message not found: {}",
                message.id
            )));
        }
        inner.messages.insert(message.id, message.clone());
        Ok(())
    }

    async fn recent_messages(&self, room: RoomId, limit: usize) -> Result<Vec<MessageRecord>> {
        let limit = limit.min(HISTORY_LIMIT);
        let inner = self.inner.read().unwrap();

        let ids = match inner.room_messages.get(&room) {
            Some(ids) => ids,
            None => return Ok(Vec::new()),
        };

        let visible: Vec<MessageRecord> = ids
            .iter()
            .filter_map(|id| inner.messages.get(id))
            .filter(|m| !m.is_deleted)
            .cloned()
            .collect();

        let skip = visible.len().saturating_sub(limit);
        Ok(visible.into_iter().skip(skip).collect())
    }

    async fn prune_messages_before(&self, room: RoomId, cutoff: DateTime<Utc>) -> Result<u64> {
        let mut inner = self.inner.write().unwrap();

        let ids = match inner.room_messages.get(&room) {
            Some(ids) => ids.clone(),
            None => return Ok(0),
        };

        let mut pruned = 0u64;
        let mut kept = Vec::with_capacity(ids.len());
        for id in ids {
            let expired = inner
                .messages
                .get(&id)
                .map(|m| m.timestamp < cutoff)
                .unwrap_or(true);
            if expired {
                inner.messages.remove(&id);
                pruned += 1;
            } else {
                kept.push(id);
            }
        }
        inner.room_messages.insert(room, kept);

        Ok(pruned)
    }

    async fn record_receipt(&self, receipt: ReadReceiptRecord) -> Result<bool> {
        let mut inner = self.inner.write().unwrap();
        let key = (receipt.message_id, receipt.user_id);
        if inner.receipts.contains_key(&key) {
            return Ok(false);
        }
        inner.receipts.insert(key, receipt);
        Ok(true)
    }

    async fn receipts_for_message(&self, message: MessageId) -> Result<Vec<ReadReceiptRecord>> {
        let inner = self.inner.read().unwrap();
        let mut receipts: Vec<ReadReceiptRecord> = inner
            .receipts
            .values()
            .filter(|r| r.message_id == message)
            .cloned()
            .collect();
        receipts.sort_by_key(|r| r.read_at);
        Ok(receipts)
    }

    async fn upsert_presence(&self, presence: PresenceRecord) -> Result<()> {
        self.inner
            .write()
            .unwrap()
            .presence
            .insert(presence.user_id, presence);
        Ok(())
    }

    async fn presence(&self, user: UserId) -> Result<Option<PresenceRecord>> {
        Ok(self.inner.read().unwrap().presence.get(&user).cloned())
    }

    async fn append_audit(&self, entry: AuditRecord) -> Result<()> {
        self.inner.write().unwrap().audit.push(entry);
        Ok(())
    }

    async fn recent_audit(&self, user: UserId, limit: usize) -> Result<Vec<AuditRecord>> {
        let inner = self.inner.read().unwrap();
        let mut entries: Vec<AuditRecord> = inner
            .audit
            .iter()
            .filter(|e| e.user_id == user)
            .cloned()
            .collect();
        entries.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
        entries.truncate(limit);
        Ok(entries)
    }

    async fn create_session(&self, session: SessionRecord) -> Result<()> {
        let mut inner = self.inner.write().unwrap();
        if inner.sessions.contains_key(&session.token) {
            return Err(Error::AlreadyExists("Session token collision".to_string()));
        }
        inner.sessions.insert(session.token.clone(), session);
        Ok(())
    }

    async fn session_by_token(&self, token: &str) -> Result<SessionRecord> {
        self.inner
            .read()
            .unwrap()
            .sessions
            .get(token)
            .cloned()
            .ok_or_else(|| Error::NotFound("Session not found".to_string()))
    }

    async fn update_session(&self, session: &SessionRecord) -> Result<()> {
        let mut inner = self.inner.write().unwrap();
        if !inner.sessions.contains_key(&session.token) {
            return Err(Error::NotFound("Session not found".to_string()));
        }
        inner.sessions.insert(session.token.clone(), session.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::records::{RoomRole, RoomType};
    use chrono::Duration;

    fn test_user(name: &str) -> UserRecord {
        UserRecord::new(name, "public-key", "locked-blob", 1)
    }

    fn test_room(creator: UserId) -> RoomRecord {
        RoomRecord::new("general", RoomType::Private, "sealed", "key-id", 1, creator)
    }

    #[tokio::test]
    async fn test_user_crud() {
        let store = MemoryStore::new();
        let user = test_user("alice");
        let id = user.id;

        store.create_user(user).await.unwrap();
        assert_eq!(store.user(id).await.unwrap().username, "alice");
        assert_eq!(store.user_by_username("alice").await.unwrap().id, id);

        let mut updated = store.user(id).await.unwrap();
        updated.failed_login_attempts = 3;
        store.update_user(&updated).await.unwrap();
        assert_eq!(store.user(id).await.unwrap().failed_login_attempts, 3);
    }

    #[tokio::test]
    async fn test_duplicate_username_rejected() {
        let store = MemoryStore::new();
        store.create_user(test_user("alice")).await.unwrap();

        let result = store.create_user(test_user("alice")).await;
        assert!(matches!(result, Err(Error::AlreadyExists(_))));
    }

    #[tokio::test]
    async fn test_membership_uniqueness() {
        let store = MemoryStore::new();
        let user = test_user("alice");
        let user_id = user.id;
        store.create_user(user).await.unwrap();

        let room = test_room(user_id);
        let room_id = room.id;
        store.create_room(room).await.unwrap();

        let membership = MembershipRecord::new(user_id, room_id, "wrapped", RoomRole::Admin);
        store.add_membership(membership.clone()).await.unwrap();

        let duplicate = MembershipRecord::new(user_id, room_id, "wrapped2", RoomRole::Member);
        assert!(matches!(
            store.add_membership(duplicate).await,
            Err(Error::AlreadyExists(_))
        ));

        assert_eq!(store.rooms_for_user(user_id).await.unwrap(), vec![room_id]);
        assert_eq!(store.room_members(room_id).await.unwrap().len(), 1);

        store.remove_membership(user_id, room_id).await.unwrap();
        assert!(store.membership(user_id, room_id).await.is_err());
    }

    #[tokio::test]
    async fn test_recent_messages_excludes_deleted() {
        let store = MemoryStore::new();
        let user = test_user("alice");
        let user_id = user.id;
        store.create_user(user).await.unwrap();
        let room = test_room(user_id);
        let room_id = room.id;
        store.create_room(room).await.unwrap();

        let mut first = MessageRecord::new(room_id, user_id, "ct1", "pk", "h1", "text");
        let second = MessageRecord::new(room_id, user_id, "ct2", "pk", "h2", "text");
        store.append_message(first.clone()).await.unwrap();
        store.append_message(second.clone()).await.unwrap();

        first.soft_delete();
        store.update_message(&first).await.unwrap();

        let recent = store.recent_messages(room_id, 50).await.unwrap();
        assert_eq!(recent.len(), 1);
        assert_eq!(recent[0].id, second.id);
    }

    #[tokio::test]
    async fn test_recent_messages_ordering_and_limit() {
        let store = MemoryStore::new();
        let user = test_user("alice");
        let user_id = user.id;
        store.create_user(user).await.unwrap();
        let room = test_room(user_id);
        let room_id = room.id;
        store.create_room(room).await.unwrap();

        for i in 0..5 {
            let msg = MessageRecord::new(room_id, user_id, format!("ct{}", i), "pk", "h", "text");
            store.append_message(msg).await.unwrap();
        }

        let recent = store.recent_messages(room_id, 3).await.unwrap();
        assert_eq!(recent.len(), 3);
        // Oldest first within the window: the last three appended
        assert_eq!(recent[0].encrypted_content, "ct2");
        assert_eq!(recent[2].encrypted_content, "ct4");
    }

    #[tokio::test]
    async fn test_prune_messages() {
        let store = MemoryStore::new();
        let user = test_user("alice");
        let user_id = user.id;
        store.create_user(user).await.unwrap();
        let room = test_room(user_id);
        let room_id = room.id;
        store.create_room(room).await.unwrap();

        let mut old = MessageRecord::new(room_id, user_id, "old", "pk", "h", "text");
        old.timestamp = Utc::now() - Duration::days(60);
        let fresh = MessageRecord::new(room_id, user_id, "fresh", "pk", "h", "text");
        store.append_message(old).await.unwrap();
        store.append_message(fresh).await.unwrap();

        let pruned = store
            .prune_messages_before(room_id, Utc::now() - Duration::days(30))
            .await
            .unwrap();
        assert_eq!(pruned, 1);

        let remaining = store.recent_messages(room_id, 10).await.unwrap();
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].encrypted_content, "fresh");
    }

    #[tokio::test]
    async fn test_receipt_idempotent() {
        let store = MemoryStore::new();
        let message_id = MessageId::generate();
        let user_id = UserId::generate();

        let created = store
            .record_receipt(ReadReceiptRecord::new(message_id, user_id))
            .await
            .unwrap();
        assert!(created);

        let again = store
            .record_receipt(ReadReceiptRecord::new(message_id, user_id))
            .await
            .unwrap();
        assert!(!again);

        assert_eq!(store.receipts_for_message(message_id).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_presence_upsert() {
        let store = MemoryStore::new();
        let user_id = UserId::generate();

        assert!(store.presence(user_id).await.unwrap().is_none());

        store
            .upsert_presence(PresenceRecord::new(
                user_id,
                crate::records::PresenceStatus::Online,
                None,
            ))
            .await
            .unwrap();

        let presence = store.presence(user_id).await.unwrap().unwrap();
        assert_eq!(presence.status, crate::records::PresenceStatus::Online);
    }

    #[tokio::test]
    async fn test_audit_ordering() {
        let store = MemoryStore::new();
        let user_id = UserId::generate();

        for event in [
            crate::records::AuditEvent::Login,
            crate::records::AuditEvent::Logout,
        ] {
            store
                .append_audit(AuditRecord::new(user_id, event, serde_json::json!({})))
                .await
                .unwrap();
        }

        let entries = store.recent_audit(user_id, 10).await.unwrap();
        assert_eq!(entries.len(), 2);
        // Newest first
        assert!(entries[0].timestamp >= entries[1].timestamp);
    }

    #[tokio::test]
    async fn test_sessions() {
        let store = MemoryStore::new();
        let user_id = UserId::generate();

        let session =
            SessionRecord::new(user_id, "tok-1", Utc::now() + Duration::hours(24));
        store.create_session(session.clone()).await.unwrap();

        let mut fetched = store.session_by_token("tok-1").await.unwrap();
        assert_eq!(fetched.user_id, user_id);

        fetched.is_active = false;
        store.update_session(&fetched).await.unwrap();
        assert!(!store.session_by_token("tok-1").await.unwrap().is_active);

        let collision =
            SessionRecord::new(user_id, "tok-1", Utc::now() + Duration::hours(24));
        assert!(store.create_session(collision).await.is_err());
    }
}
