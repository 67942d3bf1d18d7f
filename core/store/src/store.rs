//! Chat store trait definition.

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use cipherchat_common::{MessageId, Result, RoomId, UserId};

use crate::records::{
    AuditRecord, MembershipRecord, MessageRecord, PresenceRecord, ReadReceiptRecord, RoomRecord,
    SessionRecord, UserRecord,
};

/// Upper bound on message history queries.
pub const HISTORY_LIMIT: usize = 100;

/// Storage backend for accounts, rooms, memberships, messages, and the
/// security audit trail.
///
/// Implementations never see plaintext or unwrapped keys; every sensitive
/// column is a sealed blob or an envelope storage string.
#[async_trait]
pub trait ChatStore: Send + Sync {
    /// Get the backend name (e.g., "memory", "sqlite").
    fn name(&self) -> &str;

    // Users

    /// Create a user.
    ///
    /// # Errors
    /// - `AlreadyExists` if the username is taken
    async fn create_user(&self, user: UserRecord) -> Result<()>;

    /// Fetch a user by id.
    ///
    /// # Errors
    /// - `NotFound` if no such user
    async fn user(&self, id: UserId) -> Result<UserRecord>;

    /// Fetch a user by username.
    async fn user_by_username(&self, username: &str) -> Result<UserRecord>;

    /// Persist changes to an existing user, keyed by id.
    async fn update_user(&self, user: &UserRecord) -> Result<()>;

    // Rooms

    /// Create a room.
    async fn create_room(&self, room: RoomRecord) -> Result<()>;

    /// Fetch a room by id.
    async fn room(&self, id: RoomId) -> Result<RoomRecord>;

    /// Persist changes to an existing room.
    async fn update_room(&self, room: &RoomRecord) -> Result<()>;

    // Memberships

    /// Add a membership.
    ///
    /// # Errors
    /// - `AlreadyExists` if the user is already a member of the room
    async fn add_membership(&self, membership: MembershipRecord) -> Result<()>;

    /// Fetch one user's membership in a room.
    ///
    /// # Errors
    /// - `NotFound` if the user is not a member
    async fn membership(&self, user: UserId, room: RoomId) -> Result<MembershipRecord>;

    /// Persist changes to a membership, keyed by (user, room).
    async fn update_membership(&self, membership: &MembershipRecord) -> Result<()>;

    /// Remove a membership.
    async fn remove_membership(&self, user: UserId, room: RoomId) -> Result<()>;

    /// All memberships of a room.
    async fn room_members(&self, room: RoomId) -> Result<Vec<MembershipRecord>>;

    /// Ids of all rooms a user belongs to.
    async fn rooms_for_user(&self, user: UserId) -> Result<Vec<RoomId>>;

    // Messages

    /// Append a message.
    async fn append_message(&self, message: MessageRecord) -> Result<()>;

    /// Fetch a message by id.
    async fn message(&self, id: MessageId) -> Result<MessageRecord>;

    /// Persist changes to a message (edit, soft delete).
    async fn update_message(&self, message: &MessageRecord) -> Result<()>;

    /// The most recent messages of a room, oldest first.
    ///
    /// Soft-deleted messages are excluded. `limit` is clamped to
    /// [`HISTORY_LIMIT`].
    async fn recent_messages(&self, room: RoomId, limit: usize) -> Result<Vec<MessageRecord>>;

    /// Hard-delete messages older than `cutoff`. Returns the number
    /// removed.
    async fn prune_messages_before(&self, room: RoomId, cutoff: DateTime<Utc>) -> Result<u64>;

    // Read receipts

    /// Record a read receipt.
    ///
    /// Idempotent per (message, user): returns false if a receipt already
    /// existed.
    async fn record_receipt(&self, receipt: ReadReceiptRecord) -> Result<bool>;

    /// All receipts for a message.
    async fn receipts_for_message(&self, message: MessageId) -> Result<Vec<ReadReceiptRecord>>;

    // Presence

    /// Insert or replace a user's presence.
    async fn upsert_presence(&self, presence: PresenceRecord) -> Result<()>;

    /// Fetch a user's presence, if any was ever recorded.
    async fn presence(&self, user: UserId) -> Result<Option<PresenceRecord>>;

    // Audit log

    /// Append an audit entry.
    async fn append_audit(&self, entry: AuditRecord) -> Result<()>;

    /// The most recent audit entries for a user, newest first.
    async fn recent_audit(&self, user: UserId, limit: usize) -> Result<Vec<AuditRecord>>;

    // Sessions

    /// Create a session.
    ///
    /// # Errors
    /// - `AlreadyExists` on a token collision
    async fn create_session(&self, session: SessionRecord) -> Result<()>;

    /// Fetch a session by its token.
    async fn session_by_token(&self, token: &str) -> Result<SessionRecord>;

    /// Persist changes to a session, keyed by token.
    async fn update_session(&self, session: &SessionRecord) -> Result<()>;
}
