//! Record types persisted by the chat store.
//!
//! Everything here is metadata or sealed/wrapped key material; message
//! content only ever appears as opaque ciphertext storage strings.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use cipherchat_common::{Error, MessageId, Result, RoomId, UserId};

/// Failed logins tolerated before an account is locked.
pub const MAX_FAILED_LOGINS: u32 = 5;

/// How long a lockout lasts.
pub const LOCKOUT_MINUTES: i64 = 30;

/// A registered user with their key material.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserRecord {
    pub id: UserId,
    pub username: String,
    /// Identity public key in standard base64.
    pub public_key: String,
    /// Identity secret sealed under the user's password.
    pub locked_identity: String,
    pub key_version: u32,
    pub keys_generated_at: DateTime<Utc>,
    pub failed_login_attempts: u32,
    pub last_failed_login: Option<DateTime<Utc>>,
    pub is_locked: bool,
    pub locked_until: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl UserRecord {
    /// Create a record for a freshly registered user.
    pub fn new(
        username: impl Into<String>,
        public_key: impl Into<String>,
        locked_identity: impl Into<String>,
        key_version: u32,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: UserId::generate(),
            username: username.into(),
            public_key: public_key.into(),
            locked_identity: locked_identity.into(),
            key_version,
            keys_generated_at: now,
            failed_login_attempts: 0,
            last_failed_login: None,
            is_locked: false,
            locked_until: None,
            created_at: now,
        }
    }

    /// Record a failed login attempt.
    ///
    /// Returns true if this attempt crossed the threshold and locked the
    /// account.
    pub fn record_failed_login(&mut self, now: DateTime<Utc>) -> bool {
        self.failed_login_attempts += 1;
        self.last_failed_login = Some(now);

        if self.failed_login_attempts >= MAX_FAILED_LOGINS && !self.is_locked {
            self.is_locked = true;
            self.locked_until = Some(now + Duration::minutes(LOCKOUT_MINUTES));
            return true;
        }
        false
    }

    /// Reset the failure counter after a successful login or expired lock.
    pub fn reset_failed_logins(&mut self) {
        self.failed_login_attempts = 0;
        self.last_failed_login = None;
        self.is_locked = false;
        self.locked_until = None;
    }

    /// Whether a standing lock has expired and can be lifted.
    pub fn lock_expired(&self, now: DateTime<Utc>) -> bool {
        match (self.is_locked, self.locked_until) {
            (true, Some(until)) => now > until,
            _ => false,
        }
    }
}

/// Room visibility classes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RoomType {
    Public,
    Private,
    Direct,
}

impl RoomType {
    pub fn as_str(self) -> &'static str {
        match self {
            RoomType::Public => "public",
            RoomType::Private => "private",
            RoomType::Direct => "direct",
        }
    }

    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "public" => Ok(RoomType::Public),
            "private" => Ok(RoomType::Private),
            "direct" => Ok(RoomType::Direct),
            other => Err(Error::InvalidInput(format!("Unknown room type: {}", other))),
        }
    }
}

impl Default for RoomType {
    fn default() -> Self {
        RoomType::Private
    }
}

/// Member role within a room.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RoomRole {
    Member,
    Moderator,
    Admin,
}

impl RoomRole {
    /// Whether this role may add members to the room.
    pub fn can_add_members(self) -> bool {
        matches!(self, RoomRole::Admin | RoomRole::Moderator)
    }

    /// Whether this role may remove a member holding `target`.
    ///
    /// Admins remove anyone; moderators remove plain members only.
    pub fn can_remove(self, target: RoomRole) -> bool {
        match self {
            RoomRole::Admin => true,
            RoomRole::Moderator => target == RoomRole::Member,
            RoomRole::Member => false,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            RoomRole::Member => "member",
            RoomRole::Moderator => "moderator",
            RoomRole::Admin => "admin",
        }
    }

    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "member" => Ok(RoomRole::Member),
            "moderator" => Ok(RoomRole::Moderator),
            "admin" => Ok(RoomRole::Admin),
            other => Err(Error::InvalidInput(format!("Unknown room role: {}", other))),
        }
    }
}

impl Default for RoomRole {
    fn default() -> Self {
        RoomRole::Member
    }
}

/// A chat room and its sealed key material.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoomRecord {
    pub id: RoomId,
    pub name: String,
    pub description: String,
    pub room_type: RoomType,
    /// Room key sealed under the server keyring.
    pub sealed_room_key: String,
    /// Previous sealed key retained after rotation.
    pub previous_sealed_room_key: Option<String>,
    /// Public identifier of the current key.
    pub key_id: String,
    pub key_version: u32,
    pub created_by: Option<UserId>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub is_active: bool,
    pub max_members: u32,
    /// Message retention in days; 0 keeps messages forever.
    pub message_retention_days: u32,
}

impl RoomRecord {
    pub const DEFAULT_MAX_MEMBERS: u32 = 100;
    pub const DEFAULT_RETENTION_DAYS: u32 = 30;

    /// Create a room shell around a sealed key.
    pub fn new(
        name: impl Into<String>,
        room_type: RoomType,
        sealed_room_key: impl Into<String>,
        key_id: impl Into<String>,
        key_version: u32,
        created_by: UserId,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: RoomId::generate(),
            name: name.into(),
            description: String::new(),
            room_type,
            sealed_room_key: sealed_room_key.into(),
            previous_sealed_room_key: None,
            key_id: key_id.into(),
            key_version,
            created_by: Some(created_by),
            created_at: now,
            updated_at: now,
            is_active: true,
            max_members: Self::DEFAULT_MAX_MEMBERS,
            message_retention_days: Self::DEFAULT_RETENTION_DAYS,
        }
    }
}

/// A user's membership in a room, carrying their wrapped copy of the
/// room key.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MembershipRecord {
    pub id: uuid::Uuid,
    pub user_id: UserId,
    pub room_id: RoomId,
    /// Room key wrapped to this member's public key (envelope storage
    /// string).
    pub wrapped_room_key: String,
    pub role: RoomRole,
    pub joined_at: DateTime<Utc>,
    pub last_read_at: DateTime<Utc>,
    pub is_muted: bool,
}

impl MembershipRecord {
    pub fn new(
        user_id: UserId,
        room_id: RoomId,
        wrapped_room_key: impl Into<String>,
        role: RoomRole,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: uuid::Uuid::new_v4(),
            user_id,
            room_id,
            wrapped_room_key: wrapped_room_key.into(),
            role,
            joined_at: now,
            last_read_at: now,
            is_muted: false,
        }
    }
}

/// An end-to-end encrypted message. The server stores and relays the
/// ciphertext without being able to read it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageRecord {
    pub id: MessageId,
    pub room_id: RoomId,
    pub sender_id: Option<UserId>,
    /// Envelope storage string (ciphertext, nonce, sender key combined).
    pub encrypted_content: String,
    /// Sender public key in base64, for client-side verification.
    pub sender_public_key: String,
    /// SHA3-256 of the plaintext, computed client-side.
    pub content_hash: String,
    /// Unencrypted metadata: text, image, file.
    pub message_type: String,
    pub timestamp: DateTime<Utc>,
    pub is_edited: bool,
    pub edited_at: Option<DateTime<Utc>>,
    pub is_deleted: bool,
    pub deleted_at: Option<DateTime<Utc>>,
}

impl MessageRecord {
    pub fn new(
        room_id: RoomId,
        sender_id: UserId,
        encrypted_content: impl Into<String>,
        sender_public_key: impl Into<String>,
        content_hash: impl Into<String>,
        message_type: impl Into<String>,
    ) -> Self {
        Self {
            id: MessageId::generate(),
            room_id,
            sender_id: Some(sender_id),
            encrypted_content: encrypted_content.into(),
            sender_public_key: sender_public_key.into(),
            content_hash: content_hash.into(),
            message_type: message_type.into(),
            timestamp: Utc::now(),
            is_edited: false,
            edited_at: None,
            is_deleted: false,
            deleted_at: None,
        }
    }

    /// Soft delete: the row survives for threading but the ciphertext is
    /// cleared.
    pub fn soft_delete(&mut self) {
        self.is_deleted = true;
        self.deleted_at = Some(Utc::now());
        self.encrypted_content.clear();
    }
}

/// Read receipt for one (message, user) pair.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReadReceiptRecord {
    pub id: uuid::Uuid,
    pub message_id: MessageId,
    pub user_id: UserId,
    pub read_at: DateTime<Utc>,
}

impl ReadReceiptRecord {
    pub fn new(message_id: MessageId, user_id: UserId) -> Self {
        Self {
            id: uuid::Uuid::new_v4(),
            message_id,
            user_id,
            read_at: Utc::now(),
        }
    }
}

/// User availability states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PresenceStatus {
    Online,
    Away,
    Busy,
    Offline,
}

impl PresenceStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            PresenceStatus::Online => "online",
            PresenceStatus::Away => "away",
            PresenceStatus::Busy => "busy",
            PresenceStatus::Offline => "offline",
        }
    }

    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "online" => Ok(PresenceStatus::Online),
            "away" => Ok(PresenceStatus::Away),
            "busy" => Ok(PresenceStatus::Busy),
            "offline" => Ok(PresenceStatus::Offline),
            other => Err(Error::InvalidInput(format!(
                "Unknown presence status: {}",
                other
            ))),
        }
    }
}

/// Current presence for one user.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PresenceRecord {
    pub user_id: UserId,
    pub status: PresenceStatus,
    pub last_seen: DateTime<Utc>,
    pub current_room: Option<RoomId>,
}

impl PresenceRecord {
    pub fn new(user_id: UserId, status: PresenceStatus, current_room: Option<RoomId>) -> Self {
        Self {
            user_id,
            status,
            last_seen: Utc::now(),
            current_room,
        }
    }
}

/// Security-relevant account events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditEvent {
    Login,
    Logout,
    FailedLogin,
    PasswordChange,
    KeyRotation,
    AccountLocked,
    AccountUnlocked,
}

impl AuditEvent {
    pub fn as_str(self) -> &'static str {
        match self {
            AuditEvent::Login => "login",
            AuditEvent::Logout => "logout",
            AuditEvent::FailedLogin => "failed_login",
            AuditEvent::PasswordChange => "password_change",
            AuditEvent::KeyRotation => "key_rotation",
            AuditEvent::AccountLocked => "account_locked",
            AuditEvent::AccountUnlocked => "account_unlocked",
        }
    }

    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "login" => Ok(AuditEvent::Login),
            "logout" => Ok(AuditEvent::Logout),
            "failed_login" => Ok(AuditEvent::FailedLogin),
            "password_change" => Ok(AuditEvent::PasswordChange),
            "key_rotation" => Ok(AuditEvent::KeyRotation),
            "account_locked" => Ok(AuditEvent::AccountLocked),
            "account_unlocked" => Ok(AuditEvent::AccountUnlocked),
            other => Err(Error::InvalidInput(format!(
                "Unknown audit event: {}",
                other
            ))),
        }
    }
}

/// One security audit log entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditRecord {
    pub id: uuid::Uuid,
    pub user_id: UserId,
    pub event: AuditEvent,
    pub details: serde_json::Value,
    pub timestamp: DateTime<Utc>,
}

impl AuditRecord {
    pub fn new(user_id: UserId, event: AuditEvent, details: serde_json::Value) -> Self {
        Self {
            id: uuid::Uuid::new_v4(),
            user_id,
            event,
            details,
            timestamp: Utc::now(),
        }
    }
}

/// An authenticated session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionRecord {
    pub id: uuid::Uuid,
    pub user_id: UserId,
    pub token: String,
    pub created_at: DateTime<Utc>,
    pub last_activity: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub is_active: bool,
}

impl SessionRecord {
    pub fn new(user_id: UserId, token: impl Into<String>, expires_at: DateTime<Utc>) -> Self {
        let now = Utc::now();
        Self {
            id: uuid::Uuid::new_v4(),
            user_id,
            token: token.into(),
            created_at: now,
            last_activity: now,
            expires_at,
            is_active: true,
        }
    }

    /// Whether the session can still be used.
    pub fn is_valid(&self, now: DateTime<Utc>) -> bool {
        self.is_active && now < self.expires_at
    }
}
