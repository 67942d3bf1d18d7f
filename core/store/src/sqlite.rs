//! SQLite-backed chat store.
//!
//! Durable backend used by the CLI and single-node deployments. The
//! schema is created on open; timestamps are stored as fixed-width
//! RFC 3339 text so lexicographic comparison matches chronological order.

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};
use std::path::Path;
use std::sync::Mutex;
use tracing::info;

use cipherchat_common::{Error, MessageId, Result, RoomId, UserId};

use crate::records::{
    AuditEvent, AuditRecord, MembershipRecord, MessageRecord, PresenceRecord, PresenceStatus,
    ReadReceiptRecord, RoomRecord, RoomRole, RoomType, SessionRecord, UserRecord,
};
use crate::store::{ChatStore, HISTORY_LIMIT};

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS users (
    id TEXT PRIMARY KEY,
    username TEXT NOT NULL UNIQUE,
    public_key TEXT NOT NULL,
    locked_identity TEXT NOT NULL,
    key_version INTEGER NOT NULL,
    keys_generated_at TEXT NOT NULL,
    failed_login_attempts INTEGER NOT NULL,
    last_failed_login TEXT,
    is_locked INTEGER NOT NULL,
    locked_until TEXT,
    created_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS rooms (
    id TEXT PRIMARY KEY,
    name TEXT NOT NULL,
    description TEXT NOT NULL,
    room_type TEXT NOT NULL,
    sealed_room_key TEXT NOT NULL,
    previous_sealed_room_key TEXT,
    key_id TEXT NOT NULL UNIQUE,
    key_version INTEGER NOT NULL,
    created_by TEXT,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL,
    is_active INTEGER NOT NULL,
    max_members INTEGER NOT NULL,
    message_retention_days INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS memberships (
    id TEXT PRIMARY KEY,
    user_id TEXT NOT NULL,
    room_id TEXT NOT NULL,
    wrapped_room_key TEXT NOT NULL,
    role TEXT NOT NULL,
    joined_at TEXT NOT NULL,
    last_read_at TEXT NOT NULL,
    is_muted INTEGER NOT NULL,
    UNIQUE(user_id, room_id)
);

CREATE TABLE IF NOT EXISTS messages (
    id TEXT PRIMARY KEY,
    room_id TEXT NOT NULL,
    sender_id TEXT,
    encrypted_content TEXT NOT NULL,
    sender_public_key TEXT NOT NULL,
    content_hash TEXT NOT NULL,
    message_type TEXT NOT NULL,
    timestamp TEXT NOT NULL,
    is_edited INTEGER NOT NULL,
    edited_at TEXT,
    is_deleted INTEGER NOT NULL,
    deleted_at TEXT
);
CREATE INDEX IF NOT EXISTS idx_messages_room_time ON messages(room_id, timestamp);

CREATE TABLE IF NOT EXISTS read_receipts (
    id TEXT PRIMARY KEY,
    message_id TEXT NOT NULL,
    user_id TEXT NOT NULL,
    read_at TEXT NOT NULL,
    UNIQUE(message_id, user_id)
);

CREATE TABLE IF NOT EXISTS presence (
    user_id TEXT PRIMARY KEY,
    status TEXT NOT NULL,
    last_seen TEXT NOT NULL,
    current_room TEXT
);

CREATE TABLE IF NOT EXISTS audit_log (
    id TEXT PRIMARY KEY,
    user_id TEXT NOT NULL,
    event TEXT NOT NULL,
    details TEXT NOT NULL,
    timestamp TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_audit_user ON audit_log(user_id, timestamp);

CREATE TABLE IF NOT EXISTS sessions (
    id TEXT PRIMARY KEY,
    user_id TEXT NOT NULL,
    token TEXT NOT NULL UNIQUE,
    created_at TEXT NOT NULL,
    last_activity TEXT NOT NULL,
    expires_at TEXT NOT NULL,
    is_active INTEGER NOT NULL
);
"#;

fn db_err(e: rusqlite::Error) -> Error {
    Error::Storage(e.to_string())
}

/// Map a constraint violation on insert to `AlreadyExists`.
fn insert_err(e: rusqlite::Error, what: &str) -> Error {
    if let rusqlite::Error::SqliteFailure(f, _) = &e {
        if f.code == rusqlite::ErrorCode::ConstraintViolation {
            return Error::AlreadyExists(format!("{} already exists", what));
        }
    }
    db_err(e)
}

/// Wrap a conversion error for use inside rusqlite row closures.
fn conv_err<E: std::error::Error + Send + Sync + 'static>(e: E) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(0, rusqlite::types::Type::Text, Box::new(e))
}

fn ts(t: DateTime<Utc>) -> String {
    t.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn opt_ts(t: Option<DateTime<Utc>>) -> Option<String> {
    t.map(ts)
}

fn parse_ts(s: &str) -> std::result::Result<DateTime<Utc>, chrono::ParseError> {
    DateTime::parse_from_rfc3339(s).map(|t| t.with_timezone(&Utc))
}

fn read_user(row: &Row<'_>) -> rusqlite::Result<UserRecord> {
    let id: String = row.get(0)?;
    let keys_generated_at: String = row.get(5)?;
    let last_failed_login: Option<String> = row.get(7)?;
    let locked_until: Option<String> = row.get(9)?;
    let created_at: String = row.get(10)?;

    Ok(UserRecord {
        id: UserId::parse(&id).map_err(conv_err)?,
        username: row.get(1)?,
        public_key: row.get(2)?,
        locked_identity: row.get(3)?,
        key_version: row.get::<_, i64>(4)? as u32,
        keys_generated_at: parse_ts(&keys_generated_at).map_err(conv_err)?,
        failed_login_attempts: row.get::<_, i64>(6)? as u32,
        last_failed_login: last_failed_login
            .as_deref()
            .map(parse_ts)
            .transpose()
            .map_err(conv_err)?,
        is_locked: row.get::<_, i64>(8)? != 0,
        locked_until: locked_until
            .as_deref()
            .map(parse_ts)
            .transpose()
            .map_err(conv_err)?,
        created_at: parse_ts(&created_at).map_err(conv_err)?,
    })
}

fn read_room(row: &Row<'_>) -> rusqlite::Result<RoomRecord> {
    let id: String = row.get(0)?;
    let room_type: String = row.get(3)?;
    let created_by: Option<String> = row.get(8)?;
    let created_at: String = row.get(9)?;
    let updated_at: String = row.get(10)?;

    Ok(RoomRecord {
        id: RoomId::parse(&id).map_err(conv_err)?,
        name: row.get(1)?,
        description: row.get(2)?,
        room_type: RoomType::parse(&room_type).map_err(conv_err)?,
        sealed_room_key: row.get(4)?,
        previous_sealed_room_key: row.get(5)?,
        key_id: row.get(6)?,
        key_version: row.get::<_, i64>(7)? as u32,
        created_by: created_by
            .as_deref()
            .map(UserId::parse)
            .transpose()
            .map_err(conv_err)?,
        created_at: parse_ts(&created_at).map_err(conv_err)?,
        updated_at: parse_ts(&updated_at).map_err(conv_err)?,
        is_active: row.get::<_, i64>(11)? != 0,
        max_members: row.get::<_, i64>(12)? as u32,
        message_retention_days: row.get::<_, i64>(13)? as u32,
    })
}

fn read_membership(row: &Row<'_>) -> rusqlite::Result<MembershipRecord> {
    let id: String = row.get(0)?;
    let user_id: String = row.get(1)?;
    let room_id: String = row.get(2)?;
    let role: String = row.get(4)?;
    let joined_at: String = row.get(5)?;
    let last_read_at: String = row.get(6)?;

    Ok(MembershipRecord {
        id: uuid::Uuid::parse_str(&id).map_err(conv_err)?,
        user_id: UserId::parse(&user_id).map_err(conv_err)?,
        room_id: RoomId::parse(&room_id).map_err(conv_err)?,
        wrapped_room_key: row.get(3)?,
        role: RoomRole::parse(&role).map_err(conv_err)?,
        joined_at: parse_ts(&joined_at).map_err(conv_err)?,
        last_read_at: parse_ts(&last_read_at).map_err(conv_err)?,
        is_muted: row.get::<_, i64>(7)? != 0,
    })
}

fn read_message(row: &Row<'_>) -> rusqlite::Result<MessageRecord> {
    let id: String = row.get(0)?;
    let room_id: String = row.get(1)?;
    let sender_id: Option<String> = row.get(2)?;
    let timestamp: String = row.get(7)?;
    let edited_at: Option<String> = row.get(9)?;
    let deleted_at: Option<String> = row.get(11)?;

    Ok(MessageRecord {
        id: MessageId::parse(&id).map_err(conv_err)?,
        room_id: RoomId::parse(&room_id).map_err(conv_err)?,
        sender_id: sender_id
            .as_deref()
            .map(UserId::parse)
            .transpose()
            .map_err(conv_err)?,
        encrypted_content: row.get(3)?,
        sender_public_key: row.get(4)?,
        content_hash: row.get(5)?,
        message_type: row.get(6)?,
        timestamp: parse_ts(&timestamp).map_err(conv_err)?,
        is_edited: row.get::<_, i64>(8)? != 0,
        edited_at: edited_at
            .as_deref()
            .map(parse_ts)
            .transpose()
            .map_err(conv_err)?,
        is_deleted: row.get::<_, i64>(10)? != 0,
        deleted_at: deleted_at
            .as_deref()
            .map(parse_ts)
            .transpose()
            .map_err(conv_err)?,
    })
}

fn read_receipt(row: &Row<'_>) -> rusqlite::Result<ReadReceiptRecord> {
    let id: String = row.get(0)?;
    let message_id: String = row.get(1)?;
    let user_id: String = row.get(2)?;
    let read_at: String = row.get(3)?;

    Ok(ReadReceiptRecord {
        id: uuid::Uuid::parse_str(&id).map_err(conv_err)?,
        message_id: MessageId::parse(&message_id).map_err(conv_err)?,
        user_id: UserId::parse(&user_id).map_err(conv_err)?,
        read_at: parse_ts(&read_at).map_err(conv_err)?,
    })
}

fn read_presence(row: &Row<'_>) -> rusqlite::Result<PresenceRecord> {
    let user_id: String = row.get(0)?;
    let status: String = row.get(1)?;
    let last_seen: String = row.get(2)?;
    let current_room: Option<String> = row.get(3)?;

    Ok(PresenceRecord {
        user_id: UserId::parse(&user_id).map_err(conv_err)?,
        status: PresenceStatus::parse(&status).map_err(conv_err)?,
        last_seen: parse_ts(&last_seen).map_err(conv_err)?,
        current_room: current_room
            .as_deref()
            .map(RoomId::parse)
            .transpose()
            .map_err(conv_err)?,
    })
}

fn read_audit(row: &Row<'_>) -> rusqlite::Result<AuditRecord> {
    let id: String = row.get(0)?;
    let user_id: String = row.get(1)?;
    let event: String = row.get(2)?;
    let details: String = row.get(3)?;
    let timestamp: String = row.get(4)?;

    Ok(AuditRecord {
        id: uuid::Uuid::parse_str(&id).map_err(conv_err)?,
        user_id: UserId::parse(&user_id).map_err(conv_err)?,
        event: AuditEvent::parse(&event).map_err(conv_err)?,
        details: serde_json::from_str(&details).map_err(conv_err)?,
        timestamp: parse_ts(&timestamp).map_err(conv_err)?,
    })
}

fn read_session(row: &Row<'_>) -> rusqlite::Result<SessionRecord> {
    let id: String = row.get(0)?;
    let user_id: String = row.get(1)?;
    let created_at: String = row.get(3)?;
    let last_activity: String = row.get(4)?;
    let expires_at: String = row.get(5)?;

    Ok(SessionRecord {
        id: uuid::Uuid::parse_str(&id).map_err(conv_err)?,
        user_id: UserId::parse(&user_id).map_err(conv_err)?,
        token: row.get(2)?,
        created_at: parse_ts(&created_at).map_err(conv_err)?,
        last_activity: parse_ts(&last_activity).map_err(conv_err)?,
        expires_at: parse_ts(&expires_at).map_err(conv_err)?,
        is_active: row.get::<_, i64>(6)? != 0,
    })
}

/// SQLite chat store.
pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    /// Create or open a store database.
    ///
    /// # Errors
    /// - Database open or schema creation failure
    pub fn open(db_path: impl AsRef<Path>) -> Result<Self> {
        let conn = Connection::open(db_path).map_err(db_err)?;
        conn.execute_batch(SCHEMA).map_err(db_err)?;

        info!("Chat store opened");
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Create an in-memory store (for testing).
    pub fn in_memory() -> Result<Self> {
        Self::open(":memory:")
    }
}

#[async_trait]
impl ChatStore for SqliteStore {
    fn name(&self) -> &str {
        "sqlite"
    }

    async fn create_user(&self, user: UserRecord) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            r#"
            INSERT INTO users
            (id, username, public_key, locked_identity, key_version, keys_generated_at,
             failed_login_attempts, last_failed_login, is_locked, locked_until, created_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)
            "#,
            params![
                user.id.to_string(),
                user.username,
                user.public_key,
                user.locked_identity,
                user.key_version as i64,
                ts(user.keys_generated_at),
                user.failed_login_attempts as i64,
                opt_ts(user.last_failed_login),
                user.is_locked as i64,
                opt_ts(user.locked_until),
                ts(user.created_at),
            ],
        )
        .map_err(|e| insert_err(e, "User"))?;
        Ok(())
    }

    async fn user(&self, id: UserId) -> Result<UserRecord> {
        let conn = self.conn.lock().unwrap();
        conn.query_row(
            "SELECT id, username, public_key, locked_identity, key_version, keys_generated_at,
                    failed_login_attempts, last_failed_login, is_locked, locked_until, created_at
             FROM users WHERE id = ?1",
            [id.to_string()],
            read_user,
        )
        .optional()
        .map_err(db_err)?
        .ok_or_else(|| Error::NotFound(format!("User not found: {}", id)))
    }

    async fn user_by_username(&self, username: &str) -> Result<UserRecord> {
        let conn = self.conn.lock().unwrap();
        conn.query_row(
            "SELECT id, username, public_key, locked_identity, key_version, keys_generated_at,
                    failed_login_attempts, last_failed_login, is_locked, locked_until, created_at
             FROM users WHERE username = ?1",
            [username],
            read_user,
        )
        .optional()
        .map_err(db_err)?
        .ok_or_else(|| Error::NotFound(format!("User not found: {}", username)))
    }

    async fn update_user(&self, user: &UserRecord) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        let changed = conn
            .execute(
                r#"
                UPDATE users SET username = ?2, public_key = ?3, locked_identity = ?4,
                    key_version = ?5, keys_generated_at = ?6, failed_login_attempts = ?7,
                    last_failed_login = ?8, is_locked = ?9, locked_until = ?10
                WHERE id = ?1
                "#,
                params![
                    user.id.to_string(),
                    user.username,
                    user.public_key,
                    user.locked_identity,
                    user.key_version as i64,
                    ts(user.keys_generated_at),
                    user.failed_login_attempts as i64,
                    opt_ts(user.last_failed_login),
                    user.is_locked as i64,
                    opt_ts(user.locked_until),
                ],
            )
            .map_err(db_err)?;
        if changed == 0 {
            return Err(Error::NotFound(format!("User not found: {}", user.id)));
        }
        Ok(())
    }

    async fn create_room(&self, room: RoomRecord) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            r#"
            INSERT INTO rooms
            (id, name, description, room_type, sealed_room_key, previous_sealed_room_key,
             key_id, key_version, created_by, created_at, updated_at, is_active,
             max_members, message_retention_days)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)
            "#,
            params![
                room.id.to_string(),
                room.name,
                room.description,
                room.room_type.as_str(),
                room.sealed_room_key,
                room.previous_sealed_room_key,
                room.key_id,
                room.key_version as i64,
                room.created_by.map(|u| u.to_string()),
                ts(room.created_at),
                ts(room.updated_at),
                room.is_active as i64,
                room.max_members as i64,
                room.message_retention_days as i64,
            ],
        )
        .map_err(|e| insert_err(e, "Room"))?;
        Ok(())
    }

    async fn room(&self, id: RoomId) -> Result<RoomRecord> {
        let conn = self.conn.lock().unwrap();
        conn.query_row(
            "SELECT id, name, description, room_type, sealed_room_key, previous_sealed_room_key,
                    key_id, key_version, created_by, created_at, updated_at, is_active,
                    max_members, message_retention_days
             FROM rooms WHERE id = ?1",
            [id.to_string()],
            read_room,
        )
        .optional()
        .map_err(db_err)?
        .ok_or_else(|| Error::NotFound(format!("Room not found: {}", id)))
    }

    async fn update_room(&self, room: &RoomRecord) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        let changed = conn
            .execute(
                r#"
                UPDATE rooms SET name = ?2, description = ?3, room_type = ?4,
                    sealed_room_key = ?5, previous_sealed_room_key = ?6, key_id = ?7,
                    key_version = ?8, updated_at = ?9, is_active = ?10, max_members = ?11,
                    message_retention_days = ?12
                WHERE id = ?1
                "#,
                params![
                    room.id.to_string(),
                    room.name,
                    room.description,
                    room.room_type.as_str(),
                    room.sealed_room_key,
                    room.previous_sealed_room_key,
                    room.key_id,
                    room.key_version as i64,
                    ts(room.updated_at),
                    room.is_active as i64,
                    room.max_members as i64,
                    room.message_retention_days as i64,
                ],
            )
            .map_err(db_err)?;
        if changed == 0 {
            return Err(Error::NotFound(format!("Room not found: {}", room.id)));
        }
        Ok(())
    }

    async fn add_membership(&self, membership: MembershipRecord) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            r#"
            INSERT INTO memberships
            (id, user_id, room_id, wrapped_room_key, role, joined_at, last_read_at, is_muted)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
            "#,
            params![
                membership.id.to_string(),
                membership.user_id.to_string(),
                membership.room_id.to_string(),
                membership.wrapped_room_key,
                membership.role.as_str(),
                ts(membership.joined_at),
                ts(membership.last_read_at),
                membership.is_muted as i64,
            ],
        )
        .map_err(|e| insert_err(e, "Membership"))?;
        Ok(())
    }

    async fn membership(&self, user: UserId, room: RoomId) -> Result<MembershipRecord> {
        let conn = self.conn.lock().unwrap();
        conn.query_row(
            "SELECT id, user_id, room_id, wrapped_room_key, role, joined_at, last_read_at, is_muted
             FROM memberships WHERE user_id = ?1 AND room_id = ?2",
            [user.to_string(), room.to_string()],
            read_membership,
        )
        .optional()
        .map_err(db_err)?
        .ok_or_else(|| Error::NotFound(format!("User {} is not a member of room {}", user, room)))
    }

    async fn update_membership(&self, membership: &MembershipRecord) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        let changed = conn
            .execute(
                r#"
                UPDATE memberships SET wrapped_room_key = ?3, role = ?4, last_read_at = ?5,
                    is_muted = ?6
                WHERE user_id = ?1 AND room_id = ?2
                "#,
                params![
                    membership.user_id.to_string(),
                    membership.room_id.to_string(),
                    membership.wrapped_room_key,
                    membership.role.as_str(),
                    ts(membership.last_read_at),
                    membership.is_muted as i64,
                ],
            )
            .map_err(db_err)?;
        if changed == 0 {
            return Err(Error::NotFound(format!(
                "User {} is not a member of room {}",
                membership.user_id, membership.room_id
            )));
        }
        Ok(())
    }

    async fn remove_membership(&self, user: UserId, room: RoomId) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        let changed = conn
            .execute(
                "DELETE FROM memberships WHERE user_id = ?1 AND room_id = ?2",
                [user.to_string(), room.to_string()],
            )
            .map_err(db_err)?;
        if changed == 0 {
            return Err(Error::NotFound(format!(
                "User {} is not a member of room {}",
                user, room
            )));
        }
        Ok(())
    }

    async fn room_members(&self, room: RoomId) -> Result<Vec<MembershipRecord>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn
            .prepare(
                "SELECT id, user_id, room_id, wrapped_room_key, role, joined_at, last_read_at, is_muted
                 FROM memberships WHERE room_id = ?1 ORDER BY joined_at",
            )
            .map_err(db_err)?;
        let rows = stmt
            .query_map([room.to_string()], read_membership)
            .map_err(db_err)?;

        let mut members = Vec::new();
        for row in rows {
            members.push(row.map_err(db_err)?);
        }
        Ok(members)
    }

    async fn rooms_for_user(&self, user: UserId) -> Result<Vec<RoomId>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn
            .prepare("SELECT room_id FROM memberships WHERE user_id = ?1 ORDER BY joined_at")
            .map_err(db_err)?;
        let rows = stmt
            .query_map([user.to_string()], |row| {
                let id: String = row.get(0)?;
                RoomId::parse(&id).map_err(conv_err)
            })
            .map_err(db_err)?;

        let mut rooms = Vec::new();
        for row in rows {
            rooms.push(row.map_err(db_err)?);
        }
        Ok(rooms)
    }

    async fn append_message(&self, message: MessageRecord) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            r#"
            INSERT INTO messages
            (id, room_id, sender_id, encrypted_content, sender_public_key, content_hash,
             message_type, timestamp, is_edited, edited_at, is_deleted, deleted_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)
            "#,
            params![
                message.id.to_string(),
                message.room_id.to_string(),
                message.sender_id.map(|u| u.to_string()),
                message.encrypted_content,
                message.sender_public_key,
                message.content_hash,
                message.message_type,
                ts(message.timestamp),
                message.is_edited as i64,
                opt_ts(message.edited_at),
                message.is_deleted as i64,
                opt_ts(message.deleted_at),
            ],
        )
        .map_err(|e| insert_err(e, "Message"))?;
        Ok(())
    }

    async fn message(&self, id: MessageId) -> Result<MessageRecord> {
        let conn = self.conn.lock().unwrap();
        conn.query_row(
            "SELECT id, room_id, sender_id, encrypted_content, sender_public_key, content_hash,
                    message_type, timestamp, is_edited, edited_at, is_deleted, deleted_at
             FROM messages WHERE id = ?1",
            [id.to_string()],
            read_message,
        )
        .optional()
        .map_err(db_err)?
        .ok_or_else(|| Error::NotFound(format!("Message not found: {}", id)))
    }

    async fn update_message(&self, message: &MessageRecord) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        let changed = conn
            .execute(
                r#"
                UPDATE messages SET encrypted_content = ?2, content_hash = ?3, is_edited = ?4,
                    edited_at = ?5, is_deleted = ?6, deleted_at = ?7
                WHERE id = ?1
                "#,
                params![
                    message.id.to_string(),
                    message.encrypted_content,
                    message.content_hash,
                    message.is_edited as i64,
                    opt_ts(message.edited_at),
                    message.is_deleted as i64,
                    opt_ts(message.deleted_at),
                ],
            )
            .map_err(db_err)?;
        if changed == 0 {
            return Err(Error::NotFound(format!(
                "Message not found: {}",
                message.id
            )));
        }
        Ok(())
    }

    async fn recent_messages(&self, room: RoomId, limit: usize) -> Result<Vec<MessageRecord>> {
        let limit = limit.min(HISTORY_LIMIT);
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn
            .prepare(
                "SELECT id, room_id, sender_id, encrypted_content, sender_public_key, content_hash,
                        message_type, timestamp, is_edited, edited_at, is_deleted, deleted_at
                 FROM messages WHERE room_id = ?1 AND is_deleted = 0
                 ORDER BY timestamp DESC LIMIT ?2",
            )
            .map_err(db_err)?;
        let rows = stmt
            .query_map(params![room.to_string(), limit as i64], read_message)
            .map_err(db_err)?;

        let mut messages = Vec::new();
        for row in rows {
            messages.push(row.map_err(db_err)?);
        }
        messages.reverse(); // oldest first
        Ok(messages)
    }

    async fn prune_messages_before(&self, room: RoomId, cutoff: DateTime<Utc>) -> Result<u64> {
        let conn = self.conn.lock().unwrap();
        let pruned = conn
            .execute(
                "DELETE FROM messages WHERE room_id = ?1 AND timestamp < ?2",
                params![room.to_string(), ts(cutoff)],
            )
            .map_err(db_err)?;
        Ok(pruned as u64)
    }

    async fn record_receipt(&self, receipt: ReadReceiptRecord) -> Result<bool> {
        let conn = self.conn.lock().unwrap();
        let inserted = conn
            .execute(
                r#"
                INSERT OR IGNORE INTO read_receipts (id, message_id, user_id, read_at)
                VALUES (?1, ?2, ?3, ?4)
                "#,
                params![
                    receipt.id.to_string(),
                    receipt.message_id.to_string(),
                    receipt.user_id.to_string(),
                    ts(receipt.read_at),
                ],
            )
            .map_err(db_err)?;
        Ok(inserted > 0)
    }

    async fn receipts_for_message(&self, message: MessageId) -> Result<Vec<ReadReceiptRecord>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn
            .prepare(
                "SELECT id, message_id, user_id, read_at FROM read_receipts
                 WHERE message_id = ?1 ORDER BY read_at",
            )
            .map_err(db_err)?;
        let rows = stmt
            .query_map([message.to_string()], read_receipt)
            .map_err(db_err)?;

        let mut receipts = Vec::new();
        for row in rows {
            receipts.push(row.map_err(db_err)?);
        }
        Ok(receipts)
    }

    async fn upsert_presence(&self, presence: PresenceRecord) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            r#"
            INSERT OR REPLACE INTO presence (user_id, status, last_seen, current_room)
            VALUES (?1, ?2, ?3, ?4)
            "#,
            params![
                presence.user_id.to_string(),
                presence.status.as_str(),
                ts(presence.last_seen),
                presence.current_room.map(|r| r.to_string()),
            ],
        )
        .map_err(db_err)?;
        Ok(())
    }

    async fn presence(&self, user: UserId) -> Result<Option<PresenceRecord>> {
        let conn = self.conn.lock().unwrap();
        conn.query_row(
            "SELECT user_id, status, last_seen, current_room FROM presence WHERE user_id = ?1",
            [user.to_string()],
            read_presence,
        )
        .optional()
        .map_err(db_err)
    }

    async fn append_audit(&self, entry: AuditRecord) -> Result<()> {
        let details = serde_json::to_string(&entry.details)
            .map_err(|e| Error::Serialization(e.to_string()))?;

        let conn = self.conn.lock().unwrap();
        conn.execute(
            r#"
            INSERT INTO audit_log (id, user_id, event, details, timestamp)
            VALUES (?1, ?2, ?3, ?4, ?5)
            "#,
            params![
                entry.id.to_string(),
                entry.user_id.to_string(),
                entry.event.as_str(),
                details,
                ts(entry.timestamp),
            ],
        )
        .map_err(db_err)?;
        Ok(())
    }

    async fn recent_audit(&self, user: UserId, limit: usize) -> Result<Vec<AuditRecord>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn
            .prepare(
                "SELECT id, user_id, event, details, timestamp FROM audit_log
                 WHERE user_id = ?1 ORDER BY timestamp DESC LIMIT ?2",
            )
            .map_err(db_err)?;
        let rows = stmt
            .query_map(params![user.to_string(), limit as i64], read_audit)
            .map_err(db_err)?;

        let mut entries = Vec::new();
        for row in rows {
            entries.push(row.map_err(db_err)?);
        }
        Ok(entries)
    }

    async fn create_session(&self, session: SessionRecord) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            r#"
            INSERT INTO sessions
            (id, user_id, token, created_at, last_activity, expires_at, is_active)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
            "#,
            params![
                session.id.to_string(),
                session.user_id.to_string(),
                session.token,
                ts(session.created_at),
                ts(session.last_activity),
                ts(session.expires_at),
                session.is_active as i64,
            ],
        )
        .map_err(|e| insert_err(e, "Session"))?;
        Ok(())
    }

    async fn session_by_token(&self, token: &str) -> Result<SessionRecord> {
        let conn = self.conn.lock().unwrap();
        conn.query_row(
            "SELECT id, user_id, token, created_at, last_activity, expires_at, is_active
             FROM sessions WHERE token = ?1",
            [token],
            read_session,
        )
        .optional()
        .map_err(db_err)?
        .ok_or_else(|| Error::NotFound("Session not found".to_string()))
    }

    async fn update_session(&self, session: &SessionRecord) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        let changed = conn
            .execute(
                "UPDATE sessions SET last_activity = ?2, expires_at = ?3, is_active = ?4
                 WHERE token = ?1",
                params![
                    session.token,
                    ts(session.last_activity),
                    ts(session.expires_at),
                    session.is_active as i64,
                ],
            )
            .map_err(db_err)?;
        if changed == 0 {
            return Err(Error::NotFound("Session not found".to_string()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::records::{RoomRole, RoomType};
    use chrono::Duration;

    fn test_store() -> SqliteStore {
        SqliteStore::in_memory().unwrap()
    }

    fn test_user(name: &str) -> UserRecord {
        UserRecord::new(name, "public-key", "locked-blob", 1)
    }

    #[tokio::test]
    async fn test_user_roundtrip() {
        let store = test_store();
        let user = test_user("alice");
        let id = user.id;

        store.create_user(user).await.unwrap();

        let fetched = store.user(id).await.unwrap();
        assert_eq!(fetched.username, "alice");
        assert_eq!(fetched.public_key, "public-key");
        assert!(!fetched.is_locked);

        let by_name = store.user_by_username("alice").await.unwrap();
        assert_eq!(by_name.id, id);
    }

    #[tokio::test]
    async fn test_duplicate_username_rejected() {
        let store = test_store();
        store.create_user(test_user("alice")).await.unwrap();
        assert!(matches!(
            store.create_user(test_user("alice")).await,
            Err(Error::AlreadyExists(_))
        ));
    }

    #[tokio::test]
    async fn test_user_update_persists_lockout() {
        let store = test_store();
        let mut user = test_user("bob");
        let id = user.id;
        store.create_user(user.clone()).await.unwrap();

        let now = Utc::now();
        for _ in 0..crate::records::MAX_FAILED_LOGINS {
            user.record_failed_login(now);
        }
        store.update_user(&user).await.unwrap();

        let fetched = store.user(id).await.unwrap();
        assert!(fetched.is_locked);
        assert!(fetched.locked_until.is_some());
        assert_eq!(
            fetched.failed_login_attempts,
            crate::records::MAX_FAILED_LOGINS
        );
    }

    #[tokio::test]
    async fn test_room_roundtrip() {
        let store = test_store();
        let creator = test_user("alice");
        let creator_id = creator.id;
        store.create_user(creator).await.unwrap();

        let mut room = RoomRecord::new(
            "general",
            RoomType::Private,
            "sealed-key",
            "key-id-1",
            1,
            creator_id,
        );
        room.description = "the general room".to_string();
        let room_id = room.id;
        store.create_room(room).await.unwrap();

        let fetched = store.room(room_id).await.unwrap();
        assert_eq!(fetched.name, "general");
        assert_eq!(fetched.room_type, RoomType::Private);
        assert_eq!(fetched.created_by, Some(creator_id));
        assert_eq!(fetched.max_members, RoomRecord::DEFAULT_MAX_MEMBERS);

        let mut updated = fetched;
        updated.key_version = 2;
        updated.previous_sealed_room_key = Some("old-sealed".to_string());
        store.update_room(&updated).await.unwrap();

        let again = store.room(room_id).await.unwrap();
        assert_eq!(again.key_version, 2);
        assert_eq!(again.previous_sealed_room_key.as_deref(), Some("old-sealed"));
    }

    #[tokio::test]
    async fn test_membership_lifecycle() {
        let store = test_store();
        let user = test_user("alice");
        let user_id = user.id;
        store.create_user(user).await.unwrap();

        let room = RoomRecord::new("r", RoomType::Private, "sealed", "kid", 1, user_id);
        let room_id = room.id;
        store.create_room(room).await.unwrap();

        let membership = MembershipRecord::new(user_id, room_id, "wrapped", RoomRole::Admin);
        store.add_membership(membership).await.unwrap();

        // Duplicate pair rejected
        let dup = MembershipRecord::new(user_id, room_id, "wrapped2", RoomRole::Member);
        assert!(matches!(
            store.add_membership(dup).await,
            Err(Error::AlreadyExists(_))
        ));

        let mut fetched = store.membership(user_id, room_id).await.unwrap();
        assert_eq!(fetched.role, RoomRole::Admin);

        fetched.wrapped_room_key = "rewrapped".to_string();
        store.update_membership(&fetched).await.unwrap();
        assert_eq!(
            store.membership(user_id, room_id).await.unwrap().wrapped_room_key,
            "rewrapped"
        );

        assert_eq!(store.room_members(room_id).await.unwrap().len(), 1);
        assert_eq!(store.rooms_for_user(user_id).await.unwrap(), vec![room_id]);

        store.remove_membership(user_id, room_id).await.unwrap();
        assert!(store.membership(user_id, room_id).await.is_err());
    }

    #[tokio::test]
    async fn test_message_history() {
        let store = test_store();
        let user = test_user("alice");
        let user_id = user.id;
        store.create_user(user).await.unwrap();
        let room = RoomRecord::new("r", RoomType::Private, "sealed", "kid", 1, user_id);
        let room_id = room.id;
        store.create_room(room).await.unwrap();

        let mut ids = Vec::new();
        for i in 0..4 {
            let mut msg =
                MessageRecord::new(room_id, user_id, format!("ct{}", i), "pk", "h", "text");
            // Spread timestamps so ordering is deterministic
            msg.timestamp = Utc::now() + Duration::milliseconds(i);
            ids.push(msg.id);
            store.append_message(msg).await.unwrap();
        }

        let recent = store.recent_messages(room_id, 3).await.unwrap();
        assert_eq!(recent.len(), 3);
        assert_eq!(recent[0].encrypted_content, "ct1");
        assert_eq!(recent[2].encrypted_content, "ct3");

        // Soft delete drops a message from history
        let mut victim = store.message(ids[2]).await.unwrap();
        victim.soft_delete();
        store.update_message(&victim).await.unwrap();

        let recent = store.recent_messages(room_id, 10).await.unwrap();
        assert_eq!(recent.len(), 3);
        assert!(recent.iter().all(|m| m.id != ids[2]));
    }

    #[tokio::test]
    async fn test_prune_messages() {
        let store = test_store();
        let user = test_user("alice");
        let user_id = user.id;
        store.create_user(user).await.unwrap();
        let room = RoomRecord::new("r", RoomType::Private, "sealed", "kid", 1, user_id);
        let room_id = room.id;
        store.create_room(room).await.unwrap();

        let mut old = MessageRecord::new(room_id, user_id, "old", "pk", "h", "text");
        old.timestamp = Utc::now() - Duration::days(45);
        store.append_message(old).await.unwrap();
        store
            .append_message(MessageRecord::new(room_id, user_id, "new", "pk", "h", "text"))
            .await
            .unwrap();

        let pruned = store
            .prune_messages_before(room_id, Utc::now() - Duration::days(30))
            .await
            .unwrap();
        assert_eq!(pruned, 1);

        let remaining = store.recent_messages(room_id, 10).await.unwrap();
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].encrypted_content, "new");
    }

    #[tokio::test]
    async fn test_receipts_idempotent() {
        let store = test_store();
        let message_id = MessageId::generate();
        let user_id = UserId::generate();

        assert!(store
            .record_receipt(ReadReceiptRecord::new(message_id, user_id))
            .await
            .unwrap());
        assert!(!store
            .record_receipt(ReadReceiptRecord::new(message_id, user_id))
            .await
            .unwrap());

        assert_eq!(
            store.receipts_for_message(message_id).await.unwrap().len(),
            1
        );
    }

    #[tokio::test]
    async fn test_presence_and_audit() {
        let store = test_store();
        let user_id = UserId::generate();

        store
            .upsert_presence(PresenceRecord::new(user_id, PresenceStatus::Busy, None))
            .await
            .unwrap();
        store
            .upsert_presence(PresenceRecord::new(user_id, PresenceStatus::Online, None))
            .await
            .unwrap();

        let presence = store.presence(user_id).await.unwrap().unwrap();
        assert_eq!(presence.status, PresenceStatus::Online);

        store
            .append_audit(AuditRecord::new(
                user_id,
                AuditEvent::Login,
                serde_json::json!({"action": "registration"}),
            ))
            .await
            .unwrap();

        let entries = store.recent_audit(user_id, 5).await.unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].event, AuditEvent::Login);
        assert_eq!(entries[0].details["action"], "registration");
    }

    #[tokio::test]
    async fn test_sessions_roundtrip() {
        let store = test_store();
        let user_id = UserId::generate();

        let session = SessionRecord::new(user_id, "token-abc", Utc::now() + Duration::hours(24));
        store.create_session(session).await.unwrap();

        let mut fetched = store.session_by_token("token-abc").await.unwrap();
        assert!(fetched.is_active);

        fetched.is_active = false;
        store.update_session(&fetched).await.unwrap();
        assert!(!store.session_by_token("token-abc").await.unwrap().is_active);
    }

    #[tokio::test]
    async fn test_persists_to_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("chat.db");

        let user_id = {
            let store = SqliteStore::open(&path).unwrap();
            let user = test_user("alice");
            let id = user.id;
            store.create_user(user).await.unwrap();
            id
        };

        let reopened = SqliteStore::open(&path).unwrap();
        assert_eq!(reopened.user(user_id).await.unwrap().username, "alice");
    }
}
