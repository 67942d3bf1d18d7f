//! Persistence layer for CipherChat.
//!
//! This module provides a trait-based interface over chat storage
//! backends and a registry for dynamic backend resolution.
//!
//! # Design Principles
//! - Backend isolation: no storage-specific logic in the services
//! - The store only ever sees sealed or wrapped key material and opaque
//!   ciphertext; nothing here can decrypt anything
//! - Async operations throughout
//! - Unified error semantics across backends

pub mod memory;
pub mod records;
pub mod registry;
pub mod sqlite;
pub mod store;

pub use memory::MemoryStore;
pub use records::{
    AuditEvent, AuditRecord, MembershipRecord, MessageRecord, PresenceRecord, PresenceStatus,
    ReadReceiptRecord, RoomRecord, RoomRole, RoomType, SessionRecord, UserRecord,
};
pub use registry::{create_default_registry, StoreFactory, StoreRegistry};
pub use sqlite::SqliteStore;
pub use store::ChatStore;
