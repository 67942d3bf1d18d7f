//! Room, message, and presence services for CipherChat.
//!
//! This module provides:
//! - Room lifecycle with per-member room key distribution
//! - Opaque-ciphertext message relay and history
//! - Presence tracking
//! - The typed relay protocol and an in-process broadcast hub
//!
//! # Architecture
//! Services sit between the relay surface and the store. Nothing in this
//! crate can decrypt message content; room keys are only ever handled to
//! wrap them for members, inside the room service.

pub mod hub;
pub mod messages;
pub mod presence;
pub mod protocol;
pub mod rooms;

pub use hub::{ChatHub, PresenceConnection, PresenceHub, RoomConnection};
pub use messages::{MessageService, OutgoingMessage};
pub use presence::PresenceService;
pub use protocol::{ClientFrame, ServerFrame, CLOSE_NOT_A_MEMBER, CLOSE_UNAUTHENTICATED};
pub use rooms::{CreateRoomOpts, RoomService};
