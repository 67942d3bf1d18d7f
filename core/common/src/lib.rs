//! Common types shared across the CipherChat workspace.

pub mod error;
pub mod types;

pub use error::{Error, Result};
pub use types::{MessageId, RoomId, SensitiveBytes, UserId};
