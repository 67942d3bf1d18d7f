//! User presence tracking.

use std::sync::Arc;

use cipherchat_common::{Error, Result, RoomId, UserId};
use cipherchat_store::{ChatStore, PresenceRecord, PresenceStatus};

/// Presence service over the store.
#[derive(Clone)]
pub struct PresenceService {
    store: Arc<dyn ChatStore>,
}

impl PresenceService {
    /// Create a service over a store.
    pub fn new(store: Arc<dyn ChatStore>) -> Self {
        Self { store }
    }

    /// Set a user's status, updating their last-seen time.
    pub async fn set_status(
        &self,
        user_id: UserId,
        status: PresenceStatus,
        current_room: Option<RoomId>,
    ) -> Result<PresenceRecord> {
        let record = PresenceRecord::new(user_id, status, current_room);
        self.store.upsert_presence(record.clone()).await?;
        Ok(record)
    }

    /// A user's presence, if any was ever recorded.
    pub async fn get(&self, user_id: UserId) -> Result<Option<PresenceRecord>> {
        self.store.presence(user_id).await
    }

    /// Validate a client-supplied status update.
    ///
    /// Clients may set online, away, or busy; offline only ever comes
    /// from a disconnect.
    pub fn ensure_client_status(status: PresenceStatus) -> Result<()> {
        match status {
            PresenceStatus::Online | PresenceStatus::Away | PresenceStatus::Busy => Ok(()),
            PresenceStatus::Offline => Err(Error::InvalidInput(
                "Clients cannot set themselves offline".to_string(),
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cipherchat_store::MemoryStore;

    #[tokio::test]
    async fn test_set_and_get_status() {
        let service = PresenceService::new(Arc::new(MemoryStore::new()));
        let user_id = UserId::generate();
        let room_id = RoomId::generate();

        assert!(service.get(user_id).await.unwrap().is_none());

        service
            .set_status(user_id, PresenceStatus::Online, Some(room_id))
            .await
            .unwrap();

        let presence = service.get(user_id).await.unwrap().unwrap();
        assert_eq!(presence.status, PresenceStatus::Online);
        assert_eq!(presence.current_room, Some(room_id));

        service
            .set_status(user_id, PresenceStatus::Offline, None)
            .await
            .unwrap();
        let presence = service.get(user_id).await.unwrap().unwrap();
        assert_eq!(presence.status, PresenceStatus::Offline);
        assert_eq!(presence.current_room, None);
    }

    #[test]
    fn test_client_status_whitelist() {
        assert!(PresenceService::ensure_client_status(PresenceStatus::Online).is_ok());
        assert!(PresenceService::ensure_client_status(PresenceStatus::Away).is_ok());
        assert!(PresenceService::ensure_client_status(PresenceStatus::Busy).is_ok());
        assert!(PresenceService::ensure_client_status(PresenceStatus::Offline).is_err());
    }
}
