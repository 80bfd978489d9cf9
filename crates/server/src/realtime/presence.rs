use std::collections::HashMap;

use shared::domain::UserId;
use tokio::sync::RwLock;

use super::ConnectionId;

/// Process-local map of online users to their current connection.
///
/// A second connect for the same user overwrites the entry; there is no
/// multi-device fan-out. Nothing here survives a restart, and a multi-process
/// deployment needs a shared registry behind the same methods.
#[derive(Debug, Default)]
pub struct PresenceRegistry {
    entries: RwLock<HashMap<UserId, ConnectionId>>,
}

impl PresenceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records `connection` as the user's current connection and returns the
    /// one it replaced, if any.
    pub async fn set(&self, user_id: UserId, connection: ConnectionId) -> Option<ConnectionId> {
        self.entries.write().await.insert(user_id, connection)
    }

    pub async fn get(&self, user_id: UserId) -> Option<ConnectionId> {
        self.entries.read().await.get(&user_id).copied()
    }

    pub async fn is_present(&self, user_id: UserId) -> bool {
        self.entries.read().await.contains_key(&user_id)
    }

    pub async fn remove(&self, user_id: UserId) -> Option<ConnectionId> {
        self.entries.write().await.remove(&user_id)
    }

    /// Removes the entry only while it still points at `connection`.
    pub async fn remove_if_current(&self, user_id: UserId, connection: ConnectionId) -> bool {
        let mut entries = self.entries.write().await;
        if entries.get(&user_id) == Some(&connection) {
            entries.remove(&user_id);
            true
        } else {
            false
        }
    }

    pub async fn list_user_ids(&self) -> Vec<UserId> {
        let mut ids: Vec<UserId> = self.entries.read().await.keys().copied().collect();
        ids.sort();
        ids
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }
}

#[cfg(test)]
#[path = "tests/presence_tests.rs"]
mod tests;
