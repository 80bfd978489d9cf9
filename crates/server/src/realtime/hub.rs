use std::collections::HashMap;

use shared::{domain::UserId, protocol::ServerEvent};
use tokio::sync::{mpsc, RwLock};

use super::ConnectionId;

pub type Outbox = mpsc::UnboundedSender<ServerEvent>;

struct ConnectionHandle {
    user_id: UserId,
    outbox: Outbox,
}

/// Live connections and the per-user private channels they belong to.
#[derive(Default)]
pub struct ConnectionHub {
    connections: RwLock<HashMap<ConnectionId, ConnectionHandle>>,
}

impl ConnectionHub {
    pub async fn register(&self, connection: ConnectionId, user_id: UserId, outbox: Outbox) {
        self.connections
            .write()
            .await
            .insert(connection, ConnectionHandle { user_id, outbox });
    }

    pub async fn unregister(&self, connection: ConnectionId) -> bool {
        self.connections.write().await.remove(&connection).is_some()
    }

    pub async fn emit_to_connection(&self, connection: ConnectionId, event: ServerEvent) -> bool {
        match self.connections.read().await.get(&connection) {
            Some(handle) => handle.outbox.send(event).is_ok(),
            None => false,
        }
    }

    /// Sends to every connection in the user's private channel.
    pub async fn emit_to_user(&self, user_id: UserId, event: ServerEvent) -> usize {
        self.fan_out(|handle_user, _| handle_user == user_id, event)
            .await
    }

    pub async fn emit_to_user_except(
        &self,
        user_id: UserId,
        except: ConnectionId,
        event: ServerEvent,
    ) -> usize {
        self.fan_out(
            |handle_user, connection| handle_user == user_id && connection != except,
            event,
        )
        .await
    }

    pub async fn broadcast_except(&self, except: ConnectionId, event: ServerEvent) -> usize {
        self.fan_out(|_, connection| connection != except, event)
            .await
    }

    pub async fn connection_count(&self) -> usize {
        self.connections.read().await.len()
    }

    async fn fan_out<F>(&self, mut include: F, event: ServerEvent) -> usize
    where
        F: FnMut(UserId, ConnectionId) -> bool,
    {
        let connections = self.connections.read().await;
        connections
            .iter()
            .filter(|(connection, handle)| include(handle.user_id, **connection))
            .filter(|(_, handle)| handle.outbox.send(event.clone()).is_ok())
            .count()
    }
}
