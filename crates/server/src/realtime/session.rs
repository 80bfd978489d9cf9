use std::{collections::HashMap, sync::Arc};

use chrono::Utc;
use server_api::{mark_read_from, online_users, send_direct_message, ApiContext};
use shared::{
    domain::{UserId, UserSummary},
    error::ApiError,
    protocol::{ClientRef, ClientRequest, OutgoingMessage, PresenceChange, ServerEvent},
};
use storage::StoredUser;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::{
    hub::{ConnectionHub, Outbox},
    presence::PresenceRegistry,
    ConnectionId,
};

/// Lifecycle of one realtime connection once the handshake has been
/// verified. Connections that fail verification never get a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Authenticated,
    Joined,
    Disconnected,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionFlow {
    Continue,
    Close,
}

#[derive(Debug)]
pub struct Session {
    pub connection_id: ConnectionId,
    pub user: UserSummary,
    pub state: SessionState,
}

impl Session {
    pub fn authenticated(user: &StoredUser) -> Self {
        Self {
            connection_id: Uuid::new_v4(),
            user: user.summary(),
            state: SessionState::Authenticated,
        }
    }

    pub fn user_id(&self) -> UserId {
        self.user.id
    }
}

pub struct Realtime {
    api: ApiContext,
    presence: Arc<PresenceRegistry>,
    hub: ConnectionHub,
    /// Serialises each user's online/offline transitions so the registry,
    /// the stored flag and the broadcast presence always agree.
    transitions: Mutex<HashMap<UserId, Arc<Mutex<()>>>>,
}

impl Realtime {
    pub fn new(api: ApiContext, presence: Arc<PresenceRegistry>) -> Self {
        Self {
            api,
            presence,
            hub: ConnectionHub::default(),
            transitions: Mutex::new(HashMap::new()),
        }
    }

    async fn transition_lock(&self, user_id: UserId) -> Arc<Mutex<()>> {
        Arc::clone(self.transitions.lock().await.entry(user_id).or_default())
    }

    pub fn presence(&self) -> &PresenceRegistry {
        &self.presence
    }

    pub async fn connection_count(&self) -> usize {
        self.hub.connection_count().await
    }

    /// Registers the connection in its user's private channel, records
    /// presence and announces the user to everyone else.
    pub async fn join(&self, session: &mut Session, outbox: Outbox) {
        if session.state != SessionState::Authenticated {
            return;
        }
        let user_id = session.user_id();
        let connection = session.connection_id;

        self.hub.register(connection, user_id, outbox).await;
        let lock = self.transition_lock(user_id).await;
        let _transition = lock.lock().await;
        if let Some(previous) = self.presence.set(user_id, connection).await {
            if previous != connection {
                info!(user_id = %user_id, %previous, %connection, "newer connection supersedes previous one");
            }
        }

        let now = Utc::now();
        if let Err(error) = self.api.storage.set_presence(user_id, true, now).await {
            warn!(user_id = %user_id, %error, "failed to persist online flag");
        }
        session.user.is_online = true;
        session.user.last_seen = Some(now);
        session.state = SessionState::Joined;

        self.hub
            .broadcast_except(
                connection,
                ServerEvent::UserOnline(PresenceChange {
                    user_id,
                    username: session.user.username.clone(),
                    is_online: true,
                    last_seen: Some(now),
                }),
            )
            .await;
        info!(user_id = %user_id, %connection, username = %session.user.username, "user joined");
    }

    /// Handles one inbound event. Failures are reported to the originating
    /// connection and never end the session.
    pub async fn handle(&self, session: &mut Session, request: ClientRequest) -> SessionFlow {
        if session.state != SessionState::Joined {
            return SessionFlow::Close;
        }

        match request {
            ClientRequest::JoinUser(user_id) => {
                if user_id != session.user_id() {
                    self.emit_error(
                        session,
                        ApiError::forbidden("cannot join another user's channel"),
                        None,
                    )
                    .await;
                }
            }
            ClientRequest::SendMessage(outgoing) => self.send_message(session, outgoing).await,
            ClientRequest::TypingStart { receiver_id } => {
                self.relay_typing(session, receiver_id, true).await
            }
            ClientRequest::TypingStop { receiver_id } => {
                self.relay_typing(session, receiver_id, false).await
            }
            ClientRequest::MarkMessagesRead { sender_id } => {
                self.mark_read(session, sender_id).await
            }
            ClientRequest::GetOnlineUsers => self.send_online_users(session).await,
            ClientRequest::UserLogout => {
                info!(user_id = %session.user_id(), "user logged out");
                self.leave(session).await;
                return SessionFlow::Close;
            }
        }
        SessionFlow::Continue
    }

    /// Tears the session down. Safe to call more than once; a connection
    /// that has been superseded leaves the newer connection's presence alone.
    pub async fn leave(&self, session: &mut Session) {
        if session.state == SessionState::Disconnected {
            return;
        }
        let was_joined = session.state == SessionState::Joined;
        session.state = SessionState::Disconnected;

        let user_id = session.user_id();
        let connection = session.connection_id;
        self.hub.unregister(connection).await;
        if !was_joined {
            return;
        }

        let lock = self.transition_lock(user_id).await;
        let _transition = lock.lock().await;
        if !self.presence.remove_if_current(user_id, connection).await {
            debug!(user_id = %user_id, %connection, "superseded connection closed; presence kept");
            return;
        }

        let now = Utc::now();
        if let Err(error) = self.api.storage.set_presence(user_id, false, now).await {
            warn!(user_id = %user_id, %error, "failed to persist offline flag");
        }
        session.user.is_online = false;
        session.user.last_seen = Some(now);

        self.hub
            .broadcast_except(
                connection,
                ServerEvent::UserOffline(PresenceChange {
                    user_id,
                    username: session.user.username.clone(),
                    is_online: false,
                    last_seen: Some(now),
                }),
            )
            .await;
        info!(user_id = %user_id, %connection, "user disconnected");
    }

    pub async fn emit_error(&self, session: &Session, error: ApiError, client_ref: Option<ClientRef>) {
        self.hub
            .emit_to_connection(session.connection_id, ServerEvent::Error { error, client_ref })
            .await;
    }

    async fn send_message(&self, session: &Session, outgoing: OutgoingMessage) {
        let sender_id = session.user_id();
        let receiver_id = outgoing.receiver_id;
        let client_ref = outgoing.client_ref.clone();

        let message = match send_direct_message(&self.api, sender_id, &outgoing).await {
            Ok(message) => message,
            Err(error) => {
                warn!(sender_id = %sender_id, receiver_id = %receiver_id, code = ?error.code, error = %error.message, "send rejected");
                self.emit_error(session, error, client_ref).await;
                return;
            }
        };

        self.hub
            .emit_to_connection(
                session.connection_id,
                ServerEvent::MessageSent {
                    success: true,
                    message: message.clone(),
                    client_ref: client_ref.clone(),
                },
            )
            .await;

        if self.presence.is_present(receiver_id).await {
            let from = message.sender.clone();
            let delivered = self
                .hub
                .emit_to_user(
                    receiver_id,
                    ServerEvent::NewMessage {
                        message,
                        from,
                        client_ref,
                    },
                )
                .await;
            debug!(sender_id = %sender_id, receiver_id = %receiver_id, delivered, "message delivered");
        } else {
            debug!(sender_id = %sender_id, receiver_id = %receiver_id, "receiver offline; message left for history fetch");
        }
    }

    async fn relay_typing(&self, session: &Session, receiver_id: UserId, is_typing: bool) {
        self.hub
            .emit_to_user_except(
                receiver_id,
                session.connection_id,
                ServerEvent::UserTyping {
                    sender_id: session.user_id(),
                    sender_name: session.user.username.clone(),
                    is_typing,
                },
            )
            .await;
    }

    async fn mark_read(&self, session: &Session, sender_id: UserId) {
        let reader_id = session.user_id();
        match mark_read_from(&self.api, reader_id, sender_id).await {
            Ok(updated) => {
                debug!(reader_id = %reader_id, sender_id = %sender_id, updated, "messages marked read");
                if self.presence.is_present(sender_id).await {
                    self.hub
                        .emit_to_user(
                            sender_id,
                            ServerEvent::MessagesRead {
                                reader_id,
                                reader_name: session.user.username.clone(),
                            },
                        )
                        .await;
                }
            }
            Err(error) => {
                warn!(reader_id = %reader_id, sender_id = %sender_id, error = %error.message, "mark read failed");
                self.emit_error(session, error, None).await;
            }
        }
    }

    async fn send_online_users(&self, session: &Session) {
        let present = self.presence.list_user_ids().await;
        match online_users(&self.api, &present).await {
            Ok(users) => {
                self.hub
                    .emit_to_connection(session.connection_id, ServerEvent::OnlineUsers(users))
                    .await;
            }
            Err(error) => self.emit_error(session, error, None).await,
        }
    }
}

#[cfg(test)]
#[path = "tests/session_tests.rs"]
mod tests;
