use std::{sync::Arc, time::Duration};

use futures::{SinkExt, StreamExt};
use reqwest::Client;
use shared::{
    domain::{ImageAttachment, MessageKind, UserId, UserSummary, ASSISTANT_USER_ID},
    error::ApiError,
    protocol::{
        new_client_ref, ClientRef, ClientRequest, LoginRequest, MarkReadRequest, MessagePayload,
        OutgoingMessage, PageQuery, PresenceChange, RegisterRequest, ServerEvent, UserProfile,
    },
};
use tokio::{
    sync::{broadcast, mpsc, Mutex},
    task::JoinHandle,
};
use tokio_stream::wrappers::UnboundedReceiverStream;
use tokio_tungstenite::{
    connect_async,
    tungstenite::{client::IntoClientRequest, http::HeaderValue, Message},
};
use tracing::{debug, info, warn};

pub mod error;
pub mod pending;
pub mod rest;
pub mod selection;
pub mod state;
pub mod typing;

pub use error::{ClientError, ClientResult};
pub use pending::{SendOutcome, SendTicket, CONFIRMATION_TIMEOUT};
pub use rest::RestClient;
pub use selection::{Conversation, FileSelectionStore, MemorySelectionStore, SelectionStore};
pub use state::{ChatEntry, EntryKey, EntryStatus, TypingUser};
pub use typing::{TypingNotifier, TYPING_IDLE};

use pending::PendingSends;
use state::{ChatState, InboundOutcome, ASSISTANT_UNAVAILABLE_TEXT, THINKING_TEXT};

pub const AUTH_TOKEN_HEADER: &str = "x-auth-token";

#[derive(Debug, Clone)]
pub enum ClientEvent {
    Connected,
    Disconnected,
    MessagesChanged,
    TypingChanged(Vec<TypingUser>),
    PresenceChanged(PresenceChange),
    OnlineUsers(Vec<UserSummary>),
    MessagesRead {
        reader_id: UserId,
        reader_name: String,
    },
    /// A message for a conversation other than the selected one.
    IncomingMessage(MessagePayload),
    SendUnconfirmed {
        client_ref: ClientRef,
    },
    Error(String),
}

/// Maps the REST base url onto the realtime endpoint.
pub fn realtime_url(server_url: &str) -> ClientResult<String> {
    let server_url = server_url.trim_end_matches('/');
    let ws_url = if let Some(rest) = server_url.strip_prefix("https://") {
        format!("wss://{rest}")
    } else if let Some(rest) = server_url.strip_prefix("http://") {
        format!("ws://{rest}")
    } else {
        return Err(ClientError::InvalidServerUrl(server_url.to_string()));
    };
    Ok(format!("{ws_url}/ws"))
}

struct ClientState {
    rest: Option<RestClient>,
    me: Option<UserSummary>,
    selection: Option<Conversation>,
    chat: ChatState,
    pending: PendingSends,
    outbound: Option<mpsc::UnboundedSender<ClientRequest>>,
    typing: Option<TypingNotifier>,
    generation: u64,
    tasks: Vec<JoinHandle<()>>,
}

impl ClientState {
    fn partner(&self) -> Option<UserSummary> {
        match &self.selection {
            Some(Conversation::Direct { partner }) => Some(partner.clone()),
            _ => None,
        }
    }
}

/// Client-side chat state machine: optimistic sends reconciled against
/// server confirmations, inbound deduplication, typing and presence.
pub struct ChatClient {
    http: Client,
    selection_store: Arc<dyn SelectionStore>,
    confirm_timeout: Duration,
    typing_idle: Duration,
    inner: Mutex<ClientState>,
    events: broadcast::Sender<ClientEvent>,
}

impl ChatClient {
    pub fn new(selection_store: Arc<dyn SelectionStore>) -> Arc<Self> {
        Self::with_timeouts(selection_store, CONFIRMATION_TIMEOUT, TYPING_IDLE)
    }

    pub fn with_timeouts(
        selection_store: Arc<dyn SelectionStore>,
        confirm_timeout: Duration,
        typing_idle: Duration,
    ) -> Arc<Self> {
        let (events, _) = broadcast::channel(1024);
        Arc::new(Self {
            http: Client::new(),
            selection_store,
            confirm_timeout,
            typing_idle,
            inner: Mutex::new(ClientState {
                rest: None,
                me: None,
                selection: None,
                chat: ChatState::default(),
                pending: PendingSends::default(),
                outbound: None,
                typing: None,
                generation: 0,
                tasks: Vec::new(),
            }),
            events,
        })
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<ClientEvent> {
        self.events.subscribe()
    }

    fn emit(&self, event: ClientEvent) {
        let _ = self.events.send(event);
    }

    pub async fn register(
        self: &Arc<Self>,
        server_url: &str,
        username: &str,
        email: &str,
        password: &str,
    ) -> ClientResult<UserProfile> {
        let mut rest = RestClient::new(self.http.clone(), server_url)?;
        let profile = rest
            .register(&RegisterRequest {
                username: username.to_string(),
                email: email.to_string(),
                password: password.to_string(),
            })
            .await?;
        self.start_session(rest, &profile).await?;
        Ok(profile)
    }

    pub async fn login(
        self: &Arc<Self>,
        server_url: &str,
        email: &str,
        password: &str,
    ) -> ClientResult<UserProfile> {
        let mut rest = RestClient::new(self.http.clone(), server_url)?;
        let profile = rest
            .login(&LoginRequest {
                email: email.to_string(),
                password: password.to_string(),
            })
            .await?;
        self.start_session(rest, &profile).await?;
        Ok(profile)
    }

    /// Resumes with a token obtained elsewhere.
    pub async fn login_with_token(
        self: &Arc<Self>,
        server_url: &str,
        token: &str,
    ) -> ClientResult<UserProfile> {
        let mut rest = RestClient::new(self.http.clone(), server_url)?;
        rest.set_token(token);
        let profile = rest.me().await?;
        self.start_session(rest, &profile).await?;
        Ok(profile)
    }

    async fn start_session(self: &Arc<Self>, rest: RestClient, profile: &UserProfile) -> ClientResult<()> {
        {
            let mut guard = self.inner.lock().await;
            guard.rest = Some(rest);
            guard.me = Some(profile.summary());
            guard.chat.clear();
            guard.pending.clear();
        }
        info!(user_id = %profile.id, username = %profile.username, "logged in");
        self.connect_realtime().await
    }

    /// Opens the realtime channel with the session token in the handshake.
    pub async fn connect_realtime(self: &Arc<Self>) -> ClientResult<()> {
        let (server_url, token) = {
            let guard = self.inner.lock().await;
            let rest = guard.rest.as_ref().ok_or(ClientError::NotLoggedIn)?;
            let token = rest.token().ok_or(ClientError::NotLoggedIn)?.to_string();
            (rest.base_url().to_string(), token)
        };

        let ws_url = realtime_url(&server_url)?;
        let mut request = ws_url.as_str().into_client_request()?;
        request.headers_mut().insert(
            AUTH_TOKEN_HEADER,
            HeaderValue::from_str(&token).map_err(tokio_tungstenite::tungstenite::Error::from)?,
        );
        let (ws_stream, _) = connect_async(request).await?;
        let (mut ws_writer, mut ws_reader) = ws_stream.split();
        let (outbound, outbound_rx) = mpsc::unbounded_channel::<ClientRequest>();

        let writer = tokio::spawn(async move {
            let mut requests = UnboundedReceiverStream::new(outbound_rx);
            while let Some(request) = requests.next().await {
                let text = match serde_json::to_string(&request) {
                    Ok(text) => text,
                    Err(err) => {
                        warn!(error = %err, "failed to encode realtime request");
                        continue;
                    }
                };
                if ws_writer.send(Message::Text(text)).await.is_err() {
                    break;
                }
            }
            let _ = ws_writer.close().await;
        });

        let generation = {
            let mut guard = self.inner.lock().await;
            guard.generation += 1;
            for task in guard.tasks.drain(..) {
                task.abort();
            }
            guard.typing = Some(TypingNotifier::with_idle(outbound.clone(), self.typing_idle));
            guard.outbound = Some(outbound);
            guard.generation
        };

        let client = Arc::clone(self);
        let reader = tokio::spawn(async move {
            while let Some(frame) = ws_reader.next().await {
                match frame {
                    Ok(Message::Text(text)) => match serde_json::from_str::<ServerEvent>(&text) {
                        Ok(event) => client.handle_server_event(event).await,
                        Err(err) => {
                            client.emit(ClientEvent::Error(format!("invalid server event: {err}")))
                        }
                    },
                    Ok(Message::Close(_)) => break,
                    Ok(_) => {}
                    Err(err) => {
                        client.emit(ClientEvent::Error(format!("websocket receive failed: {err}")));
                        break;
                    }
                }
            }
            client.realtime_closed(generation).await;
        });

        self.inner.lock().await.tasks.extend([writer, reader]);
        info!(%ws_url, "realtime channel connected");
        self.emit(ClientEvent::Connected);
        Ok(())
    }

    async fn realtime_closed(&self, generation: u64) {
        let mut guard = self.inner.lock().await;
        if guard.generation != generation {
            return;
        }
        guard.outbound = None;
        guard.typing = None;
        drop(guard);
        info!("realtime channel closed");
        self.emit(ClientEvent::Disconnected);
    }

    pub async fn is_connected(&self) -> bool {
        self.inner
            .lock()
            .await
            .outbound
            .as_ref()
            .is_some_and(|outbound| !outbound.is_closed())
    }

    pub async fn me(&self) -> Option<UserSummary> {
        self.inner.lock().await.me.clone()
    }

    pub async fn rest(&self) -> ClientResult<RestClient> {
        self.inner
            .lock()
            .await
            .rest
            .clone()
            .ok_or(ClientError::NotLoggedIn)
    }

    pub async fn selection(&self) -> Option<Conversation> {
        self.inner.lock().await.selection.clone()
    }

    pub async fn messages(&self) -> Vec<ChatEntry> {
        self.inner.lock().await.chat.messages().to_vec()
    }

    pub async fn typing_users(&self) -> Vec<TypingUser> {
        self.inner.lock().await.chat.typing_users().to_vec()
    }

    pub async fn online_users(&self) -> Vec<UserSummary> {
        self.inner.lock().await.chat.online_users().to_vec()
    }

    pub async fn pending_count(&self) -> usize {
        self.inner.lock().await.pending.len()
    }

    async fn handle_server_event(&self, event: ServerEvent) {
        match event {
            ServerEvent::MessageSent {
                message,
                client_ref,
                ..
            } => {
                let mut guard = self.inner.lock().await;
                let in_view = guard
                    .partner()
                    .is_some_and(|partner| partner.id == message.receiver_id);
                let changed = match client_ref {
                    Some(client_ref) => {
                        if guard.pending.contains(&client_ref) {
                            guard.chat.confirm(&client_ref, &message, in_view);
                            guard
                                .pending
                                .resolve(&client_ref, SendOutcome::Confirmed(message));
                            true
                        } else {
                            debug!(%client_ref, "confirmation arrived after the wait expired");
                            false
                        }
                    }
                    None => guard.chat.confirm_by_content(&message, in_view),
                };
                drop(guard);
                if changed {
                    self.emit(ClientEvent::MessagesChanged);
                }
            }
            ServerEvent::NewMessage {
                message,
                from,
                client_ref,
            } => {
                let mut guard = self.inner.lock().await;
                if guard.me.as_ref().is_some_and(|me| me.id == message.sender.id) {
                    return;
                }
                let selected = guard.partner().is_some_and(|partner| partner.id == from.id);
                if !selected {
                    drop(guard);
                    self.emit(ClientEvent::IncomingMessage(message));
                    return;
                }
                let outcome = guard.chat.accept_inbound(&message, client_ref.as_deref());
                guard.chat.apply_typing(from.id, &from.username, false);
                drop(guard);
                if outcome != InboundOutcome::Duplicate {
                    self.emit(ClientEvent::MessagesChanged);
                }
            }
            ServerEvent::UserTyping {
                sender_id,
                sender_name,
                is_typing,
            } => {
                let typing = {
                    let mut guard = self.inner.lock().await;
                    guard.chat.apply_typing(sender_id, &sender_name, is_typing);
                    guard.chat.typing_users().to_vec()
                };
                self.emit(ClientEvent::TypingChanged(typing));
            }
            ServerEvent::MessagesRead {
                reader_id,
                reader_name,
            } => {
                self.inner.lock().await.chat.mark_read_by(reader_id);
                self.emit(ClientEvent::MessagesRead {
                    reader_id,
                    reader_name,
                });
            }
            ServerEvent::UserOnline(change) | ServerEvent::UserOffline(change) => {
                self.inner.lock().await.chat.apply_presence(&change);
                self.emit(ClientEvent::PresenceChanged(change));
            }
            ServerEvent::OnlineUsers(users) => {
                self.inner
                    .lock()
                    .await
                    .chat
                    .set_online_users(users.clone());
                self.emit(ClientEvent::OnlineUsers(users));
            }
            ServerEvent::Error { error, client_ref } => {
                if let Some(client_ref) = client_ref {
                    let rejected = {
                        let mut guard = self.inner.lock().await;
                        let rejected = guard
                            .pending
                            .resolve(&client_ref, SendOutcome::Rejected(error.clone()));
                        if rejected {
                            guard.chat.mark_unconfirmed(&client_ref);
                        }
                        rejected
                    };
                    if rejected {
                        self.emit(ClientEvent::SendUnconfirmed { client_ref });
                        self.emit(ClientEvent::MessagesChanged);
                    }
                }
                warn!(code = ?error.code, error = %error.message, "server reported an error");
                self.emit(ClientEvent::Error(error.message));
            }
        }
    }

    /// Selects a conversation, persists the choice and replaces the visible
    /// list with its history.
    pub async fn select_conversation(&self, conversation: Conversation) -> ClientResult<()> {
        self.selection_store.save(Some(&conversation))?;
        {
            let mut guard = self.inner.lock().await;
            if let Some(typing) = guard.typing.as_mut() {
                typing.stop();
            }
            guard.selection = Some(conversation.clone());
        }
        self.load_history(&conversation).await
    }

    /// Reloads the persisted selection, if any, with its history.
    pub async fn restore_selection(&self) -> ClientResult<Option<Conversation>> {
        let Some(conversation) = self.selection_store.load()? else {
            return Ok(None);
        };
        self.inner.lock().await.selection = Some(conversation.clone());
        self.load_history(&conversation).await?;
        Ok(Some(conversation))
    }

    pub async fn load_history(&self, conversation: &Conversation) -> ClientResult<()> {
        let rest = self.rest().await?;
        let entries = match conversation {
            Conversation::Direct { partner } => {
                let page = rest.conversation(partner.id, PageQuery::default()).await?;
                page.messages
                    .iter()
                    .map(|message| ChatEntry::confirmed(message, None))
                    .collect::<Vec<_>>()
            }
            Conversation::Assistant => rest
                .assistant_conversation()
                .await?
                .messages
                .iter()
                .map(ChatEntry::assistant)
                .collect(),
        };

        let mut guard = self.inner.lock().await;
        if guard.selection.as_ref() != Some(conversation) {
            debug!("selection changed while history was loading; discarding");
            return Ok(());
        }
        let count = entries.len();
        guard.chat.replace_entries(entries);
        drop(guard);
        debug!(conversation = conversation.title(), count, "history loaded");
        self.emit(ClientEvent::MessagesChanged);
        Ok(())
    }

    /// Optimistically appends the message and submits it over the realtime
    /// channel. Returns `None` without a selected direct conversation or an
    /// open channel.
    pub async fn send_message(
        self: &Arc<Self>,
        content: &str,
        kind: MessageKind,
        image: Option<ImageAttachment>,
    ) -> ClientResult<Option<SendTicket>> {
        let client_ref = new_client_ref();
        let ticket = {
            let mut guard = self.inner.lock().await;
            let (Some(partner), Some(me), Some(outbound)) =
                (guard.partner(), guard.me.clone(), guard.outbound.clone())
            else {
                return Ok(None);
            };

            let mut outgoing = OutgoingMessage::text(partner.id, content)
                .with_client_ref(client_ref.clone());
            outgoing.message_type = kind;
            if let Some(image) = image {
                outgoing.image_url = Some(image.url);
                outgoing.image_public_id = Some(image.public_id);
                outgoing.image_width = Some(image.width);
                outgoing.image_height = Some(image.height);
            }

            guard
                .chat
                .push(ChatEntry::optimistic(&me, &outgoing, &client_ref));
            let outcome = guard.pending.register(client_ref.clone());
            if let Some(typing) = guard.typing.as_mut() {
                typing.stop();
            }

            if outbound.send(ClientRequest::SendMessage(outgoing)).is_err() {
                guard.pending.resolve(
                    &client_ref,
                    SendOutcome::Rejected(ApiError::internal("realtime channel closed")),
                );
                guard.chat.mark_unconfirmed(&client_ref);
                drop(guard);
                self.emit(ClientEvent::SendUnconfirmed {
                    client_ref: client_ref.clone(),
                });
                self.emit(ClientEvent::MessagesChanged);
                return Ok(Some(SendTicket { client_ref, outcome }));
            }
            SendTicket {
                client_ref: client_ref.clone(),
                outcome,
            }
        };
        self.emit(ClientEvent::MessagesChanged);
        self.spawn_confirmation_timeout(client_ref);
        Ok(Some(ticket))
    }

    fn spawn_confirmation_timeout(self: &Arc<Self>, client_ref: ClientRef) {
        let client = Arc::clone(self);
        let wait = self.confirm_timeout;
        tokio::spawn(async move {
            tokio::time::sleep(wait).await;
            let expired = {
                let mut guard = client.inner.lock().await;
                let expired = guard.pending.resolve(&client_ref, SendOutcome::TimedOut);
                if expired {
                    guard.chat.mark_unconfirmed(&client_ref);
                }
                expired
            };
            if expired {
                warn!(%client_ref, "no confirmation before timeout; message left unconfirmed");
                client.emit(ClientEvent::SendUnconfirmed { client_ref });
                client.emit(ClientEvent::MessagesChanged);
            }
        });
    }

    /// Feeds the composer contents to the typing notifier.
    pub async fn input_changed(&self, input: &str) {
        let mut guard = self.inner.lock().await;
        let Some(partner) = guard.partner() else {
            return;
        };
        if let Some(typing) = guard.typing.as_mut() {
            typing.input_changed(partner.id, input);
        }
    }

    /// Marks the selected conversation read, over the realtime channel when
    /// it is open and over REST otherwise.
    pub async fn mark_conversation_read(&self) -> ClientResult<()> {
        let (partner, outbound, rest) = {
            let guard = self.inner.lock().await;
            let Some(partner) = guard.partner() else {
                return Ok(());
            };
            (partner, guard.outbound.clone(), guard.rest.clone())
        };

        let sent = outbound.is_some_and(|outbound| {
            outbound
                .send(ClientRequest::MarkMessagesRead {
                    sender_id: partner.id,
                })
                .is_ok()
        });
        if !sent {
            let rest = rest.ok_or(ClientError::NotLoggedIn)?;
            rest.mark_read(&MarkReadRequest {
                message_ids: None,
                sender_id: Some(partner.id),
            })
            .await?;
        }

        let changed = self.inner.lock().await.chat.mark_read_from(partner.id);
        if changed > 0 {
            self.emit(ClientEvent::MessagesChanged);
        }
        Ok(())
    }

    pub async fn request_online_users(&self) -> ClientResult<()> {
        self.send_request(ClientRequest::GetOnlineUsers).await
    }

    async fn send_request(&self, request: ClientRequest) -> ClientResult<()> {
        let guard = self.inner.lock().await;
        let outbound = guard.outbound.as_ref().ok_or(ClientError::NotConnected)?;
        outbound.send(request).map_err(|_| ClientError::NotConnected)
    }

    /// One assistant turn. The prompt and a placeholder appear immediately;
    /// the placeholder is replaced by the reply or a fixed apology.
    pub async fn send_assistant_message(&self, prompt: &str) -> ClientResult<()> {
        let (rest, me) = {
            let mut guard = self.inner.lock().await;
            if guard.selection != Some(Conversation::Assistant) {
                return Ok(());
            }
            let rest = guard.rest.clone().ok_or(ClientError::NotLoggedIn)?;
            let me = guard.me.clone().ok_or(ClientError::NotLoggedIn)?;
            let stamp = chrono::Utc::now().timestamp_millis();
            guard.chat.push(ChatEntry::local(
                format!("local-user-{stamp}"),
                me.clone(),
                ASSISTANT_USER_ID,
                prompt,
                EntryStatus::Confirmed,
            ));
            guard.chat.push(ChatEntry::local(
                format!("local-thinking-{stamp}"),
                UserSummary::assistant(),
                me.id,
                THINKING_TEXT,
                EntryStatus::Thinking,
            ));
            (rest, me)
        };
        self.emit(ClientEvent::MessagesChanged);

        let reply = rest.assistant(prompt).await;
        let mut guard = self.inner.lock().await;
        guard.chat.remove_thinking();
        let failure = match reply {
            Ok(reply) => {
                if reply.is_fallback {
                    debug!("assistant answered with a fallback reply");
                }
                guard.chat.push(ChatEntry::assistant(&reply));
                None
            }
            Err(err) => {
                guard.chat.push(ChatEntry::local(
                    format!("local-error-{}", chrono::Utc::now().timestamp_millis()),
                    UserSummary::assistant(),
                    me.id,
                    ASSISTANT_UNAVAILABLE_TEXT,
                    EntryStatus::Failed,
                ));
                Some(err)
            }
        };
        drop(guard);
        self.emit(ClientEvent::MessagesChanged);
        if let Some(err) = failure {
            warn!(error = %err, "assistant request failed");
            self.emit(ClientEvent::Error(err.to_string()));
        }
        Ok(())
    }

    /// Announces the logout, closes the channel and forgets the session.
    pub async fn logout(&self) -> ClientResult<()> {
        let rest = {
            let mut guard = self.inner.lock().await;
            if let Some(outbound) = guard.outbound.take() {
                let _ = outbound.send(ClientRequest::UserLogout);
            }
            guard.typing = None;
            guard.generation += 1;
            guard.tasks.clear();
            guard.pending.clear();
            guard.chat.clear();
            guard.selection = None;
            guard.me = None;
            guard.rest.take()
        };
        if let Some(rest) = rest {
            if let Err(err) = rest.logout().await {
                warn!(error = %err, "logout acknowledgement failed");
            }
        }
        info!("logged out");
        self.emit(ClientEvent::Disconnected);
        Ok(())
    }
}

#[cfg(test)]
#[path = "tests/lib_tests.rs"]
mod tests;
