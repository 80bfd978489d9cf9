//! Visible conversation state: the message list with its optimistic
//! entries, who is typing and who is online.

use chrono::{DateTime, Utc};
use shared::{
    domain::{ImageAttachment, MessageId, MessageKind, UserId, UserSummary},
    protocol::{AssistantMessage, ClientRef, MessagePayload, OutgoingMessage, PresenceChange},
};

pub const THINKING_TEXT: &str = "Thinking...";
pub const ASSISTANT_UNAVAILABLE_TEXT: &str =
    "Sorry, I'm having trouble responding right now. Please try again!";

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum EntryKey {
    Local(String),
    Server(MessageId),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryStatus {
    /// Shown before the server has confirmed it.
    Optimistic,
    Confirmed,
    /// No confirmation arrived in time, or the server refused it.
    Unconfirmed,
    /// Placeholder while an assistant reply is in flight.
    Thinking,
    /// Local stand-in after a failed assistant request.
    Failed,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ChatEntry {
    pub key: EntryKey,
    pub client_ref: Option<ClientRef>,
    pub sender: UserSummary,
    pub receiver_id: UserId,
    pub content: String,
    pub message_type: MessageKind,
    pub image: Option<ImageAttachment>,
    pub read: bool,
    pub created_at: DateTime<Utc>,
    pub status: EntryStatus,
}

impl ChatEntry {
    pub fn confirmed(message: &MessagePayload, client_ref: Option<ClientRef>) -> Self {
        Self {
            key: EntryKey::Server(message.id),
            client_ref,
            sender: message.sender.clone(),
            receiver_id: message.receiver_id,
            content: message.content.clone(),
            message_type: message.message_type,
            image: message.image.clone(),
            read: message.read,
            created_at: message.created_at,
            status: EntryStatus::Confirmed,
        }
    }

    pub fn optimistic(me: &UserSummary, outgoing: &OutgoingMessage, client_ref: &ClientRef) -> Self {
        Self {
            key: EntryKey::Local(format!("optimistic-{client_ref}")),
            client_ref: Some(client_ref.clone()),
            sender: me.clone(),
            receiver_id: outgoing.receiver_id,
            content: outgoing.content.clone(),
            message_type: outgoing.message_type,
            image: outgoing.image(),
            read: false,
            created_at: Utc::now(),
            status: EntryStatus::Optimistic,
        }
    }

    pub fn assistant(reply: &AssistantMessage) -> Self {
        Self {
            key: EntryKey::Local(reply.id.clone()),
            client_ref: None,
            sender: reply.sender.clone(),
            receiver_id: reply.receiver_id,
            content: reply.content.clone(),
            message_type: MessageKind::Text,
            image: None,
            read: true,
            created_at: reply.created_at,
            status: EntryStatus::Confirmed,
        }
    }

    /// Local-only entry in the assistant conversation.
    pub fn local(
        key: String,
        sender: UserSummary,
        receiver_id: UserId,
        content: impl Into<String>,
        status: EntryStatus,
    ) -> Self {
        Self {
            key: EntryKey::Local(key),
            client_ref: None,
            sender,
            receiver_id,
            content: content.into(),
            message_type: MessageKind::Text,
            image: None,
            read: true,
            created_at: Utc::now(),
            status,
        }
    }

    pub fn server_id(&self) -> Option<MessageId> {
        match self.key {
            EntryKey::Server(id) => Some(id),
            EntryKey::Local(_) => None,
        }
    }

    pub fn is_pending(&self) -> bool {
        self.status == EntryStatus::Optimistic
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TypingUser {
    pub user_id: UserId,
    pub username: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InboundOutcome {
    Appended,
    /// Swapped in for the optimistic entry with the same correlation id.
    Reconciled,
    Duplicate,
}

#[derive(Debug, Default)]
pub struct ChatState {
    messages: Vec<ChatEntry>,
    typing: Vec<TypingUser>,
    online: Vec<UserSummary>,
}

impl ChatState {
    pub fn messages(&self) -> &[ChatEntry] {
        &self.messages
    }

    pub fn typing_users(&self) -> &[TypingUser] {
        &self.typing
    }

    pub fn online_users(&self) -> &[UserSummary] {
        &self.online
    }

    /// Full replace, used when the selected conversation changes.
    pub fn replace_history(&mut self, messages: &[MessagePayload]) {
        self.messages = messages
            .iter()
            .map(|message| ChatEntry::confirmed(message, None))
            .collect();
        self.typing.clear();
    }

    pub fn replace_entries(&mut self, entries: Vec<ChatEntry>) {
        self.messages = entries;
        self.typing.clear();
    }

    pub fn clear(&mut self) {
        self.messages.clear();
        self.typing.clear();
        self.online.clear();
    }

    pub fn push(&mut self, entry: ChatEntry) {
        self.messages.push(entry);
    }

    fn contains_server_id(&self, id: MessageId) -> bool {
        self.messages.iter().any(|entry| entry.server_id() == Some(id))
    }

    fn position_of_ref(&self, client_ref: &str) -> Option<usize> {
        self.messages
            .iter()
            .position(|entry| entry.client_ref.as_deref() == Some(client_ref) && entry.server_id().is_none())
    }

    /// Replaces the optimistic entry for `client_ref` with the confirmed
    /// message. Without a matching entry the message is appended only when
    /// `in_view` and not already listed.
    pub fn confirm(&mut self, client_ref: &str, message: &MessagePayload, in_view: bool) -> bool {
        let confirmed = ChatEntry::confirmed(message, Some(client_ref.to_string()));
        match self.position_of_ref(client_ref) {
            Some(index) => {
                if self.contains_server_id(message.id) {
                    self.messages.remove(index);
                } else {
                    self.messages[index] = confirmed;
                }
                true
            }
            None if !in_view || self.contains_server_id(message.id) => false,
            None => {
                self.messages.push(confirmed);
                true
            }
        }
    }

    /// Confirmation that arrived without a correlation id: the oldest pending
    /// entry with identical content stands in for it.
    pub fn confirm_by_content(&mut self, message: &MessagePayload, in_view: bool) -> bool {
        if self.contains_server_id(message.id) {
            return false;
        }
        let confirmed = ChatEntry::confirmed(message, None);
        match self
            .messages
            .iter()
            .position(|entry| entry.is_pending() && entry.content == message.content)
        {
            Some(index) => self.messages[index] = confirmed,
            None if in_view => self.messages.push(confirmed),
            None => return false,
        }
        true
    }

    pub fn mark_unconfirmed(&mut self, client_ref: &str) -> bool {
        match self.position_of_ref(client_ref) {
            Some(index) if self.messages[index].is_pending() => {
                self.messages[index].status = EntryStatus::Unconfirmed;
                true
            }
            _ => false,
        }
    }

    /// Inbound `new-message`. Exact reconciliation by correlation id when
    /// the server echoed one; otherwise a pending entry with the same
    /// content suppresses the append.
    pub fn accept_inbound(
        &mut self,
        message: &MessagePayload,
        client_ref: Option<&str>,
    ) -> InboundOutcome {
        if self.contains_server_id(message.id) {
            return InboundOutcome::Duplicate;
        }
        match client_ref {
            Some(client_ref) => {
                if let Some(index) = self.position_of_ref(client_ref) {
                    self.messages[index] =
                        ChatEntry::confirmed(message, Some(client_ref.to_string()));
                    return InboundOutcome::Reconciled;
                }
            }
            None => {
                if self
                    .messages
                    .iter()
                    .any(|entry| entry.is_pending() && entry.content == message.content)
                {
                    return InboundOutcome::Duplicate;
                }
            }
        }
        self.messages
            .push(ChatEntry::confirmed(message, client_ref.map(str::to_string)));
        InboundOutcome::Appended
    }

    /// Marks everything this user sent to `reader` as read.
    pub fn mark_read_by(&mut self, reader: UserId) -> usize {
        let mut changed = 0;
        for entry in &mut self.messages {
            if entry.receiver_id == reader && !entry.read {
                entry.read = true;
                changed += 1;
            }
        }
        changed
    }

    /// Marks everything `sender` sent as read locally.
    pub fn mark_read_from(&mut self, sender: UserId) -> usize {
        let mut changed = 0;
        for entry in &mut self.messages {
            if entry.sender.id == sender && !entry.read {
                entry.read = true;
                changed += 1;
            }
        }
        changed
    }

    pub fn remove_thinking(&mut self) {
        self.messages
            .retain(|entry| entry.status != EntryStatus::Thinking);
    }

    pub fn apply_typing(&mut self, user_id: UserId, username: &str, is_typing: bool) {
        self.typing.retain(|user| user.user_id != user_id);
        if is_typing {
            self.typing.push(TypingUser {
                user_id,
                username: username.to_string(),
            });
        }
    }

    pub fn set_online_users(&mut self, users: Vec<UserSummary>) {
        self.online = users;
    }

    pub fn apply_presence(&mut self, change: &PresenceChange) {
        self.online.retain(|user| user.id != change.user_id);
        if change.is_online {
            self.online.push(UserSummary {
                id: change.user_id,
                username: change.username.clone(),
                avatar: String::new(),
                is_online: true,
                last_seen: change.last_seen,
            });
        } else {
            self.typing.retain(|user| user.user_id != change.user_id);
        }
    }
}

#[cfg(test)]
#[path = "tests/state_tests.rs"]
mod tests;
