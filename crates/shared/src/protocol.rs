use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{
    domain::{
        EditRecord, ImageAttachment, MessageId, MessageKind, Reaction, ReceiverKind, UserId,
        UserSummary, ASSISTANT_USER_ID,
    },
    error::ApiError,
};

/// Client-generated correlation id for one send attempt.
pub type ClientRef = String;

pub fn new_client_ref() -> ClientRef {
    uuid::Uuid::new_v4().to_string()
}

/// Body of a send, shared by the realtime `send-message` event and the HTTP
/// fallback endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OutgoingMessage {
    pub receiver_id: UserId,
    #[serde(default)]
    pub content: String,
    #[serde(default)]
    pub message_type: MessageKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_public_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_width: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_height: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reply_to: Option<MessageId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_ref: Option<ClientRef>,
}

impl OutgoingMessage {
    pub fn text(receiver_id: UserId, content: impl Into<String>) -> Self {
        Self {
            receiver_id,
            content: content.into(),
            message_type: MessageKind::Text,
            image_url: None,
            image_public_id: None,
            image_width: None,
            image_height: None,
            reply_to: None,
            client_ref: None,
        }
    }

    pub fn with_client_ref(mut self, client_ref: impl Into<ClientRef>) -> Self {
        self.client_ref = Some(client_ref.into());
        self
    }

    pub fn image(&self) -> Option<ImageAttachment> {
        self.image_url.as_ref().map(|url| ImageAttachment {
            url: url.clone(),
            public_id: self.image_public_id.clone().unwrap_or_default(),
            width: self.image_width.unwrap_or_default(),
            height: self.image_height.unwrap_or_default(),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(
    tag = "type",
    content = "payload",
    rename_all = "kebab-case",
    rename_all_fields = "camelCase"
)]
pub enum ClientRequest {
    /// Accepted for compatibility; joining happens on connect.
    JoinUser(UserId),
    SendMessage(OutgoingMessage),
    TypingStart {
        receiver_id: UserId,
    },
    TypingStop {
        receiver_id: UserId,
    },
    MarkMessagesRead {
        sender_id: UserId,
    },
    GetOnlineUsers,
    UserLogout,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(
    tag = "type",
    content = "payload",
    rename_all = "kebab-case",
    rename_all_fields = "camelCase"
)]
pub enum ServerEvent {
    MessageSent {
        success: bool,
        message: MessagePayload,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        client_ref: Option<ClientRef>,
    },
    NewMessage {
        message: MessagePayload,
        from: UserSummary,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        client_ref: Option<ClientRef>,
    },
    UserTyping {
        sender_id: UserId,
        sender_name: String,
        is_typing: bool,
    },
    MessagesRead {
        reader_id: UserId,
        reader_name: String,
    },
    UserOnline(PresenceChange),
    UserOffline(PresenceChange),
    OnlineUsers(Vec<UserSummary>),
    Error {
        error: ApiError,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        client_ref: Option<ClientRef>,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PresenceChange {
    pub user_id: UserId,
    pub username: String,
    pub is_online: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_seen: Option<DateTime<Utc>>,
}

/// A persisted message with its sender populated.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessagePayload {
    pub id: MessageId,
    pub sender: UserSummary,
    pub receiver_id: UserId,
    #[serde(default)]
    pub receiver_kind: ReceiverKind,
    #[serde(default)]
    pub content: String,
    #[serde(default)]
    pub message_type: MessageKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<ImageAttachment>,
    #[serde(default)]
    pub read: bool,
    #[serde(default)]
    pub reactions: Vec<Reaction>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reply_to: Option<MessageId>,
    #[serde(default)]
    pub edited: bool,
    #[serde(default)]
    pub edit_history: Vec<EditRecord>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserProfile {
    pub id: UserId,
    pub username: String,
    pub email: String,
    #[serde(default)]
    pub avatar: String,
    #[serde(default)]
    pub is_online: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_seen: Option<DateTime<Utc>>,
}

impl UserProfile {
    pub fn summary(&self) -> UserSummary {
        UserSummary {
            id: self.id,
            username: self.username.clone(),
            avatar: self.avatar.clone(),
            is_online: self.is_online,
            last_seen: self.last_seen,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegisterRequest {
    pub username: String,
    pub email: String,
    pub password: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoginRequest {
    pub email: String,
    pub password: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthResponse {
    pub token: String,
    pub user: UserProfile,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Default)]
pub struct PageQuery {
    #[serde(default)]
    pub page: Option<u32>,
    #[serde(default)]
    pub limit: Option<u32>,
}

impl PageQuery {
    pub const DEFAULT_LIMIT: u32 = 50;
    pub const MAX_LIMIT: u32 = 200;

    pub fn page(&self) -> u32 {
        self.page.unwrap_or(1).max(1)
    }

    pub fn limit(&self) -> u32 {
        self.limit
            .unwrap_or(Self::DEFAULT_LIMIT)
            .clamp(1, Self::MAX_LIMIT)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConversationPage {
    pub participant: UserSummary,
    pub messages: Vec<MessagePayload>,
    pub page: u32,
    pub has_more: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecentConversation {
    pub partner: UserSummary,
    pub last_message: MessagePayload,
    pub unread_count: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct MarkReadRequest {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message_ids: Option<Vec<MessageId>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sender_id: Option<UserId>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct MarkReadResponse {
    pub updated: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EditMessageRequest {
    pub content: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReactionRequest {
    pub emoji: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AssistantRequest {
    pub message: String,
}

/// A synthesized AI turn. Never persisted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AssistantMessage {
    pub id: String,
    pub sender: UserSummary,
    pub receiver_id: UserId,
    pub content: String,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub is_fallback: bool,
}

impl AssistantMessage {
    pub fn from_assistant(receiver_id: UserId, content: impl Into<String>, is_fallback: bool) -> Self {
        let created_at = Utc::now();
        Self {
            id: format!("ai-{}", created_at.timestamp_millis()),
            sender: UserSummary::assistant(),
            receiver_id,
            content: content.into(),
            created_at,
            is_fallback,
        }
    }

    pub fn is_from_assistant(&self) -> bool {
        self.sender.id == ASSISTANT_USER_ID
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct AssistantConversation {
    pub messages: Vec<AssistantMessage>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Ack {
    pub success: bool,
}

#[cfg(test)]
#[path = "tests/protocol_tests.rs"]
mod tests;
