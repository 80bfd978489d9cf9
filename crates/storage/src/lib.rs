use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use sqlx::{
    sqlite::{SqliteConnectOptions, SqlitePoolOptions, SqliteRow},
    Pool, QueryBuilder, Row, Sqlite,
};
use std::{
    collections::HashMap,
    fs,
    path::{Path, PathBuf},
    str::FromStr,
};
use thiserror::Error;

use shared::{
    domain::{
        EditRecord, ImageAttachment, MessageId, MessageKind, Reaction, ReceiverKind, RoomId,
        UserId, UserSummary, MAX_CONTENT_CHARS,
    },
    protocol::{MessagePayload, RecentConversation, UserProfile},
};

pub const MAX_EMOJI_CHARS: usize = 5;

#[derive(Clone)]
pub struct Storage {
    pool: Pool<Sqlite>,
}

/// Rejections raised before a message row is written. Callers find these by
/// downcasting the returned `anyhow::Error`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum MessageValidationError {
    #[error("text messages require non-empty content")]
    EmptyText,
    #[error("image messages require an image url")]
    MissingImageUrl,
    #[error("message content cannot exceed 5000 characters")]
    ContentTooLong,
    #[error("reactions must be a single emoji")]
    InvalidEmoji,
}

#[derive(Debug, Clone)]
pub struct StoredUser {
    pub id: UserId,
    pub username: String,
    pub email: String,
    pub password_hash: String,
    pub avatar: String,
    pub is_online: bool,
    pub last_seen: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl StoredUser {
    pub fn summary(&self) -> UserSummary {
        UserSummary {
            id: self.id,
            username: self.username.clone(),
            avatar: self.avatar.clone(),
            is_online: self.is_online,
            last_seen: self.last_seen,
        }
    }

    pub fn profile(&self) -> UserProfile {
        UserProfile {
            id: self.id,
            username: self.username.clone(),
            email: self.email.clone(),
            avatar: self.avatar.clone(),
            is_online: self.is_online,
            last_seen: self.last_seen,
        }
    }
}

#[derive(Debug, Clone)]
pub struct NewMessage {
    pub sender_id: UserId,
    pub receiver_id: UserId,
    pub receiver_kind: ReceiverKind,
    pub content: String,
    pub kind: MessageKind,
    pub image: Option<ImageAttachment>,
    pub reply_to: Option<MessageId>,
}

impl NewMessage {
    pub fn text(sender_id: UserId, receiver_id: UserId, content: impl Into<String>) -> Self {
        Self {
            sender_id,
            receiver_id,
            receiver_kind: ReceiverKind::User,
            content: content.into(),
            kind: MessageKind::Text,
            image: None,
            reply_to: None,
        }
    }

    /// Trims the content and checks the per-kind field requirements.
    pub fn validated(mut self) -> std::result::Result<Self, MessageValidationError> {
        self.content = self.content.trim().to_string();
        if self.content.chars().count() > MAX_CONTENT_CHARS {
            return Err(MessageValidationError::ContentTooLong);
        }
        match self.kind {
            MessageKind::Text if self.content.is_empty() => Err(MessageValidationError::EmptyText),
            MessageKind::Image
                if self
                    .image
                    .as_ref()
                    .map_or(true, |image| image.url.trim().is_empty()) =>
            {
                Err(MessageValidationError::MissingImageUrl)
            }
            _ => Ok(self),
        }
    }
}

const MESSAGE_COLUMNS: &str = "m.id, m.sender_id, u.username, u.avatar, u.is_online, u.last_seen, \
     m.receiver_id, m.receiver_kind, m.content, m.message_type, m.image_url, m.image_public_id, \
     m.image_width, m.image_height, m.is_read, m.reply_to, m.edited, m.created_at, m.updated_at";

const USER_COLUMNS: &str =
    "id, username, email, password_hash, avatar, is_online, last_seen, created_at";

impl Storage {
    pub async fn new(database_url: &str) -> Result<Self> {
        ensure_sqlite_parent_dir_exists(database_url)?;

        let connect_options = SqliteConnectOptions::from_str(database_url)?
            .create_if_missing(true)
            .foreign_keys(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(connect_options)
            .await?;
        sqlx::migrate!("./migrations").run(&pool).await?;
        Ok(Self { pool })
    }

    pub fn pool(&self) -> &Pool<Sqlite> {
        &self.pool
    }

    pub async fn health_check(&self) -> Result<()> {
        let _: i64 = sqlx::query_scalar("SELECT 1")
            .fetch_one(&self.pool)
            .await
            .context("sqlite ping failed")?;
        Ok(())
    }

    pub async fn create_user(
        &self,
        username: &str,
        email: &str,
        password_hash: &str,
    ) -> Result<UserId> {
        let rec = sqlx::query(
            "INSERT INTO users (username, email, password_hash, created_at) VALUES (?, ?, ?, ?)
             RETURNING id",
        )
        .bind(username)
        .bind(email)
        .bind(password_hash)
        .bind(Utc::now())
        .fetch_one(&self.pool)
        .await
        .with_context(|| format!("failed to create user '{username}'"))?;
        Ok(UserId(rec.get::<i64, _>(0)))
    }

    pub async fn user_by_id(&self, user_id: UserId) -> Result<Option<StoredUser>> {
        let row = sqlx::query(&format!("SELECT {USER_COLUMNS} FROM users WHERE id = ?"))
            .bind(user_id.0)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.as_ref().map(user_from_row))
    }

    pub async fn user_by_email(&self, email: &str) -> Result<Option<StoredUser>> {
        let row = sqlx::query(&format!(
            "SELECT {USER_COLUMNS} FROM users WHERE email = ? COLLATE NOCASE"
        ))
        .bind(email)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.as_ref().map(user_from_row))
    }

    pub async fn user_by_username(&self, username: &str) -> Result<Option<StoredUser>> {
        let row = sqlx::query(&format!(
            "SELECT {USER_COLUMNS} FROM users WHERE username = ?"
        ))
        .bind(username)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.as_ref().map(user_from_row))
    }

    pub async fn list_users(&self) -> Result<Vec<StoredUser>> {
        let rows = sqlx::query(&format!(
            "SELECT {USER_COLUMNS} FROM users ORDER BY lower(username) ASC"
        ))
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.iter().map(user_from_row).collect())
    }

    pub async fn users_by_ids(&self, ids: &[UserId]) -> Result<Vec<StoredUser>> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let mut query = QueryBuilder::<Sqlite>::new(format!(
            "SELECT {USER_COLUMNS} FROM users WHERE id IN ("
        ));
        let mut separated = query.separated(", ");
        for id in ids {
            separated.push_bind(id.0);
        }
        separated.push_unseparated(") ORDER BY lower(username) ASC");
        let rows = query.build().fetch_all(&self.pool).await?;
        Ok(rows.iter().map(user_from_row).collect())
    }

    pub async fn set_presence(
        &self,
        user_id: UserId,
        is_online: bool,
        last_seen: DateTime<Utc>,
    ) -> Result<()> {
        sqlx::query("UPDATE users SET is_online = ?, last_seen = ? WHERE id = ?")
            .bind(is_online)
            .bind(last_seen)
            .bind(user_id.0)
            .execute(&self.pool)
            .await
            .with_context(|| format!("failed to update presence for user {user_id}"))?;
        Ok(())
    }

    /// Marks every user offline. Returns how many were flagged online.
    pub async fn reset_presence(&self) -> Result<u64> {
        let result = sqlx::query("UPDATE users SET is_online = 0 WHERE is_online = 1")
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    pub async fn insert_message(&self, message: NewMessage) -> Result<MessageId> {
        let message = message.validated()?;
        let now = Utc::now();
        let image = message.image.as_ref();
        let rec = sqlx::query(
            "INSERT INTO messages (sender_id, receiver_id, receiver_kind, content, message_type, image_url, image_public_id, image_width, image_height, reply_to, created_at, updated_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?) RETURNING id",
        )
        .bind(message.sender_id.0)
        .bind(message.receiver_id.0)
        .bind(message.receiver_kind.as_str())
        .bind(&message.content)
        .bind(message.kind.as_str())
        .bind(image.map(|i| i.url.as_str()))
        .bind(image.map(|i| i.public_id.as_str()))
        .bind(image.map(|i| i64::from(i.width)))
        .bind(image.map(|i| i64::from(i.height)))
        .bind(message.reply_to.map(|id| id.0))
        .bind(now)
        .bind(now)
        .fetch_one(&self.pool)
        .await?;
        Ok(MessageId(rec.get::<i64, _>(0)))
    }

    pub async fn message_by_id(&self, message_id: MessageId) -> Result<Option<MessagePayload>> {
        let row = sqlx::query(&format!(
            "SELECT {MESSAGE_COLUMNS} FROM messages m INNER JOIN users u ON u.id = m.sender_id WHERE m.id = ?"
        ))
        .bind(message_id.0)
        .fetch_optional(&self.pool)
        .await?;
        let Some(row) = row else {
            return Ok(None);
        };
        let mut messages = vec![message_from_row(&row)];
        self.attach_details(&mut messages).await?;
        Ok(messages.pop())
    }

    /// Newest page of the direct conversation between two users, returned
    /// oldest-first, plus whether older messages exist.
    pub async fn conversation(
        &self,
        a: UserId,
        b: UserId,
        page: u32,
        limit: u32,
    ) -> Result<(Vec<MessagePayload>, bool)> {
        let offset = i64::from(page.saturating_sub(1)) * i64::from(limit);
        let rows = sqlx::query(&format!(
            "SELECT {MESSAGE_COLUMNS}
             FROM messages m
             INNER JOIN users u ON u.id = m.sender_id
             WHERE m.receiver_kind = 'user'
               AND ((m.sender_id = ? AND m.receiver_id = ?) OR (m.sender_id = ? AND m.receiver_id = ?))
             ORDER BY m.id DESC
             LIMIT ? OFFSET ?"
        ))
        .bind(a.0)
        .bind(b.0)
        .bind(b.0)
        .bind(a.0)
        .bind(i64::from(limit) + 1)
        .bind(offset)
        .fetch_all(&self.pool)
        .await?;
        self.page_from_rows(rows, limit).await
    }

    pub async fn room_messages(
        &self,
        room_id: RoomId,
        page: u32,
        limit: u32,
    ) -> Result<(Vec<MessagePayload>, bool)> {
        let offset = i64::from(page.saturating_sub(1)) * i64::from(limit);
        let rows = sqlx::query(&format!(
            "SELECT {MESSAGE_COLUMNS}
             FROM messages m
             INNER JOIN users u ON u.id = m.sender_id
             WHERE m.receiver_kind = 'room' AND m.receiver_id = ?
             ORDER BY m.id DESC
             LIMIT ? OFFSET ?"
        ))
        .bind(room_id.0)
        .bind(i64::from(limit) + 1)
        .bind(offset)
        .fetch_all(&self.pool)
        .await?;
        self.page_from_rows(rows, limit).await
    }

    /// Marks every unread message from `sender` to `receiver` as read.
    pub async fn mark_read_from(&self, sender: UserId, receiver: UserId) -> Result<u64> {
        let result = sqlx::query(
            "UPDATE messages SET is_read = 1, updated_at = ?
             WHERE sender_id = ? AND receiver_id = ? AND receiver_kind = 'user' AND is_read = 0",
        )
        .bind(Utc::now())
        .bind(sender.0)
        .bind(receiver.0)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    /// Marks the given messages read, limited to ones addressed to `receiver`.
    pub async fn mark_read_ids(&self, ids: &[MessageId], receiver: UserId) -> Result<u64> {
        if ids.is_empty() {
            return Ok(0);
        }
        let mut query = QueryBuilder::<Sqlite>::new("UPDATE messages SET is_read = 1, updated_at = ");
        query.push_bind(Utc::now());
        query.push(" WHERE receiver_kind = 'user' AND is_read = 0 AND receiver_id = ");
        query.push_bind(receiver.0);
        query.push(" AND id IN (");
        let mut separated = query.separated(", ");
        for id in ids {
            separated.push_bind(id.0);
        }
        separated.push_unseparated(")");
        let result = query.build().execute(&self.pool).await?;
        Ok(result.rows_affected())
    }

    pub async fn delete_message(&self, message_id: MessageId) -> Result<bool> {
        let result = sqlx::query("DELETE FROM messages WHERE id = ?")
            .bind(message_id.0)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    /// One entry per direct-message partner, newest conversation first.
    pub async fn recent_conversations(&self, user_id: UserId) -> Result<Vec<RecentConversation>> {
        let rows = sqlx::query(
            "SELECT partner_id,
                    MAX(id) AS last_id,
                    SUM(CASE WHEN receiver_id = ? AND is_read = 0 THEN 1 ELSE 0 END) AS unread
             FROM (
                SELECT id, receiver_id, is_read,
                       CASE WHEN sender_id = ? THEN receiver_id ELSE sender_id END AS partner_id
                FROM messages
                WHERE receiver_kind = 'user' AND (sender_id = ? OR receiver_id = ?)
             )
             GROUP BY partner_id
             ORDER BY last_id DESC",
        )
        .bind(user_id.0)
        .bind(user_id.0)
        .bind(user_id.0)
        .bind(user_id.0)
        .fetch_all(&self.pool)
        .await?;

        let mut conversations = Vec::with_capacity(rows.len());
        for row in rows {
            let partner_id = UserId(row.get::<i64, _>(0));
            let last_id = MessageId(row.get::<i64, _>(1));
            let unread_count = row.get::<i64, _>(2);
            let Some(partner) = self.user_by_id(partner_id).await? else {
                continue;
            };
            let Some(last_message) = self.message_by_id(last_id).await? else {
                continue;
            };
            conversations.push(RecentConversation {
                partner: partner.summary(),
                last_message,
                unread_count,
            });
        }
        Ok(conversations)
    }

    /// Sets the user's reaction, replacing any earlier one on the same message.
    pub async fn upsert_reaction(
        &self,
        message_id: MessageId,
        user_id: UserId,
        emoji: &str,
    ) -> Result<()> {
        let emoji = emoji.trim();
        if emoji.is_empty() || emoji.chars().count() > MAX_EMOJI_CHARS {
            return Err(MessageValidationError::InvalidEmoji.into());
        }
        sqlx::query(
            "INSERT INTO message_reactions (message_id, user_id, emoji, created_at) VALUES (?, ?, ?, ?)
             ON CONFLICT(message_id, user_id) DO UPDATE SET emoji = excluded.emoji, created_at = excluded.created_at",
        )
        .bind(message_id.0)
        .bind(user_id.0)
        .bind(emoji)
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn remove_reaction(&self, message_id: MessageId, user_id: UserId) -> Result<bool> {
        let result = sqlx::query("DELETE FROM message_reactions WHERE message_id = ? AND user_id = ?")
            .bind(message_id.0)
            .bind(user_id.0)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Replaces the content and appends the previous content to the edit
    /// history. Returns false when the message does not exist.
    pub async fn edit_message(&self, message_id: MessageId, content: &str) -> Result<bool> {
        let content = content.trim();
        if content.chars().count() > MAX_CONTENT_CHARS {
            return Err(MessageValidationError::ContentTooLong.into());
        }

        let mut tx = self.pool.begin().await?;
        let row = sqlx::query("SELECT content, message_type FROM messages WHERE id = ?")
            .bind(message_id.0)
            .fetch_optional(&mut *tx)
            .await?;
        let Some(row) = row else {
            return Ok(false);
        };
        let previous = row.get::<String, _>(0);
        if MessageKind::parse(&row.get::<String, _>(1)) == MessageKind::Text && content.is_empty()
        {
            return Err(MessageValidationError::EmptyText.into());
        }

        let now = Utc::now();
        sqlx::query("INSERT INTO message_edits (message_id, content, edited_at) VALUES (?, ?, ?)")
            .bind(message_id.0)
            .bind(&previous)
            .bind(now)
            .execute(&mut *tx)
            .await?;
        sqlx::query("UPDATE messages SET content = ?, edited = 1, updated_at = ? WHERE id = ?")
            .bind(content)
            .bind(now)
            .bind(message_id.0)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(true)
    }

    async fn page_from_rows(
        &self,
        rows: Vec<SqliteRow>,
        limit: u32,
    ) -> Result<(Vec<MessagePayload>, bool)> {
        let limit = usize::try_from(limit).unwrap_or(usize::MAX);
        let has_more = rows.len() > limit;
        let mut messages: Vec<MessagePayload> =
            rows.iter().take(limit).map(message_from_row).collect();
        messages.reverse();
        self.attach_details(&mut messages).await?;
        Ok((messages, has_more))
    }

    async fn attach_details(&self, messages: &mut [MessagePayload]) -> Result<()> {
        if messages.is_empty() {
            return Ok(());
        }

        let mut query = QueryBuilder::<Sqlite>::new(
            "SELECT message_id, user_id, emoji, created_at FROM message_reactions WHERE message_id IN (",
        );
        let mut separated = query.separated(", ");
        for message in messages.iter() {
            separated.push_bind(message.id.0);
        }
        separated.push_unseparated(") ORDER BY created_at ASC");
        let mut reactions: HashMap<i64, Vec<Reaction>> = HashMap::new();
        for r in query.build().fetch_all(&self.pool).await? {
            reactions.entry(r.get::<i64, _>(0)).or_default().push(Reaction {
                user_id: UserId(r.get::<i64, _>(1)),
                emoji: r.get::<String, _>(2),
                created_at: r.get::<DateTime<Utc>, _>(3),
            });
        }

        let mut query = QueryBuilder::<Sqlite>::new(
            "SELECT message_id, content, edited_at FROM message_edits WHERE message_id IN (",
        );
        let mut separated = query.separated(", ");
        for message in messages.iter() {
            separated.push_bind(message.id.0);
        }
        separated.push_unseparated(") ORDER BY id ASC");
        let mut edits: HashMap<i64, Vec<EditRecord>> = HashMap::new();
        for r in query.build().fetch_all(&self.pool).await? {
            edits.entry(r.get::<i64, _>(0)).or_default().push(EditRecord {
                content: r.get::<String, _>(1),
                edited_at: r.get::<DateTime<Utc>, _>(2),
            });
        }

        for message in messages.iter_mut() {
            message.reactions = reactions.remove(&message.id.0).unwrap_or_default();
            message.edit_history = edits.remove(&message.id.0).unwrap_or_default();
        }
        Ok(())
    }
}

fn user_from_row(r: &SqliteRow) -> StoredUser {
    StoredUser {
        id: UserId(r.get::<i64, _>(0)),
        username: r.get::<String, _>(1),
        email: r.get::<String, _>(2),
        password_hash: r.get::<String, _>(3),
        avatar: r.get::<String, _>(4),
        is_online: r.get::<bool, _>(5),
        last_seen: r.get::<Option<DateTime<Utc>>, _>(6),
        created_at: r.get::<DateTime<Utc>, _>(7),
    }
}

fn message_from_row(r: &SqliteRow) -> MessagePayload {
    let kind = MessageKind::parse(&r.get::<String, _>(9));
    let image = r.get::<Option<String>, _>(10).map(|url| ImageAttachment {
        url,
        public_id: r.get::<Option<String>, _>(11).unwrap_or_default(),
        width: u32::try_from(r.get::<Option<i64>, _>(12).unwrap_or_default()).unwrap_or_default(),
        height: u32::try_from(r.get::<Option<i64>, _>(13).unwrap_or_default()).unwrap_or_default(),
    });
    MessagePayload {
        id: MessageId(r.get::<i64, _>(0)),
        sender: UserSummary {
            id: UserId(r.get::<i64, _>(1)),
            username: r.get::<String, _>(2),
            avatar: r.get::<String, _>(3),
            is_online: r.get::<bool, _>(4),
            last_seen: r.get::<Option<DateTime<Utc>>, _>(5),
        },
        receiver_id: UserId(r.get::<i64, _>(6)),
        receiver_kind: ReceiverKind::parse(&r.get::<String, _>(7)),
        content: r.get::<String, _>(8),
        message_type: kind,
        image,
        read: r.get::<bool, _>(14),
        reactions: Vec::new(),
        reply_to: r.get::<Option<i64>, _>(15).map(MessageId),
        edited: r.get::<bool, _>(16),
        edit_history: Vec::new(),
        created_at: r.get::<DateTime<Utc>, _>(17),
        updated_at: r.get::<DateTime<Utc>, _>(18),
    }
}

fn ensure_sqlite_parent_dir_exists(database_url: &str) -> Result<()> {
    let Some(path) = sqlite_path(database_url) else {
        return Ok(());
    };

    let Some(parent) = path.parent() else {
        return Ok(());
    };

    fs::create_dir_all(parent).with_context(|| {
        format!(
            "failed to create parent directory '{}' for database url '{database_url}'",
            parent.display()
        )
    })?;

    Ok(())
}

fn sqlite_path(database_url: &str) -> Option<PathBuf> {
    if database_url == "sqlite::memory:" || !database_url.starts_with("sqlite:") {
        return None;
    }

    let path = database_url
        .trim_start_matches("sqlite://")
        .trim_start_matches("sqlite:")
        .split('?')
        .next()
        .unwrap_or_default();

    if path.is_empty() {
        return None;
    }

    Some(Path::new(path).to_path_buf())
}

#[cfg(test)]
#[path = "tests/lib_tests.rs"]
mod tests;
