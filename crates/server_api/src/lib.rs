use std::sync::Arc;

use shared::{
    domain::{MessageId, ReceiverKind, UserId, UserSummary},
    error::{ApiError, ErrorCode},
    protocol::{
        ConversationPage, MarkReadRequest, MarkReadResponse, MessagePayload, OutgoingMessage,
        PageQuery, RecentConversation,
    },
};
use storage::{MessageValidationError, NewMessage, Storage};
use tracing::debug;

pub mod assistant;
pub mod auth;

use assistant::CompletionProvider;
use auth::AuthConfig;

#[derive(Clone)]
pub struct ApiContext {
    pub storage: Storage,
    pub auth: AuthConfig,
    pub assistant: Arc<dyn CompletionProvider>,
}

/// Validates the receiver, persists the message and returns it with the
/// sender populated. Shared by the realtime core and the HTTP fallback.
pub async fn send_direct_message(
    ctx: &ApiContext,
    sender_id: UserId,
    outgoing: &OutgoingMessage,
) -> Result<MessagePayload, ApiError> {
    let receiver = ctx
        .storage
        .user_by_id(outgoing.receiver_id)
        .await
        .map_err(internal)?;
    if receiver.is_none() {
        return Err(ApiError::not_found("Receiver not found"));
    }

    let message_id = ctx
        .storage
        .insert_message(NewMessage {
            sender_id,
            receiver_id: outgoing.receiver_id,
            receiver_kind: ReceiverKind::User,
            content: outgoing.content.clone(),
            kind: outgoing.message_type,
            image: outgoing.image(),
            reply_to: outgoing.reply_to,
        })
        .await
        .map_err(storage_error)?;
    debug!(message_id = %message_id, sender_id = %sender_id, receiver_id = %outgoing.receiver_id, "message persisted");

    load_message(ctx, message_id).await
}

pub async fn conversation(
    ctx: &ApiContext,
    user_id: UserId,
    other_id: UserId,
    query: PageQuery,
) -> Result<ConversationPage, ApiError> {
    let participant = ctx
        .storage
        .user_by_id(other_id)
        .await
        .map_err(internal)?
        .ok_or_else(|| ApiError::not_found("User not found"))?;
    let (messages, has_more) = ctx
        .storage
        .conversation(user_id, other_id, query.page(), query.limit())
        .await
        .map_err(internal)?;
    Ok(ConversationPage {
        participant: participant.summary(),
        messages,
        page: query.page(),
        has_more,
    })
}

pub async fn recent_conversations(
    ctx: &ApiContext,
    user_id: UserId,
) -> Result<Vec<RecentConversation>, ApiError> {
    ctx.storage
        .recent_conversations(user_id)
        .await
        .map_err(internal)
}

/// Bulk read-state update for everything `sender_id` sent to `reader_id`.
pub async fn mark_read_from(
    ctx: &ApiContext,
    reader_id: UserId,
    sender_id: UserId,
) -> Result<u64, ApiError> {
    ctx.storage
        .mark_read_from(sender_id, reader_id)
        .await
        .map_err(internal)
}

pub async fn mark_read(
    ctx: &ApiContext,
    reader_id: UserId,
    req: MarkReadRequest,
) -> Result<MarkReadResponse, ApiError> {
    let updated = match (req.message_ids, req.sender_id) {
        (Some(ids), _) if !ids.is_empty() => ctx
            .storage
            .mark_read_ids(&ids, reader_id)
            .await
            .map_err(internal)?,
        (_, Some(sender_id)) => mark_read_from(ctx, reader_id, sender_id).await?,
        _ => {
            return Err(ApiError::validation(
                "either messageIds or senderId is required",
            ))
        }
    };
    Ok(MarkReadResponse { updated })
}

pub async fn delete_message(
    ctx: &ApiContext,
    user_id: UserId,
    message_id: MessageId,
) -> Result<(), ApiError> {
    let message = load_message(ctx, message_id).await?;
    if message.sender.id != user_id {
        return Err(ApiError::forbidden("only the sender can delete a message"));
    }
    ctx.storage
        .delete_message(message_id)
        .await
        .map_err(internal)?;
    Ok(())
}

pub async fn edit_message(
    ctx: &ApiContext,
    user_id: UserId,
    message_id: MessageId,
    content: &str,
) -> Result<MessagePayload, ApiError> {
    let message = load_message(ctx, message_id).await?;
    if message.sender.id != user_id {
        return Err(ApiError::forbidden("only the sender can edit a message"));
    }
    ctx.storage
        .edit_message(message_id, content)
        .await
        .map_err(storage_error)?;
    load_message(ctx, message_id).await
}

pub async fn add_reaction(
    ctx: &ApiContext,
    user_id: UserId,
    message_id: MessageId,
    emoji: &str,
) -> Result<MessagePayload, ApiError> {
    let message = load_message(ctx, message_id).await?;
    ensure_participant(&message, user_id)?;
    ctx.storage
        .upsert_reaction(message_id, user_id, emoji)
        .await
        .map_err(storage_error)?;
    load_message(ctx, message_id).await
}

pub async fn remove_reaction(
    ctx: &ApiContext,
    user_id: UserId,
    message_id: MessageId,
) -> Result<MessagePayload, ApiError> {
    let message = load_message(ctx, message_id).await?;
    ensure_participant(&message, user_id)?;
    ctx.storage
        .remove_reaction(message_id, user_id)
        .await
        .map_err(internal)?;
    load_message(ctx, message_id).await
}

/// Every registered user except the caller.
pub async fn list_users(ctx: &ApiContext, user_id: UserId) -> Result<Vec<UserSummary>, ApiError> {
    let users = ctx.storage.list_users().await.map_err(internal)?;
    Ok(users
        .into_iter()
        .filter(|u| u.id != user_id)
        .map(|u| u.summary())
        .collect())
}

pub async fn get_user(ctx: &ApiContext, user_id: UserId) -> Result<UserSummary, ApiError> {
    ctx.storage
        .user_by_id(user_id)
        .await
        .map_err(internal)?
        .map(|u| u.summary())
        .ok_or_else(|| ApiError::not_found("User not found"))
}

/// Identity and presence metadata for the given present user ids.
pub async fn online_users(
    ctx: &ApiContext,
    present: &[UserId],
) -> Result<Vec<UserSummary>, ApiError> {
    let users = ctx.storage.users_by_ids(present).await.map_err(internal)?;
    Ok(users
        .into_iter()
        .map(|u| UserSummary {
            is_online: true,
            ..u.summary()
        })
        .collect())
}

async fn load_message(ctx: &ApiContext, message_id: MessageId) -> Result<MessagePayload, ApiError> {
    ctx.storage
        .message_by_id(message_id)
        .await
        .map_err(internal)?
        .ok_or_else(|| ApiError::not_found("Message not found"))
}

fn ensure_participant(message: &MessagePayload, user_id: UserId) -> Result<(), ApiError> {
    let is_participant = message.sender.id == user_id
        || (message.receiver_kind == ReceiverKind::User && message.receiver_id == user_id);
    if is_participant {
        Ok(())
    } else {
        Err(ApiError::forbidden("not a participant in this conversation"))
    }
}

/// Maps storage failures, surfacing rejected message fields as validation.
pub fn storage_error(err: anyhow::Error) -> ApiError {
    match err.downcast_ref::<MessageValidationError>() {
        Some(validation) => ApiError::new(ErrorCode::Validation, validation.to_string()),
        None => internal(err),
    }
}

pub fn internal(err: anyhow::Error) -> ApiError {
    ApiError::new(ErrorCode::Internal, err.to_string())
}

#[cfg(test)]
#[path = "tests/lib_tests.rs"]
mod tests;
