use std::sync::Arc;

use axum::{
    async_trait,
    extract::{FromRequestParts, Path, Query, State},
    http::{header, request::Parts, StatusCode},
    Json,
};
use server_api::{assistant, auth, ApiContext};
use shared::{
    domain::{MessageId, UserId, UserSummary},
    error::{ApiError, ErrorCode},
    protocol::{
        Ack, AssistantConversation, AssistantMessage, AssistantRequest, AuthResponse,
        ConversationPage, EditMessageRequest, LoginRequest, MarkReadRequest, MarkReadResponse,
        MessagePayload, OutgoingMessage, PageQuery, ReactionRequest, RecentConversation,
        RegisterRequest, UserProfile,
    },
};
use storage::StoredUser;

use crate::app_state::AppState;

type HttpResult<T> = Result<T, (StatusCode, Json<ApiError>)>;

pub(crate) fn status_for(code: ErrorCode) -> StatusCode {
    match code {
        ErrorCode::Unauthorized => StatusCode::UNAUTHORIZED,
        ErrorCode::Forbidden => StatusCode::FORBIDDEN,
        ErrorCode::NotFound => StatusCode::NOT_FOUND,
        ErrorCode::Validation => StatusCode::BAD_REQUEST,
        ErrorCode::RateLimited => StatusCode::TOO_MANY_REQUESTS,
        ErrorCode::Internal => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

fn reject(err: ApiError) -> (StatusCode, Json<ApiError>) {
    (status_for(err.code), Json(err))
}

/// Caller resolved from `Authorization: Bearer <token>`.
pub(crate) struct AuthUser(pub(crate) StoredUser);

impl AuthUser {
    fn id(&self) -> UserId {
        self.0.id
    }
}

#[async_trait]
impl FromRequestParts<Arc<AppState>> for AuthUser {
    type Rejection = (StatusCode, Json<ApiError>);

    async fn from_request_parts(
        parts: &mut Parts,
        state: &Arc<AppState>,
    ) -> Result<Self, Self::Rejection> {
        let token = parts
            .headers
            .get(header::AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.trim().strip_prefix("Bearer "))
            .unwrap_or_default();
        auth::authenticate_token(&state.api, token)
            .await
            .map(AuthUser)
            .map_err(|failure| reject(failure.into()))
    }
}

fn api(state: &AppState) -> &ApiContext {
    &state.api
}

pub(crate) async fn healthz(State(state): State<Arc<AppState>>) -> HttpResult<&'static str> {
    state
        .api
        .storage
        .health_check()
        .await
        .map_err(|e| reject(server_api::internal(e)))?;
    Ok("ok")
}

pub(crate) async fn register(
    State(state): State<Arc<AppState>>,
    Json(req): Json<RegisterRequest>,
) -> HttpResult<(StatusCode, Json<AuthResponse>)> {
    let response = auth::register(api(&state), req).await.map_err(reject)?;
    Ok((StatusCode::CREATED, Json(response)))
}

pub(crate) async fn login(
    State(state): State<Arc<AppState>>,
    Json(req): Json<LoginRequest>,
) -> HttpResult<Json<AuthResponse>> {
    auth::login(api(&state), req).await.map(Json).map_err(reject)
}

pub(crate) async fn me(user: AuthUser) -> Json<UserProfile> {
    Json(user.0.profile())
}

/// Presence belongs to the realtime core; this only acknowledges.
pub(crate) async fn logout(_user: AuthUser) -> Json<Ack> {
    Json(Ack { success: true })
}

pub(crate) async fn list_users(
    State(state): State<Arc<AppState>>,
    user: AuthUser,
) -> HttpResult<Json<Vec<UserSummary>>> {
    server_api::list_users(api(&state), user.id())
        .await
        .map(Json)
        .map_err(reject)
}

pub(crate) async fn get_user(
    State(state): State<Arc<AppState>>,
    _user: AuthUser,
    Path(user_id): Path<i64>,
) -> HttpResult<Json<UserSummary>> {
    server_api::get_user(api(&state), UserId(user_id))
        .await
        .map(Json)
        .map_err(reject)
}

/// HTTP fallback send. Persists only; realtime delivery is not attempted.
pub(crate) async fn send_message(
    State(state): State<Arc<AppState>>,
    user: AuthUser,
    Json(req): Json<OutgoingMessage>,
) -> HttpResult<(StatusCode, Json<MessagePayload>)> {
    let message = server_api::send_direct_message(api(&state), user.id(), &req)
        .await
        .map_err(reject)?;
    Ok((StatusCode::CREATED, Json(message)))
}

pub(crate) async fn conversation(
    State(state): State<Arc<AppState>>,
    user: AuthUser,
    Path(other_id): Path<i64>,
    Query(query): Query<PageQuery>,
) -> HttpResult<Json<ConversationPage>> {
    server_api::conversation(api(&state), user.id(), UserId(other_id), query)
        .await
        .map(Json)
        .map_err(reject)
}

pub(crate) async fn recent_conversations(
    State(state): State<Arc<AppState>>,
    user: AuthUser,
) -> HttpResult<Json<Vec<RecentConversation>>> {
    server_api::recent_conversations(api(&state), user.id())
        .await
        .map(Json)
        .map_err(reject)
}

pub(crate) async fn mark_read(
    State(state): State<Arc<AppState>>,
    user: AuthUser,
    Json(req): Json<MarkReadRequest>,
) -> HttpResult<Json<MarkReadResponse>> {
    server_api::mark_read(api(&state), user.id(), req)
        .await
        .map(Json)
        .map_err(reject)
}

pub(crate) async fn delete_message(
    State(state): State<Arc<AppState>>,
    user: AuthUser,
    Path(message_id): Path<i64>,
) -> HttpResult<StatusCode> {
    server_api::delete_message(api(&state), user.id(), MessageId(message_id))
        .await
        .map_err(reject)?;
    Ok(StatusCode::NO_CONTENT)
}

pub(crate) async fn edit_message(
    State(state): State<Arc<AppState>>,
    user: AuthUser,
    Path(message_id): Path<i64>,
    Json(req): Json<EditMessageRequest>,
) -> HttpResult<Json<MessagePayload>> {
    server_api::edit_message(api(&state), user.id(), MessageId(message_id), &req.content)
        .await
        .map(Json)
        .map_err(reject)
}

pub(crate) async fn add_reaction(
    State(state): State<Arc<AppState>>,
    user: AuthUser,
    Path(message_id): Path<i64>,
    Json(req): Json<ReactionRequest>,
) -> HttpResult<Json<MessagePayload>> {
    server_api::add_reaction(api(&state), user.id(), MessageId(message_id), &req.emoji)
        .await
        .map(Json)
        .map_err(reject)
}

pub(crate) async fn remove_reaction(
    State(state): State<Arc<AppState>>,
    user: AuthUser,
    Path(message_id): Path<i64>,
) -> HttpResult<Json<MessagePayload>> {
    server_api::remove_reaction(api(&state), user.id(), MessageId(message_id))
        .await
        .map(Json)
        .map_err(reject)
}

pub(crate) async fn assistant_turn(
    State(state): State<Arc<AppState>>,
    user: AuthUser,
    Json(req): Json<AssistantRequest>,
) -> HttpResult<Json<AssistantMessage>> {
    assistant::assistant_reply(api(&state), user.id(), &req.message)
        .await
        .map(Json)
        .map_err(reject)
}

/// Assistant turns are not stored, so there is never any history.
pub(crate) async fn assistant_conversation(_user: AuthUser) -> Json<AssistantConversation> {
    Json(AssistantConversation::default())
}
