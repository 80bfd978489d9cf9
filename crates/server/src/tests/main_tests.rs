use super::*;
use axum::{
    body::{self, Body},
    http::{header, Request, StatusCode},
    response::Response,
};
use serde::de::DeserializeOwned;
use serde_json::{json, Value};
use shared::protocol::{
    AssistantConversation, AssistantMessage, AuthResponse, ConversationPage, MarkReadResponse,
    MessagePayload, UserProfile,
};
use tower::ServiceExt;

async fn test_app() -> Router {
    let api = ApiContext {
        storage: Storage::new("sqlite::memory:").await.expect("db"),
        auth: AuthConfig {
            jwt_secret: "http-secret".to_string(),
            token_ttl_seconds: 60,
            bcrypt_cost: 4,
        },
        assistant: Arc::new(UnconfiguredProvider),
    };
    build_router(Arc::new(AppState::new(api)))
}

async fn call(app: &Router, method: &str, uri: &str, token: Option<&str>, body: Option<Value>) -> Response {
    let mut request = Request::builder().method(method).uri(uri);
    if let Some(token) = token {
        request = request.header(header::AUTHORIZATION, format!("Bearer {token}"));
    }
    let request = match body {
        Some(body) => request
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(body.to_string())),
        None => request.body(Body::empty()),
    }
    .expect("request");
    app.clone().oneshot(request).await.expect("response")
}

async fn read_json<T: DeserializeOwned>(response: Response) -> T {
    let bytes = body::to_bytes(response.into_body(), usize::MAX)
        .await
        .expect("body");
    serde_json::from_slice(&bytes).expect("json")
}

async fn register(app: &Router, name: &str) -> AuthResponse {
    let response = call(
        app,
        "POST",
        "/api/auth/register",
        None,
        Some(json!({
            "username": name,
            "email": format!("{name}@example.com"),
            "password": "secret123",
        })),
    )
    .await;
    assert_eq!(response.status(), StatusCode::CREATED);
    read_json(response).await
}

#[tokio::test]
async fn healthz_reports_ok_when_storage_is_ready() {
    let app = test_app().await;
    let response = call(&app, "GET", "/healthz", None, None).await;
    assert_eq!(response.status(), StatusCode::OK);

    let body = body::to_bytes(response.into_body(), usize::MAX)
        .await
        .expect("body");
    assert_eq!(body.as_ref(), b"ok");
}

#[tokio::test]
async fn register_login_and_me_round_trip() {
    let app = test_app().await;
    let registered = register(&app, "alice").await;
    assert_eq!(registered.user.username, "alice");

    let response = call(
        &app,
        "POST",
        "/api/auth/login",
        None,
        Some(json!({ "email": "ALICE@example.com", "password": "secret123" })),
    )
    .await;
    assert_eq!(response.status(), StatusCode::OK);
    let login: AuthResponse = read_json(response).await;
    assert_eq!(login.user.id, registered.user.id);

    let response = call(&app, "GET", "/api/auth/me", Some(&login.token), None).await;
    assert_eq!(response.status(), StatusCode::OK);
    let me: UserProfile = read_json(response).await;
    assert_eq!(me.email, "alice@example.com");
}

#[tokio::test]
async fn wrong_password_and_duplicate_registration_are_rejected() {
    let app = test_app().await;
    register(&app, "alice").await;

    let response = call(
        &app,
        "POST",
        "/api/auth/login",
        None,
        Some(json!({ "email": "alice@example.com", "password": "nope-nope" })),
    )
    .await;
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

    let response = call(
        &app,
        "POST",
        "/api/auth/register",
        None,
        Some(json!({
            "username": "alice",
            "email": "other@example.com",
            "password": "secret123",
        })),
    )
    .await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn protected_routes_require_a_bearer_token() {
    let app = test_app().await;
    for uri in ["/api/auth/me", "/api/users", "/api/messages/conversations"] {
        let response = call(&app, "GET", uri, None, None).await;
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED, "{uri}");
    }
    let response = call(&app, "GET", "/api/users", Some("garbage"), None).await;
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn send_history_and_mark_read_flow() {
    let app = test_app().await;
    let alice = register(&app, "alice").await;
    let bob = register(&app, "bob").await;

    let response = call(
        &app,
        "POST",
        "/api/messages/send",
        Some(&alice.token),
        Some(json!({ "receiverId": bob.user.id, "content": "hi bob" })),
    )
    .await;
    assert_eq!(response.status(), StatusCode::CREATED);
    let sent: MessagePayload = read_json(response).await;
    assert_eq!(sent.content, "hi bob");
    assert!(!sent.read);

    let response = call(
        &app,
        "GET",
        &format!("/api/messages/conversation/{}", alice.user.id),
        Some(&bob.token),
        None,
    )
    .await;
    assert_eq!(response.status(), StatusCode::OK);
    let page: ConversationPage = read_json(response).await;
    assert_eq!(page.messages.len(), 1);
    assert_eq!(page.messages[0].id, sent.id);
    assert!(!page.has_more);

    let response = call(
        &app,
        "PUT",
        "/api/messages/read",
        Some(&bob.token),
        Some(json!({ "senderId": alice.user.id })),
    )
    .await;
    assert_eq!(response.status(), StatusCode::OK);
    let marked: MarkReadResponse = read_json(response).await;
    assert_eq!(marked.updated, 1);

    let response = call(
        &app,
        "PUT",
        "/api/messages/read",
        Some(&bob.token),
        Some(json!({ "senderId": alice.user.id })),
    )
    .await;
    let marked: MarkReadResponse = read_json(response).await;
    assert_eq!(marked.updated, 0);
}

#[tokio::test]
async fn sending_to_unknown_user_is_not_found() {
    let app = test_app().await;
    let alice = register(&app, "alice").await;

    let response = call(
        &app,
        "POST",
        "/api/messages/send",
        Some(&alice.token),
        Some(json!({ "receiverId": 999, "content": "hello?" })),
    )
    .await;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn only_sender_may_delete_a_message() {
    let app = test_app().await;
    let alice = register(&app, "alice").await;
    let bob = register(&app, "bob").await;

    let response = call(
        &app,
        "POST",
        "/api/messages/send",
        Some(&alice.token),
        Some(json!({ "receiverId": bob.user.id, "content": "mine" })),
    )
    .await;
    let sent: MessagePayload = read_json(response).await;

    let uri = format!("/api/messages/{}", sent.id);
    let response = call(&app, "DELETE", &uri, Some(&bob.token), None).await;
    assert_eq!(response.status(), StatusCode::FORBIDDEN);

    let response = call(&app, "DELETE", &uri, Some(&alice.token), None).await;
    assert_eq!(response.status(), StatusCode::NO_CONTENT);
}

#[tokio::test]
async fn assistant_falls_back_without_a_provider() {
    let app = test_app().await;
    let alice = register(&app, "alice").await;

    let response = call(
        &app,
        "POST",
        "/api/ai/assistant",
        Some(&alice.token),
        Some(json!({ "message": "hello assistant" })),
    )
    .await;
    assert_eq!(response.status(), StatusCode::OK);
    let reply: AssistantMessage = read_json(response).await;
    assert!(reply.is_fallback);
    assert!(reply.is_from_assistant());
    assert!(!reply.content.is_empty());

    let response = call(
        &app,
        "POST",
        "/api/ai/assistant",
        Some(&alice.token),
        Some(json!({ "message": "   " })),
    )
    .await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);

    let response = call(
        &app,
        "GET",
        "/api/ai/assistant/conversation",
        Some(&alice.token),
        None,
    )
    .await;
    let history: AssistantConversation = read_json(response).await;
    assert!(history.messages.is_empty());
}

#[tokio::test]
async fn oversized_bodies_are_refused() {
    let app = test_app().await;
    let alice = register(&app, "alice").await;
    let huge = "x".repeat(MAX_BODY_BYTES + 1);

    let response = call(
        &app,
        "POST",
        "/api/messages/send",
        Some(&alice.token),
        Some(json!({ "receiverId": alice.user.id, "content": huge })),
    )
    .await;
    assert_eq!(response.status(), StatusCode::PAYLOAD_TOO_LARGE);
}
