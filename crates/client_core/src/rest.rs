use reqwest::{Client, RequestBuilder, Response};
use serde::de::DeserializeOwned;
use shared::{
    domain::{UserId, UserSummary},
    error::ApiError,
    protocol::{
        AssistantConversation, AssistantMessage, AssistantRequest, AuthResponse,
        ConversationPage, LoginRequest, MarkReadRequest, MarkReadResponse, MessagePayload,
        OutgoingMessage, PageQuery, RecentConversation, RegisterRequest, UserProfile,
    },
};

use crate::error::{ClientError, ClientResult};

/// Thin wrapper over the REST surface. Every call after login carries the
/// bearer token.
#[derive(Clone)]
pub struct RestClient {
    http: Client,
    base_url: String,
    token: Option<String>,
}

impl RestClient {
    pub fn new(http: Client, base_url: impl Into<String>) -> ClientResult<Self> {
        let base_url = base_url.into().trim_end_matches('/').to_string();
        if !(base_url.starts_with("http://") || base_url.starts_with("https://")) {
            return Err(ClientError::InvalidServerUrl(base_url));
        }
        Ok(Self {
            http,
            base_url,
            token: None,
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub fn token(&self) -> Option<&str> {
        self.token.as_deref()
    }

    pub fn set_token(&mut self, token: impl Into<String>) {
        self.token = Some(token.into());
    }

    fn url(&self, path: &str) -> String {
        format!("{}{path}", self.base_url)
    }

    fn authorized(&self, request: RequestBuilder) -> RequestBuilder {
        match &self.token {
            Some(token) => request.bearer_auth(token),
            None => request,
        }
    }

    pub async fn register(&mut self, req: &RegisterRequest) -> ClientResult<UserProfile> {
        let response: AuthResponse =
            decode(self.http.post(self.url("/api/auth/register")).json(req).send().await?).await?;
        self.token = Some(response.token);
        Ok(response.user)
    }

    pub async fn login(&mut self, req: &LoginRequest) -> ClientResult<UserProfile> {
        let response: AuthResponse =
            decode(self.http.post(self.url("/api/auth/login")).json(req).send().await?).await?;
        self.token = Some(response.token);
        Ok(response.user)
    }

    pub async fn me(&self) -> ClientResult<UserProfile> {
        let request = self.authorized(self.http.get(self.url("/api/auth/me")));
        decode(request.send().await?).await
    }

    pub async fn logout(&self) -> ClientResult<()> {
        let request = self.authorized(self.http.post(self.url("/api/auth/logout")));
        check(request.send().await?).await?;
        Ok(())
    }

    pub async fn users(&self) -> ClientResult<Vec<UserSummary>> {
        let request = self.authorized(self.http.get(self.url("/api/users")));
        decode(request.send().await?).await
    }

    pub async fn conversation(
        &self,
        partner: UserId,
        page: PageQuery,
    ) -> ClientResult<ConversationPage> {
        let request = self
            .authorized(
                self.http
                    .get(self.url(&format!("/api/messages/conversation/{partner}"))),
            )
            .query(&page);
        decode(request.send().await?).await
    }

    pub async fn recent_conversations(&self) -> ClientResult<Vec<RecentConversation>> {
        let request = self.authorized(self.http.get(self.url("/api/messages/conversations")));
        decode(request.send().await?).await
    }

    /// HTTP fallback send. The server persists but never pushes.
    pub async fn send_message(&self, message: &OutgoingMessage) -> ClientResult<MessagePayload> {
        let request = self
            .authorized(self.http.post(self.url("/api/messages/send")))
            .json(message);
        decode(request.send().await?).await
    }

    pub async fn mark_read(&self, req: &MarkReadRequest) -> ClientResult<u64> {
        let request = self
            .authorized(self.http.put(self.url("/api/messages/read")))
            .json(req);
        let response: MarkReadResponse = decode(request.send().await?).await?;
        Ok(response.updated)
    }

    pub async fn assistant(&self, message: &str) -> ClientResult<AssistantMessage> {
        let request = self
            .authorized(self.http.post(self.url("/api/ai/assistant")))
            .json(&AssistantRequest {
                message: message.to_string(),
            });
        decode(request.send().await?).await
    }

    pub async fn assistant_conversation(&self) -> ClientResult<AssistantConversation> {
        let request =
            self.authorized(self.http.get(self.url("/api/ai/assistant/conversation")));
        decode(request.send().await?).await
    }
}

async fn check(response: Response) -> ClientResult<Response> {
    if response.status().is_success() {
        return Ok(response);
    }
    let status = response.status();
    let body = response.text().await.unwrap_or_default();
    Err(match serde_json::from_str::<ApiError>(&body) {
        Ok(err) => ClientError::Api(err),
        Err(_) => ClientError::Api(ApiError::internal(format!(
            "unexpected status {status}: {body}"
        ))),
    })
}

async fn decode<T: DeserializeOwned>(response: Response) -> ClientResult<T> {
    Ok(check(response).await?.json().await?)
}
