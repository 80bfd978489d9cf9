use axum::http::{header, HeaderMap, HeaderValue};
use serde::Deserialize;
use server_api::{
    auth::{authenticate_token, AuthFailure},
    ApiContext,
};
use storage::StoredUser;

/// Header carrying the explicit auth field of a realtime handshake.
pub const AUTH_TOKEN_HEADER: &str = "x-auth-token";

#[derive(Debug, Default, Deserialize)]
pub struct HandshakeQuery {
    #[serde(default)]
    pub token: Option<String>,
}

/// The three places a realtime client may put its bearer credential.
#[derive(Debug, Default)]
pub struct Handshake {
    pub auth_field: Option<String>,
    pub query_token: Option<String>,
    pub authorization: Option<String>,
}

impl Handshake {
    pub fn from_parts(headers: &HeaderMap, query: HandshakeQuery) -> Self {
        Self {
            auth_field: header_value(headers.get(AUTH_TOKEN_HEADER)),
            query_token: query.token,
            authorization: header_value(headers.get(header::AUTHORIZATION)),
        }
    }

    /// First non-blank credential in priority order: auth field, query
    /// parameter, then `Authorization: Bearer`.
    pub fn credential(&self) -> Option<&str> {
        non_blank(self.auth_field.as_deref())
            .or_else(|| non_blank(self.query_token.as_deref()))
            .or_else(|| {
                non_blank(self.authorization.as_deref())
                    .and_then(|v| v.strip_prefix("Bearer "))
                    .and_then(|v| non_blank(Some(v)))
            })
    }
}

fn non_blank(value: Option<&str>) -> Option<&str> {
    value.map(str::trim).filter(|v| !v.is_empty())
}

fn header_value(value: Option<&HeaderValue>) -> Option<String> {
    value.and_then(|v| v.to_str().ok()).map(str::to_string)
}

/// Gate in front of the upgrade: no session exists unless this succeeds.
pub async fn verify(ctx: &ApiContext, handshake: &Handshake) -> Result<StoredUser, AuthFailure> {
    let token = handshake
        .credential()
        .ok_or(AuthFailure::MissingCredential)?;
    authenticate_token(ctx, token).await
}

#[cfg(test)]
#[path = "tests/handshake_tests.rs"]
mod tests;
