use chrono::{Duration, Utc};
use jsonwebtoken::{
    decode, encode, errors::ErrorKind, DecodingKey, EncodingKey, Header, Validation,
};
use serde::{Deserialize, Serialize};
use shared::{
    domain::UserId,
    error::ApiError,
    protocol::{AuthResponse, LoginRequest, RegisterRequest},
};
use storage::StoredUser;
use thiserror::Error;
use tracing::{info, warn};

use crate::{internal, ApiContext};

pub const MIN_USERNAME_CHARS: usize = 3;
pub const MAX_USERNAME_CHARS: usize = 30;
pub const MIN_PASSWORD_CHARS: usize = 6;

#[derive(Debug, Clone)]
pub struct AuthConfig {
    pub jwt_secret: String,
    pub token_ttl_seconds: i64,
    pub bcrypt_cost: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    pub sub: String,
    pub username: String,
    pub iat: i64,
    pub exp: i64,
}

/// Why a bearer credential was not accepted.
#[derive(Debug, Error)]
pub enum AuthFailure {
    #[error("authentication token is missing")]
    MissingCredential,
    #[error("authentication token has expired")]
    Expired,
    #[error("authentication token is invalid")]
    InvalidToken,
    #[error("user no longer exists")]
    UnknownUser,
    #[error(transparent)]
    Storage(#[from] anyhow::Error),
}

impl From<AuthFailure> for ApiError {
    fn from(failure: AuthFailure) -> Self {
        match failure {
            AuthFailure::Storage(err) => internal(err),
            other => ApiError::unauthorized(other.to_string()),
        }
    }
}

pub fn issue_token(
    cfg: &AuthConfig,
    user_id: UserId,
    username: &str,
) -> Result<String, jsonwebtoken::errors::Error> {
    let now = Utc::now();
    let exp = now + Duration::seconds(cfg.token_ttl_seconds);
    let claims = Claims {
        sub: user_id.0.to_string(),
        username: username.to_string(),
        iat: now.timestamp(),
        exp: exp.timestamp(),
    };

    encode(
        &Header::default(),
        &claims,
        &EncodingKey::from_secret(cfg.jwt_secret.as_bytes()),
    )
}

pub fn verify_token(cfg: &AuthConfig, token: &str) -> Result<Claims, AuthFailure> {
    let mut validation = Validation::default();
    validation.leeway = 0;
    decode::<Claims>(
        token,
        &DecodingKey::from_secret(cfg.jwt_secret.as_bytes()),
        &validation,
    )
    .map(|data| data.claims)
    .map_err(|err| match err.kind() {
        ErrorKind::ExpiredSignature => AuthFailure::Expired,
        _ => AuthFailure::InvalidToken,
    })
}

/// Verifies a raw bearer credential and resolves it to a stored user.
pub async fn authenticate_token(ctx: &ApiContext, raw: &str) -> Result<StoredUser, AuthFailure> {
    let token = raw.trim();
    if token.is_empty() {
        return Err(AuthFailure::MissingCredential);
    }
    let claims = verify_token(&ctx.auth, token)?;
    let user_id = claims
        .sub
        .parse::<i64>()
        .map(UserId)
        .map_err(|_| AuthFailure::InvalidToken)?;
    ctx.storage
        .user_by_id(user_id)
        .await?
        .ok_or(AuthFailure::UnknownUser)
}

pub fn hash_password(password: &str, cost: u32) -> anyhow::Result<String> {
    Ok(bcrypt::hash(password, cost)?)
}

pub fn verify_password(password: &str, hash: &str) -> bool {
    bcrypt::verify(password, hash).unwrap_or(false)
}

pub async fn register(ctx: &ApiContext, req: RegisterRequest) -> Result<AuthResponse, ApiError> {
    let username = req.username.trim().to_string();
    let email = req.email.trim().to_lowercase();

    let username_len = username.chars().count();
    if !(MIN_USERNAME_CHARS..=MAX_USERNAME_CHARS).contains(&username_len) {
        return Err(ApiError::validation(format!(
            "username must be between {MIN_USERNAME_CHARS} and {MAX_USERNAME_CHARS} characters"
        )));
    }
    if !looks_like_email(&email) {
        return Err(ApiError::validation("a valid email address is required"));
    }
    if req.password.chars().count() < MIN_PASSWORD_CHARS {
        return Err(ApiError::validation(format!(
            "password must be at least {MIN_PASSWORD_CHARS} characters"
        )));
    }

    if ctx
        .storage
        .user_by_email(&email)
        .await
        .map_err(internal)?
        .is_some()
    {
        return Err(ApiError::validation("email is already registered"));
    }
    if ctx
        .storage
        .user_by_username(&username)
        .await
        .map_err(internal)?
        .is_some()
    {
        return Err(ApiError::validation("username is already taken"));
    }

    let password_hash = hash_password(&req.password, ctx.auth.bcrypt_cost).map_err(internal)?;
    let user_id = ctx
        .storage
        .create_user(&username, &email, &password_hash)
        .await
        .map_err(internal)?;
    let user = ctx
        .storage
        .user_by_id(user_id)
        .await
        .map_err(internal)?
        .ok_or_else(|| ApiError::internal("user vanished after insert"))?;

    info!(user_id = %user.id, username = %user.username, "user registered");
    auth_response(ctx, &user)
}

pub async fn login(ctx: &ApiContext, req: LoginRequest) -> Result<AuthResponse, ApiError> {
    let email = req.email.trim().to_lowercase();
    let user = ctx
        .storage
        .user_by_email(&email)
        .await
        .map_err(internal)?;
    let Some(user) = user.filter(|u| verify_password(&req.password, &u.password_hash)) else {
        warn!(%email, "login rejected");
        return Err(ApiError::unauthorized("invalid email or password"));
    };
    auth_response(ctx, &user)
}

fn auth_response(ctx: &ApiContext, user: &StoredUser) -> Result<AuthResponse, ApiError> {
    let token = issue_token(&ctx.auth, user.id, &user.username)
        .map_err(|e| ApiError::internal(format!("token mint failed: {e}")))?;
    Ok(AuthResponse {
        token,
        user: user.profile(),
    })
}

fn looks_like_email(email: &str) -> bool {
    let Some((local, domain)) = email.split_once('@') else {
        return false;
    };
    !local.is_empty()
        && !domain.starts_with('.')
        && !domain.ends_with('.')
        && domain.contains('.')
        && !email.chars().any(char::is_whitespace)
}

#[cfg(test)]
#[path = "tests/auth_tests.rs"]
mod tests;
