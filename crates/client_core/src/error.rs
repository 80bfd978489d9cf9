use shared::error::ApiError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("server rejected request: {0}")]
    Api(#[from] ApiError),
    #[error("http request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("websocket failure: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),
    #[error("invalid payload: {0}")]
    Json(#[from] serde_json::Error),
    #[error("selection store failure: {0}")]
    Io(#[from] std::io::Error),
    #[error("server_url must start with http:// or https://, got {0}")]
    InvalidServerUrl(String),
    #[error("not logged in")]
    NotLoggedIn,
    #[error("realtime channel is not connected")]
    NotConnected,
}

pub type ClientResult<T> = std::result::Result<T, ClientError>;
