use std::sync::Arc;

use axum::{
    extract::{
        ws::{Message, WebSocket},
        Query, State, WebSocketUpgrade,
    },
    http::HeaderMap,
    response::{IntoResponse, Response},
    Json,
};
use futures::{SinkExt, StreamExt};
use shared::{error::ApiError, protocol::ClientRequest};
use storage::StoredUser;
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tracing::{debug, warn};

use crate::{app_state::AppState, http::status_for};

pub mod handshake;
pub mod hub;
pub mod presence;
pub mod session;

pub use handshake::{Handshake, HandshakeQuery};
pub use presence::PresenceRegistry;
pub use session::{Realtime, Session, SessionFlow};

pub type ConnectionId = uuid::Uuid;

/// Verifies the handshake before upgrading; rejected attempts get a plain
/// 401 and never reach the session core.
pub async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Query(query): Query<HandshakeQuery>,
) -> Response {
    let handshake = Handshake::from_parts(&headers, query);
    match handshake::verify(&state.api, &handshake).await {
        Ok(user) => ws
            .on_upgrade(move |socket| ws_connection(state, socket, user))
            .into_response(),
        Err(failure) => {
            warn!(reason = %failure, "realtime handshake rejected");
            let error = ApiError::from(failure);
            (status_for(error.code), Json(error)).into_response()
        }
    }
}

async fn ws_connection(state: Arc<AppState>, socket: WebSocket, user: StoredUser) {
    let (mut sender, mut receiver) = socket.split();
    let (outbox, events) = mpsc::unbounded_channel();

    let mut session = Session::authenticated(&user);
    state.realtime.join(&mut session, outbox).await;

    let send_task = tokio::spawn(async move {
        let mut events = UnboundedReceiverStream::new(events);
        while let Some(event) = events.next().await {
            let text = match serde_json::to_string(&event) {
                Ok(v) => v,
                Err(_) => continue,
            };
            if sender.send(Message::Text(text)).await.is_err() {
                break;
            }
        }
        let _ = sender.close().await;
    });

    while let Some(Ok(msg)) = receiver.next().await {
        let text = match msg {
            Message::Text(text) => text,
            Message::Close(_) => break,
            _ => continue,
        };
        let request = match serde_json::from_str::<ClientRequest>(&text) {
            Ok(request) => request,
            Err(err) => {
                debug!(user_id = %session.user_id(), error = %err, "malformed realtime request");
                state
                    .realtime
                    .emit_error(
                        &session,
                        ApiError::validation(format!("malformed request: {err}")),
                        None,
                    )
                    .await;
                continue;
            }
        };
        if state.realtime.handle(&mut session, request).await == SessionFlow::Close {
            break;
        }
    }

    state.realtime.leave(&mut session).await;
    let _ = send_task.await;
}

#[cfg(test)]
#[path = "tests/realtime_tests.rs"]
mod tests;
