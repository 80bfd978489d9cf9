use std::{net::SocketAddr, sync::Arc, time::Duration};

use axum::{
    routing::{get, post, put},
    Router,
};
use server_api::{
    assistant::{CompletionProvider, OpenAiCompatibleProvider, UnconfiguredProvider},
    auth::AuthConfig,
    ApiContext,
};
use storage::Storage;
use tokio::task::JoinHandle;
use tower_http::limit::RequestBodyLimitLayer;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

mod app_state;
mod http;
mod realtime;
mod settings;

use app_state::AppState;
use realtime::Realtime;
use settings::{load_settings, prepare_database_url, Settings};

const MAX_BODY_BYTES: usize = 1024 * 1024;
const PRESENCE_LOG_INTERVAL: Duration = Duration::from_secs(60);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let settings = load_settings()?;
    let database_url = prepare_database_url(&settings.database_url)?;
    let storage = Storage::new(&database_url).await.map_err(|error| {
        error!(
            %database_url,
            %error,
            "failed to open SQLite database; verify parent directory exists and permissions are correct"
        );
        error
    })?;
    let reset = storage.reset_presence().await?;
    if reset > 0 {
        info!(users = reset, "cleared stale online flags from previous run");
    }

    let api = ApiContext {
        storage,
        auth: AuthConfig {
            jwt_secret: settings.jwt_secret.clone(),
            token_ttl_seconds: settings.token_ttl_seconds,
            bcrypt_cost: settings.bcrypt_cost,
        },
        assistant: assistant_provider(&settings)?,
    };

    let state = Arc::new(AppState::new(api));
    let _presence_log = spawn_presence_log(state.realtime.clone());
    let app = build_router(state);

    let addr: SocketAddr = settings.bind_addr.parse()?;
    info!(%addr, "server listening");
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;
    Ok(())
}

fn assistant_provider(settings: &Settings) -> anyhow::Result<Arc<dyn CompletionProvider>> {
    match settings.assistant_api_key() {
        Some(key) => Ok(Arc::new(OpenAiCompatibleProvider::new(
            settings.assistant_url.clone(),
            key,
            settings.assistant_model.clone(),
            settings.assistant_timeout(),
        )?)),
        None => {
            warn!("no assistant API key configured; assistant replies will use fallbacks");
            Ok(Arc::new(UnconfiguredProvider))
        }
    }
}

fn spawn_presence_log(realtime: Arc<Realtime>) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(PRESENCE_LOG_INTERVAL);
        loop {
            ticker.tick().await;
            let online = realtime.presence().len().await;
            let connections = realtime.connection_count().await;
            info!(online, connections, "presence snapshot");
        }
    })
}

fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/healthz", get(http::healthz))
        .route("/api/auth/register", post(http::register))
        .route("/api/auth/login", post(http::login))
        .route("/api/auth/me", get(http::me))
        .route("/api/auth/logout", post(http::logout))
        .route("/api/users", get(http::list_users))
        .route("/api/users/:id", get(http::get_user))
        .route("/api/messages/send", post(http::send_message))
        .route(
            "/api/messages/conversation/:user_id",
            get(http::conversation),
        )
        .route(
            "/api/messages/conversations",
            get(http::recent_conversations),
        )
        .route("/api/messages/read", put(http::mark_read))
        .route(
            "/api/messages/:id",
            put(http::edit_message).delete(http::delete_message),
        )
        .route(
            "/api/messages/:id/reactions",
            post(http::add_reaction).delete(http::remove_reaction),
        )
        .route("/api/ai/assistant", post(http::assistant_turn))
        .route(
            "/api/ai/assistant/conversation",
            get(http::assistant_conversation),
        )
        .route("/ws", get(realtime::ws_handler))
        .layer(RequestBodyLimitLayer::new(MAX_BODY_BYTES))
        .with_state(state)
}

#[cfg(test)]
#[path = "tests/main_tests.rs"]
mod tests;
