pub mod config;

use std::sync::Arc;

use anyhow::Context;
use axum::{
    Router,
    extract::{Query, State, WebSocketUpgrade},
    http::HeaderMap,
    response::{IntoResponse, Response},
    routing::get,
};
use chrono::Utc;
use serde::Deserialize;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use parley_api::error::ApiError;
use parley_api::middleware::bearer_token;
use parley_api::state::{AppState, AppStateInner};
use parley_core::Error;
use parley_core::accounts::Accounts;
use parley_core::capabilities::CapabilityGate;
use parley_core::chat::ChatService;
use parley_core::provider::{GeminiProvider, ReplyProvider, UnconfiguredProvider};
use parley_core::tokens::TokenService;
use parley_db::Database;
use parley_gateway::Gateway;
use parley_gateway::assistant::Assistant;
use parley_gateway::connection;
use parley_gateway::dispatcher::Dispatcher;

use crate::config::Config;

/// Gemini when a key is configured, otherwise the fixed "not configured" stand-in.
pub fn provider_from_config(config: &Config) -> anyhow::Result<Arc<dyn ReplyProvider>> {
    match &config.gemini_api_key {
        Some(key) => {
            info!("Assistant provider: gemini ({})", config.model);
            let mut provider = GeminiProvider::new(key.clone(), config.model.clone())?;
            if let Some(base_url) = &config.gemini_base_url {
                provider = provider.with_base_url(base_url.trim_end_matches('/'));
            }
            Ok(Arc::new(provider))
        }
        None => {
            warn!("GEMINI_API_KEY not set, assistant replies are disabled");
            Ok(Arc::new(UnconfiguredProvider))
        }
    }
}

/// Wire every service over an opened database: bot identity, capability
/// cache, configured admin, then the shared state.
pub async fn bootstrap(
    config: &Config,
    db: Arc<Database>,
    provider: Arc<dyn ReplyProvider>,
) -> anyhow::Result<AppState> {
    let bot = {
        let db = db.clone();
        tokio::task::spawn_blocking(move || db.ensure_bot_user(Utc::now())).await??
    };
    let bot_id = bot.user_id()?;
    info!("Assistant identity is {}", bot_id);

    let gate = CapabilityGate::new(db.clone());
    gate.seed_defaults().await.context("seeding capability defaults")?;
    gate.load().await.context("loading capabilities")?;

    let tokens = TokenService::new(db.clone(), &config.jwt_secret, config.access_ttl, config.refresh_ttl);
    let accounts = Accounts::new(db.clone(), tokens.clone(), gate.clone());
    if let Some(admin) = &config.admin_username {
        if !accounts.promote_admin(admin).await? {
            warn!("PARLEY_ADMIN_USERNAME does not match any account");
        }
    }

    let chat = ChatService::new(db, gate, provider);
    let dispatcher = Dispatcher::new();
    let assistant = Assistant::new(
        chat.clone(),
        dispatcher.clone(),
        bot_id,
        config.history_limit,
        config.assistant_timeout,
    );

    Ok(Arc::new(AppStateInner {
        accounts,
        tokens,
        gateway: Gateway::new(chat, dispatcher, assistant),
        secure_cookies: config.production,
    }))
}

/// REST routes plus the realtime endpoint at `/ws`.
pub fn app(state: AppState) -> Router {
    let ws_route = Router::new()
        .route("/ws", get(ws_upgrade))
        .with_state(state.clone());

    Router::new()
        .merge(parley_api::router(state))
        .merge(ws_route)
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
}

#[derive(Debug, Deserialize)]
struct HandshakeQuery {
    token: Option<String>,
}

/// The access credential comes from `?token=` or an `Authorization: Bearer`
/// header and is checked before the upgrade; bad handshakes get a plain 401.
async fn ws_upgrade(
    State(state): State<AppState>,
    Query(query): Query<HandshakeQuery>,
    headers: HeaderMap,
    ws: WebSocketUpgrade,
) -> Response {
    let token = query.token.as_deref().or_else(|| bearer_token(&headers));
    let claims = match token.map(|t| state.tokens.verify_access(t)) {
        Some(Ok(claims)) => claims,
        Some(Err(e)) => {
            warn!("Rejected realtime handshake: {}", e);
            return ApiError(e).into_response();
        }
        None => {
            warn!("Realtime handshake without credential");
            return ApiError(Error::reauthenticate()).into_response();
        }
    };

    let gateway = state.gateway.clone();
    ws.on_upgrade(move |socket| {
        connection::handle_connection(socket, gateway, claims.sub, claims.username)
    })
}
