pub mod auth;
pub mod conversations;
pub mod error;
pub mod features;
pub mod messages;
pub mod middleware;
pub mod state;

use axum::{
    Router,
    routing::{delete, get, patch, post, put},
};

use crate::state::AppState;

/// REST surface. Everything outside `/auth/{register,login,refresh,logout}`
/// requires a bearer access credential.
pub fn router(state: AppState) -> Router {
    let public_routes = Router::new()
        .route("/auth/register", post(auth::register))
        .route("/auth/login", post(auth::login))
        .route("/auth/refresh", post(auth::refresh))
        .route("/auth/logout", post(auth::logout));

    let protected_routes = Router::new()
        .route("/auth/me", get(auth::me))
        .route("/auth/sessions", get(auth::sessions))
        .route("/conversations", get(conversations::list))
        .route("/conversations/private", post(conversations::open_private))
        .route("/conversations/group", post(conversations::create_group))
        .route("/conversations/{conversation_id}", delete(conversations::delete))
        .route("/conversations/{conversation_id}/leave", post(conversations::leave))
        .route("/conversations/{conversation_id}/bot", patch(conversations::toggle_bot))
        .route("/conversations/{conversation_id}/suggestion", get(conversations::suggestion))
        .route("/conversations/{conversation_id}/read", post(conversations::mark_read))
        .route(
            "/conversations/{conversation_id}/messages",
            get(messages::get_messages).post(messages::send_message),
        )
        .route("/messages/{message_id}/recall", post(messages::recall))
        .route("/messages/{message_id}", delete(messages::delete_for_me))
        .route("/features", get(features::list))
        .route("/admin/features", get(features::admin_list))
        .route("/admin/features/{key}", put(features::admin_set))
        .layer(axum::middleware::from_fn_with_state(
            state.clone(),
            middleware::require_auth,
        ));

    Router::new()
        .merge(public_routes)
        .merge(protected_routes)
        .with_state(state)
}
