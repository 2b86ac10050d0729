//! API routes

pub mod conversations;
pub mod health;

use axum::{
    routing::{get, post},
    Router,
};

use crate::{state::AppState, websocket::ws_handler};

/// Create all API routes
pub fn create_router(state: AppState) -> Router {
    // Health check routes (at root level for infrastructure monitoring)
    let health_routes = Router::new()
        .route("/health", get(health::health))
        .route("/health/live", get(health::liveness))
        .route("/health/ready", get(health::readiness));

    // Admin surface delegation (bearer auth checked in the handlers)
    let admin_routes = Router::new()
        .route("/admin/conversations", get(conversations::list_conversations))
        .route(
            "/admin/conversations/:conversation_id/messages",
            get(conversations::get_messages),
        )
        .route(
            "/admin/conversations/:conversation_id/transfers",
            get(conversations::get_transfer_history),
        )
        .route(
            "/admin/conversations/:conversation_id/transfer",
            post(conversations::transfer_conversation),
        )
        .route(
            "/admin/conversations/:conversation_id/close",
            post(conversations::close_conversation),
        )
        .route(
            "/admin/conversations/:conversation_id/read",
            post(conversations::mark_read),
        );

    // WebSocket route (auth handled in the handler via query parameters)
    let websocket_routes = Router::new().route("/ws/chat", get(ws_handler));

    Router::new()
        .merge(health_routes)
        .nest("/api/v1", admin_routes.merge(websocket_routes))
        .with_state(state)
}
