//! HTTP routes

use crate::api::handlers::{self, ApiState};
use axum::{
    routing::{any, get},
    Router,
};
use tower_http::cors::{Any, CorsLayer};

/// Create the router with all routes
pub fn create_router(state: ApiState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/health", get(handlers::health_check))
        // Peer protocol
        .route("/peer/status", get(handlers::peer_status))
        .route(
            "/peer/blocks",
            get(handlers::peer_blocks).post(handlers::post_peer_block),
        )
        .route("/peer/list", any(handlers::peer_list))
        // Public API served from the window
        .route("/api/peers", any(handlers::peer_list))
        .route("/api/peers/version", get(handlers::peers_version))
        .route("/api/blocks/getHeight", get(handlers::get_height))
        .route("/api/blocks/get", get(handlers::get_block))
        .route("/api/blocks", get(handlers::get_blocks))
        // Everything else goes to a peer
        .fallback(handlers::fallback)
        .with_state(state)
        .layer(cors)
}
