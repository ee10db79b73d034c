use anyhow::Result;
use axum::{
    extract::Extension,
    middleware,
    routing::{get, post},
    Router,
};
use pulse_core::PulseContext;
use std::net::SocketAddr;
use std::sync::Arc;
use tower::ServiceBuilder;
use tower_http::cors::{Any, CorsLayer};
use tracing;

use crate::auth;
use crate::handlers;
use crate::rooms::RoomRegistry;
use crate::websocket;

pub async fn run(ctx: PulseContext, rooms: Arc<RoomRegistry>) -> Result<()> {
    let port = ctx.config.server.port;

    // Cross-origin is limited to the configured frontend origin; fall back
    // to permissive only when it does not parse, and say so.
    let cors_layer = match ctx.config.server.frontend_origin.parse::<axum::http::HeaderValue>() {
        Ok(origin) => CorsLayer::new()
            .allow_origin(origin)
            .allow_methods(Any)
            .allow_headers(Any),
        Err(_) => {
            tracing::warn!(
                "FRONTEND_ORIGIN {} is not a valid origin, using permissive CORS",
                ctx.config.server.frontend_origin
            );
            CorsLayer::permissive()
        }
    };

    let app = Router::new()
        .route("/health", get(handlers::health))
        .route("/ws", get(websocket::websocket_handler))
        .route("/auth/sync", post(handlers::auth_sync))
        .route("/auth/me", get(handlers::auth_me))
        .route(
            "/conversations",
            post(handlers::create_conversation).get(handlers::list_conversations),
        )
        .route("/conversations/:id", get(handlers::get_conversation))
        .route("/messages", post(handlers::create_message))
        .route("/messages/single/:message_id", get(handlers::get_message))
        .route("/messages/:conversation_id", get(handlers::list_messages))
        .route("/media/upload-url", post(handlers::media_upload_url))
        .route("/media/url", get(handlers::media_url))
        .layer(
            ServiceBuilder::new()
                .layer(Extension(ctx.clone()))
                .layer(Extension(rooms))
                .layer(middleware::from_fn(auth::auth_middleware))
                .layer(cors_layer),
        );

    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    tracing::info!("Starting gateway on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!("Failed to install shutdown handler: {}", e);
        return;
    }
    tracing::info!("Shutdown signal received, draining connections");
}
