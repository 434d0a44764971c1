//! # DDP Server
//!
//! Serves the [`ddp`] engine over axum WebSockets, with environment-based
//! configuration and a set of demo handlers.

use std::sync::Arc;

use axum::{Router, routing::get};
use ddp::Server;
use tower_http::trace::TraceLayer;

pub mod config;
pub mod demo;
pub mod handlers;

use config::Config;
use handlers::{WsState, ws_handler};

/// Build the DDP server with the demo handlers registered.
pub fn build_server(config: &Config) -> Arc<Server> {
    demo::register(Server::builder().options(config.server_options())).build()
}

/// HTTP routes: health checks plus the DDP WebSocket endpoint at `ddp_path`.
///
/// Serve with `into_make_service_with_connect_info::<SocketAddr>()`; the
/// WebSocket handler records the peer address.
pub fn router(server: Arc<Server>, ddp_path: &str) -> Router {
    Router::new()
        .route("/", get(|| async { "DDP Server" }))
        .route("/health", get(|| async { "OK" }))
        .route(ddp_path, get(ws_handler))
        .with_state(WsState { server })
        .layer(TraceLayer::new_for_http())
}
