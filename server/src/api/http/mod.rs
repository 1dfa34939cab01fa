//! HTTP API handlers

mod dev_server;
mod events;
mod health;
mod mcp;
mod origin;
mod processes;
mod pty;
mod repair;

use axum::{
    middleware,
    routing::{delete, get, post},
    Router,
};
use tower_http::trace::TraceLayer;

use crate::AppState;

/// Create the HTTP router with all routes
pub fn create_router(state: AppState) -> Router {
    let cors = origin::cors_layer(&state.config.allowed_origins);

    let api_routes = Router::new()
        // Health check
        .route("/health", get(health::health_check))
        // PTY routes
        .route("/pty", post(pty::create_pty))
        .route("/pty", get(pty::list_ptys))
        .route("/pty/{id}", get(pty::get_pty))
        .route("/pty/{id}", delete(pty::kill_pty))
        .route("/pty/{id}/ws", get(pty::pty_websocket))
        .route("/pty/{id}/input", post(pty::write_input))
        .route("/pty/{id}/resize", post(pty::resize_pty))
        .route("/pty/{id}/cwd", post(pty::set_cwd))
        // Dev server routes
        .route("/dev-servers", get(dev_server::list_dev_servers))
        .route("/dev-servers/start", post(dev_server::start_dev_server))
        .route("/dev-servers/stop", post(dev_server::stop_dev_server))
        .route("/dev-servers/status", get(dev_server::dev_server_status))
        .route("/dev-servers/events", get(dev_server::dev_server_events))
        // Repair routes
        .route("/repairs", get(repair::list_repairs))
        .route("/repairs/abort", post(repair::abort_repair))
        .route("/repairs/{repair_id}/events", get(repair::repair_events))
        .route("/repairs/{repair_id}/signal", post(repair::agent_signal))
        // MCP session routes
        .route("/mcp/sessions", post(mcp::open_session))
        .route("/mcp/sessions", get(mcp::list_sessions))
        .route(
            "/mcp/sessions/{id}",
            delete(mcp::close_session).fallback(mcp::touch_session),
        )
        // Process tracker
        .route("/processes", get(processes::list_processes))
        // Event stream
        .route("/events", get(events::event_stream))
        .layer(middleware::from_fn_with_state(
            state.clone(),
            mcp::refresh_session_header,
        ))
        .layer(middleware::from_fn_with_state(
            state.clone(),
            origin::require_allowed_origin,
        ));

    Router::new()
        .nest("/api/v1", api_routes)
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}
