//! Route definitions for the HTTP server.

use axum::{
    routing::{delete, get, post, put},
    Router,
};
use tower_http::{cors::CorsLayer, trace::TraceLayer};

use super::{handlers, state::AppState, ws};

//-------------------------------------------------------------------------------------------------
// Functions
//-------------------------------------------------------------------------------------------------

/// Creates a router with every API endpoint configured.
pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/servers", get(handlers::list_servers).post(handlers::import_server))
        .route("/servers/order", put(handlers::set_server_order))
        .route(
            "/servers/:id",
            get(handlers::get_server)
                .patch(handlers::update_server)
                .delete(handlers::delete_server),
        )
        .route("/servers/:id/start", post(handlers::start_server))
        .route("/servers/:id/stop", post(handlers::stop_server))
        .route("/servers/:id/restart", post(handlers::restart_server))
        .route(
            "/servers/:id/acknowledge-crash",
            post(handlers::acknowledge_crash),
        )
        .route("/servers/:id/update/initiate", post(handlers::initiate_update))
        .route("/servers/:id/update/apply", post(handlers::apply_update))
        .route("/servers/:id/update/cancel", post(handlers::cancel_update))
        .route(
            "/servers/:id/backups",
            get(handlers::list_backups).post(handlers::create_backup),
        )
        .route("/servers/:id/backups/:timestamp", delete(handlers::delete_backup))
        .route(
            "/servers/:id/backups/:timestamp/restore",
            post(handlers::restore_backup),
        )
        .route("/templates", get(handlers::list_templates))
        .route("/templates/:id", get(handlers::get_template))
        .route("/health", get(handlers::health))
        .route("/config", get(handlers::config))
        .route("/import/folders", get(handlers::import_folders))
        .route("/ws", get(ws::ws_handler))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}
