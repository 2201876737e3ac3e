//! Admin API behind a bearer token: status, purge, lock cleanup and store maintenance.

pub mod auth;
pub mod handlers;

use axum::{
    middleware,
    routing::{get, post},
    Router,
};

use self::auth::admin_auth_middleware;
use self::handlers::*;
use crate::http::server::AppState;

pub fn setup_admin_router(state: AppState) -> Router {
    Router::new()
        .route("/admin/status", get(get_status))
        .route("/admin/purge", post(purge))
        .route("/admin/cleanup", post(cleanup))
        .route("/admin/prune", post(prune))
        .route("/admin/clear", post(clear))
        .route("/admin/invalidate-tags", post(invalidate_tags))
        .layer(middleware::from_fn_with_state(state.clone(), admin_auth_middleware))
        .with_state(state)
}
