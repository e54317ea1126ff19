//! REST API routes for the peer registry.

use axum::routing::get;
use axum::Router;

use super::handlers::{
    delete_user, get_user, health_check, list_users, register_user, update_user, AppState,
};

/// Create the REST API router.
pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .route("/users", get(list_users).post(register_user))
        .route(
            "/users/{name}",
            get(get_user).put(update_user).delete(delete_user),
        )
        .with_state(state)
}
