//! REST API handlers for the peer registry.
//!
//! Each handler is a thin translation of one HTTP call into one
//! [`AddressRegistry`] operation.

use std::collections::BTreeMap;
use std::sync::Arc;

use axum::extract::rejection::JsonRejection;
use axum::extract::{Path, State};
use axum::Json;
use log::debug;

use super::types::{StatusResponse, UpdateUserRequest};
use crate::error::{RegistryError, Result};
use crate::registry::AddressRegistry;
use crate::types::{Address, UserInfo};

/// Shared state for handlers.
#[derive(Clone)]
pub struct AppState {
    pub registry: Arc<AddressRegistry>,
}

impl AppState {
    pub fn new(registry: Arc<AddressRegistry>) -> Self {
        Self { registry }
    }
}

/// `GET /health`
pub async fn health_check() -> Json<StatusResponse> {
    Json(StatusResponse::ok())
}

/// Register a new user.
///
/// # Endpoint
/// `POST /users` with a [`UserInfo`] body.
///
/// # Returns
/// - `200 OK` on success
/// - `400 Bad Request` for a malformed body, name or address
/// - `409 Conflict` if the name is already registered
pub async fn register_user(
    State(state): State<AppState>,
    payload: std::result::Result<Json<UserInfo>, JsonRejection>,
) -> Result<Json<StatusResponse>> {
    let Json(user) = payload.map_err(bad_request)?;
    state.registry.register(&user.name, user.address).await?;
    Ok(Json(StatusResponse::ok()))
}

/// `GET /users`: every registered name with its address.
pub async fn list_users(State(state): State<AppState>) -> Json<BTreeMap<String, Address>> {
    Json(state.registry.list().await)
}

/// `GET /users/{name}`: `404` if unknown.
pub async fn get_user(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> Result<Json<Address>> {
    Ok(Json(state.registry.lookup(&name).await?))
}

/// Create or replace a user's address.
///
/// # Endpoint
/// `PUT /users/{name}` with an address body.
///
/// # Returns
/// - `200 OK` on success
/// - `400 Bad Request` for a malformed body, name or address
pub async fn update_user(
    State(state): State<AppState>,
    Path(name): Path<String>,
    payload: std::result::Result<Json<UpdateUserRequest>, JsonRejection>,
) -> Result<Json<StatusResponse>> {
    let Json(request) = payload.map_err(bad_request)?;
    state.registry.upsert(&name, request.address()).await?;
    Ok(Json(StatusResponse::ok()))
}

/// `DELETE /users/{name}`: always `200`, whether or not the user existed.
pub async fn delete_user(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> Json<StatusResponse> {
    state.registry.unregister(&name).await;
    Json(StatusResponse::ok())
}

fn bad_request(rejection: JsonRejection) -> RegistryError {
    debug!("Rejected request body: {}", rejection.body_text());
    RegistryError::InvalidRequest(rejection.body_text())
}
