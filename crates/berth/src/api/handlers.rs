//! Request handlers.

use axum::{
    Json,
    extract::{Path, State},
};
use serde::Serialize;

use super::error::{ApiError, ApiResult};
use super::state::AppState;
use crate::session::SessionRecord;

/// Health check response.
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
}

/// GET /health
pub async fn health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

/// Registry listing for operators.
#[derive(Debug, Serialize)]
pub struct SessionsResponse {
    pub sessions: Vec<SessionRecord>,
    /// Connections currently open on this server.
    pub connections: usize,
}

/// GET /sessions
pub async fn list_sessions(State(state): State<AppState>) -> ApiResult<Json<SessionsResponse>> {
    let sessions = state.sessions.registry().list().await?;
    Ok(Json(SessionsResponse {
        sessions,
        connections: state.sessions.hub().len(),
    }))
}

/// GET /sessions/{user_id}
pub async fn get_session(
    State(state): State<AppState>,
    Path(user_id): Path<String>,
) -> ApiResult<Json<SessionRecord>> {
    state
        .sessions
        .registry()
        .lookup(&user_id)
        .await?
        .map(Json)
        .ok_or_else(|| ApiError::not_found(format!("session for {user_id}")))
}
