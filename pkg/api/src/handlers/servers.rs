use axum::{Json, extract::State, http::StatusCode, response::IntoResponse};
use tracing::{info, warn};

use crate::AppState;
use pkg_types::server::Server;

pub async fn upsert(State(state): State<AppState>, Json(server): Json<Server>) -> impl IntoResponse {
    if let Err(e) = state.servers.put(&server).await {
        warn!("Failed to store server {}: {}", server.id, e);
        return (StatusCode::INTERNAL_SERVER_ERROR, "Failed to store server").into_response();
    }
    info!("Stored server {} ({})", server.id, server.kind.label());
    (StatusCode::CREATED, Json(server)).into_response()
}

pub async fn list(State(state): State<AppState>) -> impl IntoResponse {
    match state.servers.list().await {
        Ok(servers) => (StatusCode::OK, Json(servers)).into_response(),
        Err(e) => {
            warn!("Failed to list servers: {}", e);
            (StatusCode::INTERNAL_SERVER_ERROR, "Failed to list servers").into_response()
        }
    }
}
