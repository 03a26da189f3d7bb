use axum::{extract::State, http::StatusCode, response::IntoResponse};
use tracing::warn;

use crate::AppState;

/// Log line intake: a plain-text body, one tagged line per row, fed to
/// the ingestion pipeline. Attribution and dropping happen downstream.
pub async fn ingest(State(state): State<AppState>, body: String) -> impl IntoResponse {
    let mut accepted = 0usize;
    for line in body.lines() {
        if line.is_empty() {
            continue;
        }
        if state.ingest.send(line.to_string()).await.is_err() {
            warn!("log pipeline is down, rejecting intake");
            return (StatusCode::SERVICE_UNAVAILABLE, "pipeline unavailable").into_response();
        }
        accepted += 1;
    }
    (StatusCode::ACCEPTED, format!("{}", accepted)).into_response()
}
