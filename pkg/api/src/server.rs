use axum::{
    Router,
    routing::{get, post},
};
use std::net::SocketAddr;
use tokio::net::TcpListener;
use tracing::info;

use crate::AppState;
use crate::handlers::{loglines, reservations, servers};

pub fn router(state: AppState) -> Router {
    Router::new()
        .route(
            "/api/v1/reservations",
            post(reservations::create).get(reservations::list),
        )
        .route("/api/v1/reservations/{id}", get(reservations::get_one))
        .route("/api/v1/reservations/{id}/extend", post(reservations::extend))
        .route("/api/v1/reservations/{id}/end", post(reservations::end))
        .route("/api/v1/reservations/{id}/status", get(reservations::status))
        .route(
            "/api/v1/servers",
            post(servers::upsert).get(servers::list),
        )
        .route("/api/v1/loglines", post(loglines::ingest))
        .route("/healthz", get(|| async { "ok" }))
        .with_state(state)
}

pub async fn start_server(addr: SocketAddr, state: AppState) -> anyhow::Result<()> {
    let app = router(state);
    info!("Starting API server on {}", addr);
    let listener = TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;
    Ok(())
}
