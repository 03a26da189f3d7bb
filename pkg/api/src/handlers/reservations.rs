use axum::{
    Json,
    extract::{Path as AxumPath, State},
    http::StatusCode,
    response::{IntoResponse, Response},
};
use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{info, warn};

use crate::AppState;
use pkg_orchestrator::LifecycleAction;
use pkg_types::reservation::{ReservationRequest, ReservationStatus, ValidationError};

#[derive(Serialize)]
struct ErrorBody {
    error: String,
}

/// Booking-rule rejections become a 422 with the specific reason;
/// anything else is a 500 with no detail leaked.
fn error_response(context: &str, e: anyhow::Error) -> Response {
    match e.downcast_ref::<ValidationError>() {
        Some(ve) => (
            StatusCode::UNPROCESSABLE_ENTITY,
            Json(ErrorBody {
                error: ve.to_string(),
            }),
        )
            .into_response(),
        None => {
            warn!("{}: {}", context, e);
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(ErrorBody {
                    error: "internal error".into(),
                }),
            )
                .into_response()
        }
    }
}

fn not_found(what: &str) -> Response {
    (
        StatusCode::NOT_FOUND,
        Json(ErrorBody {
            error: format!("{} not found", what),
        }),
    )
        .into_response()
}

pub async fn create(
    State(state): State<AppState>,
    Json(req): Json<ReservationRequest>,
) -> Response {
    let server = match state.servers.get(&req.server_id).await {
        Ok(Some(server)) => server,
        Ok(None) => return not_found("server"),
        Err(e) => return error_response("loading server", e),
    };
    match state.reservations.create(&req, &server).await {
        Ok(reservation) => {
            info!(
                "created reservation {} on server {} for {}",
                reservation.id, reservation.server_id, reservation.user_id
            );
            // Window already open: start now instead of waiting for the
            // next scheduler tick. The caller gets the Scheduled record
            // back; status flips once provisioning completes.
            if reservation.is_current(Utc::now()) {
                let orchestrator = state.orchestrator.clone();
                let id = reservation.id.clone();
                tokio::spawn(async move {
                    if let Err(e) = orchestrator.run(LifecycleAction::Start, &id).await {
                        warn!("instant start of reservation {} failed: {}", id, e);
                    }
                });
            }
            (StatusCode::CREATED, Json(reservation)).into_response()
        }
        Err(e) => error_response("creating reservation", e),
    }
}

pub async fn list(State(state): State<AppState>) -> Response {
    match state.reservations.list().await {
        Ok(reservations) => (StatusCode::OK, Json(reservations)).into_response(),
        Err(e) => error_response("listing reservations", e),
    }
}

pub async fn get_one(State(state): State<AppState>, AxumPath(id): AxumPath<String>) -> Response {
    match state.reservations.get(&id).await {
        Ok(Some(reservation)) => (StatusCode::OK, Json(reservation)).into_response(),
        Ok(None) => not_found("reservation"),
        Err(e) => error_response("loading reservation", e),
    }
}

#[derive(Serialize)]
struct ExtendResponse {
    ends_at: DateTime<Utc>,
}

pub async fn extend(State(state): State<AppState>, AxumPath(id): AxumPath<String>) -> Response {
    match state.reservations.get(&id).await {
        Ok(Some(_)) => {}
        Ok(None) => return not_found("reservation"),
        Err(e) => return error_response("loading reservation", e),
    }
    match state.orchestrator.extend(&id).await {
        Ok(ends_at) => (StatusCode::OK, Json(ExtendResponse { ends_at })).into_response(),
        Err(e) => error_response("extending reservation", e),
    }
}

pub async fn end(State(state): State<AppState>, AxumPath(id): AxumPath<String>) -> Response {
    match state.reservations.get(&id).await {
        Ok(Some(_)) => {}
        Ok(None) => return not_found("reservation"),
        Err(e) => return error_response("loading reservation", e),
    }
    if let Err(e) = state.orchestrator.run(LifecycleAction::End, &id).await {
        return error_response("ending reservation", e);
    }
    match state.reservations.get(&id).await {
        Ok(Some(reservation)) => (StatusCode::OK, Json(reservation)).into_response(),
        Ok(None) => not_found("reservation"),
        Err(e) => error_response("re-loading reservation", e),
    }
}

#[derive(Serialize)]
struct StatusResponse {
    id: String,
    server_id: String,
    status: ReservationStatus,
    ends_at: DateTime<Utc>,
    time_remaining_secs: i64,
    last_player_count: u32,
    status_note: Option<String>,
}

/// Read-only snapshot backed directly by the reservation record.
pub async fn status(State(state): State<AppState>, AxumPath(id): AxumPath<String>) -> Response {
    match state.reservations.get(&id).await {
        Ok(Some(r)) => {
            let remaining = r.time_remaining(Utc::now()).num_seconds().max(0);
            (
                StatusCode::OK,
                Json(StatusResponse {
                    id: r.id,
                    server_id: r.server_id,
                    status: r.status,
                    ends_at: r.ends_at,
                    time_remaining_secs: remaining,
                    last_player_count: r.last_player_count,
                    status_note: r.status_note,
                }),
            )
                .into_response()
        }
        Ok(None) => not_found("reservation"),
        Err(e) => error_response("loading reservation", e),
    }
}
