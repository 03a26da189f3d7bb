//! HTTP surface: reservation CRUD, the extend/end actions, server pool
//! management, and the log line intake endpoint.

pub mod handlers;
pub mod server;

use std::sync::Arc;
use tokio::sync::mpsc;

use pkg_orchestrator::Orchestrator;
use pkg_state::registry::{ReservationRegistry, ServerRegistry};

/// Shared state for all handlers.
#[derive(Clone)]
pub struct AppState {
    pub reservations: ReservationRegistry,
    pub servers: ServerRegistry,
    pub orchestrator: Arc<Orchestrator>,
    /// Intake of the log ingestion pipeline.
    pub ingest: mpsc::Sender<String>,
}
