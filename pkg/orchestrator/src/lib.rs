//! Serializes lifecycle-mutating operations per server.
//!
//! Every start/update/end goes through `Orchestrator::run`, which wraps
//! the transport call in the named distributed lock `server-<id>` so a
//! scheduler-driven end and a chat-triggered end cannot race, and neither
//! can interleave with a concurrent start.

use anyhow::Result;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};
use uuid::Uuid;

use pkg_state::lock::{LockService, acquire_with_retry};
use pkg_state::registry::{ReservationRegistry, ServerRegistry};
use pkg_transport::{TransportContext, TransportSelector, archive};
use pkg_types::reservation::{Reservation, ReservationStatus};
use pkg_types::server::Server;

/// A lifecycle transition executed under the server's lock.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleAction {
    Start,
    Update,
    End,
}

impl std::fmt::Display for LifecycleAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LifecycleAction::Start => write!(f, "start"),
            LifecycleAction::Update => write!(f, "update"),
            LifecycleAction::End => write!(f, "end"),
        }
    }
}

/// State-change events for outward consumers (chat bridges, dashboards).
/// A notification sink, not part of the lifecycle logic.
#[derive(Debug, Clone)]
pub enum ReservationEvent {
    Started {
        reservation_id: String,
        server_id: String,
    },
    Extended {
        reservation_id: String,
        new_ends_at: DateTime<Utc>,
    },
    Ended {
        reservation_id: String,
        server_id: String,
        duration_secs: i64,
    },
    NearlyOver {
        reservation_id: String,
    },
    FleetRefreshed,
}

pub struct Orchestrator {
    reservations: ReservationRegistry,
    servers: ServerRegistry,
    transports: Arc<dyn TransportSelector>,
    locks: Arc<dyn LockService>,
    ctx: Arc<TransportContext>,
    events: broadcast::Sender<ReservationEvent>,
    /// External identity provider for display-name refreshes after start.
    identity_url: Option<String>,
}

impl Orchestrator {
    pub fn new(
        reservations: ReservationRegistry,
        servers: ServerRegistry,
        transports: Arc<dyn TransportSelector>,
        locks: Arc<dyn LockService>,
        ctx: Arc<TransportContext>,
        identity_url: Option<String>,
    ) -> Self {
        let (events, _) = broadcast::channel(256);
        Self {
            reservations,
            servers,
            transports,
            locks,
            ctx,
            events,
            identity_url,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ReservationEvent> {
        self.events.subscribe()
    }

    /// Emit an event to outward subscribers; no receivers is fine.
    pub fn emit(&self, event: ReservationEvent) {
        let _ = self.events.send(event);
    }

    /// Execute `action` for `reservation_id` under the server's lock.
    /// Lock exhaustion surfaces as `Err`; the caller abandons the action
    /// for this tick and the next scheduler pass retries it.
    pub async fn run(&self, action: LifecycleAction, reservation_id: &str) -> Result<()> {
        let Some(reservation) = self.reservations.get(reservation_id).await? else {
            warn!("orchestrator: reservation {} vanished", reservation_id);
            return Ok(());
        };
        let Some(server) = self.servers.get(&reservation.server_id).await? else {
            anyhow::bail!(
                "reservation {} references unknown server {}",
                reservation_id,
                reservation.server_id
            );
        };

        let lock_name = format!("server-{}", server.id);
        let holder = Uuid::new_v4().to_string();
        acquire_with_retry(&*self.locks, &lock_name, &holder).await?;
        let result = self.execute(&server, action, reservation_id).await;
        if let Err(e) = self.locks.release(&lock_name, &holder).await {
            warn!("orchestrator: releasing {} failed: {}", lock_name, e);
        }
        result
    }

    /// Extend by one hour if eligible; returns the new end time.
    pub async fn extend(&self, reservation_id: &str) -> Result<DateTime<Utc>> {
        let new_ends_at = self.reservations.extend(reservation_id, Utc::now()).await?;
        info!("reservation {} extended until {}", reservation_id, new_ends_at);
        self.emit(ReservationEvent::Extended {
            reservation_id: reservation_id.to_string(),
            new_ends_at,
        });
        Ok(new_ends_at)
    }

    async fn execute(
        &self,
        server: &Server,
        action: LifecycleAction,
        reservation_id: &str,
    ) -> Result<()> {
        // Re-read under the lock: the world may have moved while we
        // waited for it.
        let Some(reservation) = self.reservations.get(reservation_id).await? else {
            return Ok(());
        };
        match action {
            LifecycleAction::Start => self.do_start(server, reservation).await,
            LifecycleAction::Update => self.do_update(server, reservation).await,
            LifecycleAction::End => self.do_end(server, reservation).await,
        }
    }

    async fn do_start(&self, server: &Server, mut reservation: Reservation) -> Result<()> {
        if reservation.status != ReservationStatus::Scheduled {
            debug!(
                "start of reservation {} skipped (status {})",
                reservation.id, reservation.status
            );
            return Ok(());
        }
        reservation.transition(ReservationStatus::Starting);
        self.reservations.put(&reservation).await?;

        let transport = self.transports.for_server(server);
        match transport.start(server, &reservation).await {
            Ok(()) => {
                reservation.transition(ReservationStatus::Active);
                self.reservations.put(&reservation).await?;
                info!(
                    "reservation {} started on server {} via {}",
                    reservation.id,
                    server.id,
                    transport.name()
                );
                self.spawn_display_name_refresh(&reservation.user_id);
                self.emit(ReservationEvent::Started {
                    reservation_id: reservation.id,
                    server_id: server.id.clone(),
                });
                Ok(())
            }
            Err(e) => {
                // Back to Scheduled so the next tick retries the start.
                reservation.transition(ReservationStatus::Scheduled);
                self.reservations.put(&reservation).await?;
                Err(e.context(format!(
                    "starting reservation on server {}",
                    server.id
                )))
            }
        }
    }

    async fn do_update(&self, server: &Server, mut reservation: Reservation) -> Result<()> {
        if reservation.status != ReservationStatus::Active {
            debug!(
                "update of reservation {} skipped (status {})",
                reservation.id, reservation.status
            );
            return Ok(());
        }
        self.transports
            .for_server(server)
            .update(server, &reservation)
            .await?;
        reservation.inactive_minutes = 0;
        self.reservations.put(&reservation).await?;
        Ok(())
    }

    async fn do_end(&self, server: &Server, mut reservation: Reservation) -> Result<()> {
        match reservation.status {
            // Idempotent: ending an ended reservation is a benign no-op
            // and must not rewrite ends_at again.
            ReservationStatus::Ended => {
                debug!("reservation {} already ended", reservation.id);
                return Ok(());
            }
            // Never provisioned: closing the booking is pure bookkeeping.
            ReservationStatus::Scheduled => {
                let now = Utc::now();
                reservation.ends_at = now;
                reservation.duration_secs = Some(0);
                reservation.transition(ReservationStatus::Ending);
                self.reservations.put(&reservation).await?;
                return self.finish_end(server, reservation).await;
            }
            _ => {}
        }

        // A record already in Ending is a recovery re-drive of a
        // teardown that died mid-flight; keep its original stamp.
        if reservation.status != ReservationStatus::Ending {
            reservation.transition(ReservationStatus::Ending);
            self.reservations.put(&reservation).await?;
        }

        // Teardown is best-effort: a failed log archive or remote cleanup
        // is recorded, never allowed to strand the server in Ending.
        let transport = self.transports.for_server(server);
        if let Err(e) = transport.end(server, &reservation).await {
            warn!(
                "teardown of reservation {} on server {} incomplete: {}",
                reservation.id, server.id, e
            );
            reservation.status_note = Some(format!("teardown incomplete: {}", e));
        }

        let now = Utc::now();
        reservation.duration_secs = Some((now - reservation.starts_at).num_seconds().max(0));
        reservation.ends_at = now;
        self.finish_end(server, reservation).await
    }

    async fn finish_end(&self, server: &Server, mut reservation: Reservation) -> Result<()> {
        reservation.transition(ReservationStatus::Ended);
        self.reservations.put(&reservation).await?;
        info!(
            "reservation {} ended on server {} (duration {}s)",
            reservation.id,
            server.id,
            reservation.duration_secs.unwrap_or(0)
        );
        self.emit(ReservationEvent::Ended {
            reservation_id: reservation.id.clone(),
            server_id: server.id.clone(),
            duration_secs: reservation.duration_secs.unwrap_or(0),
        });
        self.spawn_log_scan(reservation);
        Ok(())
    }

    /// Deferred: mine the archived bundle for participant identities.
    fn spawn_log_scan(&self, reservation: Reservation) {
        let bundle = self.ctx.bundle_path(&reservation);
        let registry = self.reservations.clone();
        tokio::spawn(async move {
            let scanned =
                tokio::task::spawn_blocking(move || archive::scan_bundle_for_players(&bundle))
                    .await;
            let players = match scanned {
                Ok(Ok(players)) => players,
                Ok(Err(e)) => {
                    debug!("log scan for {} skipped: {}", reservation.id, e);
                    return;
                }
                Err(e) => {
                    warn!("log scan task for {} panicked: {}", reservation.id, e);
                    return;
                }
            };
            if players.is_empty() {
                return;
            }
            // Re-read so we do not clobber concurrent field updates.
            match registry.get(&reservation.id).await {
                Ok(Some(mut current)) => {
                    current.players_seen = players;
                    if let Err(e) = registry.put(&current).await {
                        warn!("persisting players for {} failed: {}", reservation.id, e);
                    }
                }
                Ok(None) => {}
                Err(e) => warn!("log scan re-read for {} failed: {}", reservation.id, e),
            }
        });
    }

    /// Side job after start: refresh the owner's display name from the
    /// external identity provider. Purely best-effort.
    fn spawn_display_name_refresh(&self, user_id: &str) {
        let Some(base) = self.identity_url.clone() else {
            return;
        };
        let http = self.ctx.http.clone();
        let user_id = user_id.to_string();
        let op_timeout = self.ctx.op_timeout;
        tokio::spawn(async move {
            let url = format!("{}/users/{}", base, user_id);
            match http.get(&url).timeout(op_timeout).send().await {
                Ok(response) if response.status().is_success() => {
                    debug!("refreshed display name for {}", user_id);
                }
                Ok(response) => {
                    debug!("display name refresh for {} returned {}", user_id, response.status());
                }
                Err(e) => debug!("display name refresh for {} failed: {}", user_id, e),
            }
        });
    }
}
