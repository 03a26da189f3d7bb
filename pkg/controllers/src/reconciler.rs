//! The reconciliation scheduler.
//!
//! One loop drives every reservation toward its desired state: stalled
//! transitions are repaired, expired reservations are ended, due ones
//! are started, active ones get an occupancy probe and a nearly-over
//! warning, old ended rows are purged, and the idle fleet is refreshed.
//! Each pass is warn-and-continue; a failed action is retried naturally
//! on the next tick.

use chrono::Utc;
use futures_util::future::join_all;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::fleet::FleetProbe;
use crate::occupancy::{end_decision, record_observation};
use pkg_constants::lifecycle::{ENDED_RETENTION_DAYS, NEARLY_OVER_WARN_MINS, TICK_SECS};
use pkg_constants::state::LOCK_TTL_SECS;
use pkg_orchestrator::{LifecycleAction, Orchestrator, ReservationEvent};
use pkg_rcon::RconClient;
use pkg_state::lock::LockService;
use pkg_state::registry::{ReservationRegistry, ServerRegistry};
use pkg_transport::{Occupancy, TransportContext, TransportSelector};
use pkg_types::reservation::{Reservation, ReservationStatus};
use pkg_types::server::Server;

pub struct ReconciliationScheduler {
    reservations: ReservationRegistry,
    servers: ServerRegistry,
    orchestrator: Arc<Orchestrator>,
    transports: Arc<dyn TransportSelector>,
    locks: Arc<dyn LockService>,
    ctx: Arc<TransportContext>,
    fleet: FleetProbe,
    tick: Duration,
}

impl ReconciliationScheduler {
    pub fn new(
        reservations: ReservationRegistry,
        servers: ServerRegistry,
        orchestrator: Arc<Orchestrator>,
        transports: Arc<dyn TransportSelector>,
        locks: Arc<dyn LockService>,
        ctx: Arc<TransportContext>,
        tick: Option<Duration>,
    ) -> Self {
        let fleet = FleetProbe::new(servers.clone(), reservations.clone(), ctx.clone());
        Self {
            reservations,
            servers,
            orchestrator,
            transports,
            locks,
            ctx,
            fleet,
            tick: tick.unwrap_or(Duration::from_secs(TICK_SECS)),
        }
    }

    /// Start the scheduler loop as a background task.
    pub fn start(self) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            info!(
                "ReconciliationScheduler started (tick={}s)",
                self.tick.as_secs()
            );
            let mut interval = tokio::time::interval(self.tick);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                interval.tick().await;
                if let Err(e) = self.reconcile().await {
                    warn!("ReconciliationScheduler pass error: {}", e);
                }
            }
        })
    }

    /// One full pass. Recovery first so a repaired record is actionable
    /// in the same tick; expiry before start, so a server freed this tick
    /// is immediately startable for the next booking.
    pub async fn reconcile(&self) -> anyhow::Result<()> {
        let now = Utc::now();

        self.recover_stalled(now).await?;

        for reservation in self.reservations.past_end(now).await? {
            info!("reservation {} past its end time, ending", reservation.id);
            if let Err(e) = self
                .orchestrator
                .run(LifecycleAction::End, &reservation.id)
                .await
            {
                warn!("ending reservation {} failed: {}", reservation.id, e);
            }
        }

        for reservation in self.reservations.due_to_start(now).await? {
            info!("reservation {} due, starting", reservation.id);
            if let Err(e) = self
                .orchestrator
                .run(LifecycleAction::Start, &reservation.id)
                .await
            {
                warn!("starting reservation {} failed: {}", reservation.id, e);
            }
        }

        // Probes block on remote servers; fan them out so one slow box
        // does not starve the rest of the pass.
        let active = self.reservations.active(Utc::now()).await?;
        join_all(active.into_iter().map(|r| self.occupancy_pass(r))).await;

        let purged = self
            .reservations
            .purge_ended_before(now - chrono::Duration::days(ENDED_RETENTION_DAYS))
            .await?;
        if purged > 0 {
            info!("purged {} reservations past the retention window", purged);
        }

        let rewritten = self.fleet.refresh(Utc::now()).await?;
        if rewritten > 0 {
            debug!("fleet refresh rewrote {} server records", rewritten);
        }
        self.orchestrator.emit(ReservationEvent::FleetRefreshed);
        Ok(())
    }

    /// Repair transitional records stranded by a crash between the
    /// transition write and the completing one: a stale `Starting` goes
    /// back to `Scheduled` for a retried start, a stale `Ending` gets its
    /// teardown re-driven to `Ended`.
    async fn recover_stalled(&self, now: chrono::DateTime<Utc>) -> anyhow::Result<()> {
        for reservation in self
            .reservations
            .stuck_in_transition(now, LOCK_TTL_SECS)
            .await?
        {
            match reservation.status {
                ReservationStatus::Starting => {
                    info!(
                        "reservation {} stalled in Starting, rescheduling",
                        reservation.id
                    );
                    self.reschedule(&reservation).await;
                }
                ReservationStatus::Ending => {
                    info!(
                        "reservation {} stalled in Ending, re-driving teardown",
                        reservation.id
                    );
                    if let Err(e) = self
                        .orchestrator
                        .run(LifecycleAction::End, &reservation.id)
                        .await
                    {
                        warn!("re-driving end of {} failed: {}", reservation.id, e);
                    }
                }
                _ => {}
            }
        }
        Ok(())
    }

    /// Flip a stalled `Starting` record back to `Scheduled` under the
    /// server lock, re-checking it is still stalled once the lock is held.
    async fn reschedule(&self, reservation: &Reservation) {
        let lock_name = format!("server-{}", reservation.server_id);
        let holder = Uuid::new_v4().to_string();
        match self.locks.try_acquire(&lock_name, &holder).await {
            Ok(true) => {}
            // held: an orchestrator call is working on it after all
            Ok(false) => return,
            Err(e) => {
                warn!("lock for rescheduling {} failed: {}", reservation.id, e);
                return;
            }
        }
        match self.reservations.get(&reservation.id).await {
            Ok(Some(mut current)) if current.status == ReservationStatus::Starting => {
                current.transition(ReservationStatus::Scheduled);
                if let Err(e) = self.reservations.put(&current).await {
                    warn!("rescheduling {} failed: {}", current.id, e);
                }
            }
            Ok(_) => {}
            Err(e) => warn!("re-reading reservation {}: {}", reservation.id, e),
        }
        if let Err(e) = self.locks.release(&lock_name, &holder).await {
            warn!("releasing {} failed: {}", lock_name, e);
        }
    }

    async fn occupancy_pass(&self, reservation: Reservation) {
        let server = match self.servers.get(&reservation.server_id).await {
            Ok(Some(server)) => server,
            Ok(None) => {
                warn!(
                    "reservation {} references unknown server {}",
                    reservation.id, reservation.server_id
                );
                return;
            }
            Err(e) => {
                warn!("loading server for reservation {}: {}", reservation.id, e);
                return;
            }
        };

        let obs = self
            .transports
            .for_server(&server)
            .observe(&server, &reservation)
            .await;

        // Counters are written under the server lock so an end committing
        // concurrently can never be overwritten by this probe's persist.
        let lock_name = format!("server-{}", server.id);
        let holder = Uuid::new_v4().to_string();
        match self.locks.try_acquire(&lock_name, &holder).await {
            Ok(true) => {}
            Ok(false) => {
                debug!(
                    "occupancy for reservation {} skipped: server {} busy",
                    reservation.id, server.id
                );
                return;
            }
            Err(e) => {
                warn!("lock for occupancy on server {} failed: {}", server.id, e);
                return;
            }
        }
        let persisted = self.persist_observation(&server, &reservation.id, obs).await;
        if let Err(e) = self.locks.release(&lock_name, &holder).await {
            warn!("releasing {} failed: {}", lock_name, e);
        }

        let Some(current) = persisted else { return };
        if let Some(reason) = end_decision(&current, obs, Utc::now()) {
            info!("reservation {} ending early: {}", current.id, reason);
            if let Err(e) = self.orchestrator.run(LifecycleAction::End, &current.id).await {
                warn!("early end of reservation {} failed: {}", current.id, e);
            }
        }
    }

    /// Re-read under the lock and write counters only onto a record that
    /// is still `Active`; anything else means an end (or extension reset)
    /// won the race while the probe was out.
    async fn persist_observation(
        &self,
        server: &Server,
        reservation_id: &str,
        obs: Occupancy,
    ) -> Option<Reservation> {
        let mut current = match self.reservations.get(reservation_id).await {
            Ok(Some(r)) if r.status == ReservationStatus::Active => r,
            Ok(_) => return None,
            Err(e) => {
                warn!("re-reading reservation {}: {}", reservation_id, e);
                return None;
            }
        };

        let now = Utc::now();
        let tick_mins = (self.tick.as_secs() / 60).max(1) as u32;
        record_observation(&mut current, obs, tick_mins);
        if obs.occupied {
            // Warning an empty server is pointless; the occupied branch
            // is the only one with an audience.
            self.maybe_warn_nearly_over(&server.addr(), &mut current, now)
                .await;
        }

        if let Err(e) = self.reservations.put(&current).await {
            warn!("persisting occupancy for {} failed: {}", current.id, e);
            return None;
        }
        Some(current)
    }

    /// One-time in-game warning shortly before the reservation expires.
    /// The flag is reset when an extension lands, so a later approach to
    /// the (new) end time warns again.
    async fn maybe_warn_nearly_over(
        &self,
        addr: &str,
        reservation: &mut Reservation,
        now: chrono::DateTime<Utc>,
    ) {
        let remaining = reservation.time_remaining(now);
        if reservation.warned_nearly_over
            || remaining <= chrono::Duration::zero()
            || remaining > chrono::Duration::minutes(NEARLY_OVER_WARN_MINS)
        {
            return;
        }
        let minutes = remaining.num_minutes().max(1);
        let message = format!(
            "Reservation ends in {} minutes. Say !extend for another hour.",
            minutes
        );
        match RconClient::connect(addr, &reservation.rcon_password, self.ctx.op_timeout).await {
            Ok(mut client) => {
                if let Err(e) = client.say(&message).await {
                    warn!("nearly-over warning for {} failed: {}", reservation.id, e);
                    return;
                }
            }
            Err(e) => {
                warn!("nearly-over warning for {} failed: {}", reservation.id, e);
                return;
            }
        }
        reservation.warned_nearly_over = true;
        self.orchestrator.emit(ReservationEvent::NearlyOver {
            reservation_id: reservation.id.clone(),
        });
    }
}
