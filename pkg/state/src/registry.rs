use chrono::{DateTime, Duration, Utc};
use uuid::Uuid;

use crate::client::StateStore;
use pkg_constants::lifecycle::{EXTENSION_ELIGIBLE_MINS, EXTENSION_HOURS};
use pkg_constants::state::{RESERVATION_PREFIX, SERVER_PREFIX};
use pkg_types::reservation::{
    Reservation, ReservationRequest, ReservationStatus, ValidationError, validate_window,
};
use pkg_types::server::Server;

// --- Pure booking rules ---
// Kept free of the store so the collision matrix is testable in isolation.

/// Reject a booking request that collides with existing reservations or
/// violates authorization. `existing` is every non-ended reservation.
pub fn check_booking(
    req: &ReservationRequest,
    server: &Server,
    existing: &[Reservation],
) -> Result<(), ValidationError> {
    if !server.active {
        return Err(ValidationError::ServerInactive);
    }
    if !server.allows_user(&req.user_groups) {
        return Err(ValidationError::NotAuthorized);
    }
    validate_window(req.starts_at, req.ends_at)?;

    for r in existing {
        if r.status.is_terminal() || !r.overlaps(req.starts_at, req.ends_at) {
            continue;
        }
        if r.server_id == req.server_id {
            return Err(ValidationError::ServerOverlap);
        }
        if r.user_id == req.user_id {
            return Err(ValidationError::UserOverlap);
        }
    }
    Ok(())
}

/// Compute the extended end time, or reject. Extension is granted only
/// when under an hour remains and the extra hour collides with nothing on
/// this server (the reservation itself is excluded from the check).
pub fn check_extension(
    reservation: &Reservation,
    existing: &[Reservation],
    now: DateTime<Utc>,
) -> Result<DateTime<Utc>, ValidationError> {
    if reservation.status.is_terminal() {
        return Err(ValidationError::AlreadyEnded);
    }
    if reservation.time_remaining(now) >= Duration::minutes(EXTENSION_ELIGIBLE_MINS) {
        return Err(ValidationError::NotExtendable);
    }
    let new_end = reservation.ends_at + Duration::hours(EXTENSION_HOURS);
    let conflict = existing.iter().any(|r| {
        r.id != reservation.id
            && !r.status.is_terminal()
            && r.server_id == reservation.server_id
            && r.overlaps(reservation.ends_at, new_end)
    });
    if conflict {
        return Err(ValidationError::NotExtendable);
    }
    Ok(new_end)
}

// --- Reservation registry ---

/// Typed reservation CRUD over the state store.
#[derive(Clone)]
pub struct ReservationRegistry {
    store: StateStore,
}

impl ReservationRegistry {
    pub fn new(store: StateStore) -> Self {
        Self { store }
    }

    fn key(id: &str) -> String {
        format!("{}{}", RESERVATION_PREFIX, id)
    }

    pub async fn get(&self, id: &str) -> anyhow::Result<Option<Reservation>> {
        self.store.get_json(&Self::key(id)).await
    }

    pub async fn put(&self, reservation: &Reservation) -> anyhow::Result<()> {
        self.store.put_json(&Self::key(&reservation.id), reservation).await
    }

    pub async fn delete(&self, id: &str) -> anyhow::Result<()> {
        self.store.delete(&Self::key(id)).await
    }

    pub async fn list(&self) -> anyhow::Result<Vec<Reservation>> {
        self.store.list_json(RESERVATION_PREFIX).await
    }

    /// Validate and persist a new reservation. Validation failures come
    /// back as `ValidationError` inside the anyhow chain so the API layer
    /// can map them to a 422.
    pub async fn create(
        &self,
        req: &ReservationRequest,
        server: &Server,
    ) -> anyhow::Result<Reservation> {
        let existing = self.list().await?;
        check_booking(req, server, &existing)?;

        let reservation = Reservation {
            id: Uuid::new_v4().to_string(),
            user_id: req.user_id.clone(),
            server_id: req.server_id.clone(),
            starts_at: req.starts_at,
            ends_at: req.ends_at,
            password: req.password.clone().unwrap_or_else(short_token),
            rcon_password: req.rcon_password.clone().unwrap_or_else(short_token),
            tv_password: req.tv_password.clone().unwrap_or_else(short_token),
            map_name: req.map_name.clone(),
            log_secret: Reservation::generate_secret(),
            status: ReservationStatus::Scheduled,
            status_changed_at: Some(Utc::now()),
            auto_end: req.auto_end,
            inactive_minutes: 0,
            last_player_count: 0,
            was_occupied: false,
            warned_nearly_over: false,
            duration_secs: None,
            status_note: None,
            players_seen: vec![],
            created_at: Utc::now(),
        };
        self.put(&reservation).await?;
        Ok(reservation)
    }

    /// The extension counterpart of `create`; returns the new end time.
    pub async fn extend(&self, id: &str, now: DateTime<Utc>) -> anyhow::Result<DateTime<Utc>> {
        let reservation = self
            .get(id)
            .await?
            .ok_or_else(|| anyhow::anyhow!("reservation {} not found", id))?;
        let existing = self.list().await?;
        let new_end = check_extension(&reservation, &existing, now)?;
        let mut updated = reservation;
        updated.ends_at = new_end;
        updated.warned_nearly_over = false;
        self.put(&updated).await?;
        Ok(new_end)
    }

    pub async fn find_by_secret(&self, secret: &str) -> anyhow::Result<Option<Reservation>> {
        Ok(self
            .list()
            .await?
            .into_iter()
            .find(|r| !r.status.is_terminal() && r.log_secret == secret))
    }

    /// The non-ended reservation whose window contains `now`, if any.
    pub async fn current_for_server(
        &self,
        server_id: &str,
        now: DateTime<Utc>,
    ) -> anyhow::Result<Option<Reservation>> {
        Ok(self.list().await?.into_iter().find(|r| {
            r.server_id == server_id && !r.status.is_terminal() && r.is_current(now)
        }))
    }

    /// Scheduled reservations whose window has opened.
    pub async fn due_to_start(&self, now: DateTime<Utc>) -> anyhow::Result<Vec<Reservation>> {
        Ok(self
            .list()
            .await?
            .into_iter()
            .filter(|r| r.status == ReservationStatus::Scheduled && r.is_current(now))
            .collect())
    }

    /// Provisioned reservations whose window has closed. `Starting` and
    /// `Ending` are skipped: an orchestrator call is already in flight.
    pub async fn past_end(&self, now: DateTime<Utc>) -> anyhow::Result<Vec<Reservation>> {
        Ok(self
            .list()
            .await?
            .into_iter()
            .filter(|r| r.status == ReservationStatus::Active && r.ends_at <= now)
            .collect())
    }

    /// Provisioned reservations currently inside their window.
    pub async fn active(&self, now: DateTime<Utc>) -> anyhow::Result<Vec<Reservation>> {
        Ok(self
            .list()
            .await?
            .into_iter()
            .filter(|r| r.status == ReservationStatus::Active && r.is_current(now))
            .collect())
    }

    /// Transitional records whose last status change predates `ttl_secs`:
    /// the orchestrator call that owned them died mid-flight. A missing
    /// stamp counts as stale; recovery is idempotent either way.
    pub async fn stuck_in_transition(
        &self,
        now: DateTime<Utc>,
        ttl_secs: u64,
    ) -> anyhow::Result<Vec<Reservation>> {
        let cutoff = now - Duration::seconds(ttl_secs as i64);
        Ok(self
            .list()
            .await?
            .into_iter()
            .filter(|r| {
                matches!(
                    r.status,
                    ReservationStatus::Starting | ReservationStatus::Ending
                ) && r.status_changed_at.is_none_or(|t| t < cutoff)
            })
            .collect())
    }

    /// Drop ended rows whose actual end time predates `cutoff`. Returns
    /// how many were purged.
    pub async fn purge_ended_before(&self, cutoff: DateTime<Utc>) -> anyhow::Result<usize> {
        let mut purged = 0;
        for r in self.list().await? {
            if r.status.is_terminal() && r.ends_at < cutoff {
                self.delete(&r.id).await?;
                purged += 1;
            }
        }
        Ok(purged)
    }
}

fn short_token() -> String {
    Uuid::new_v4().simple().to_string()[..12].to_string()
}

// --- Server registry ---

#[derive(Clone)]
pub struct ServerRegistry {
    store: StateStore,
}

impl ServerRegistry {
    pub fn new(store: StateStore) -> Self {
        Self { store }
    }

    fn key(id: &str) -> String {
        format!("{}{}", SERVER_PREFIX, id)
    }

    pub async fn get(&self, id: &str) -> anyhow::Result<Option<Server>> {
        self.store.get_json(&Self::key(id)).await
    }

    pub async fn put(&self, server: &Server) -> anyhow::Result<()> {
        self.store.put_json(&Self::key(&server.id), server).await
    }

    pub async fn list(&self) -> anyhow::Result<Vec<Server>> {
        self.store.list_json(SERVER_PREFIX).await
    }

    pub async fn active(&self) -> anyhow::Result<Vec<Server>> {
        Ok(self.list().await?.into_iter().filter(|s| s.active).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pkg_types::server::ServerKind;

    fn t(mins: i64) -> DateTime<Utc> {
        DateTime::parse_from_rfc3339("2026-01-01T00:00:00Z").unwrap().with_timezone(&Utc)
            + Duration::minutes(mins)
    }

    fn make_server(id: &str, groups: &[&str]) -> Server {
        Server {
            id: id.into(),
            name: id.into(),
            ip: "203.0.113.7".into(),
            port: 27015,
            rcon_password: "standing".into(),
            kind: ServerKind::RconOnly,
            active: true,
            groups: groups.iter().map(|g| g.to_string()).collect(),
            sdr_endpoint: None,
            version: None,
            update_status: None,
            reachable: true,
            last_checked_at: None,
            created_at: t(0),
        }
    }

    fn make_reservation(id: &str, user: &str, server: &str, s: i64, e: i64) -> Reservation {
        Reservation {
            id: id.into(),
            user_id: user.into(),
            server_id: server.into(),
            starts_at: t(s),
            ends_at: t(e),
            password: "pw".into(),
            rcon_password: "rcon".into(),
            tv_password: "tv".into(),
            map_name: None,
            log_secret: Reservation::generate_secret(),
            status: ReservationStatus::Scheduled,
            status_changed_at: None,
            auto_end: false,
            inactive_minutes: 0,
            last_player_count: 0,
            was_occupied: false,
            warned_nearly_over: false,
            duration_secs: None,
            status_note: None,
            players_seen: vec![],
            created_at: t(0),
        }
    }

    fn make_request(user: &str, server: &str, s: i64, e: i64) -> ReservationRequest {
        ReservationRequest {
            user_id: user.into(),
            user_groups: vec![],
            server_id: server.into(),
            starts_at: t(s),
            ends_at: t(e),
            password: None,
            rcon_password: None,
            tv_password: None,
            map_name: None,
            auto_end: false,
        }
    }

    #[test]
    fn booking_rejects_server_overlap() {
        let server = make_server("s1", &[]);
        let existing = vec![make_reservation("r1", "[U:1:1]", "s1", 60, 120)];

        for (s, e) in [(30, 90), (90, 150), (70, 110), (0, 180)] {
            let req = make_request("[U:1:2]", "s1", s, e);
            assert_eq!(
                check_booking(&req, &server, &existing),
                Err(ValidationError::ServerOverlap),
                "window [{s},{e})"
            );
        }
        // back-to-back is fine
        let req = make_request("[U:1:2]", "s1", 120, 180);
        assert!(check_booking(&req, &server, &existing).is_ok());
    }

    #[test]
    fn booking_rejects_user_overlap_across_servers() {
        let server = make_server("s2", &[]);
        let existing = vec![make_reservation("r1", "[U:1:1]", "s1", 60, 120)];
        let req = make_request("[U:1:1]", "s2", 90, 150);
        assert_eq!(
            check_booking(&req, &server, &existing),
            Err(ValidationError::UserOverlap)
        );
    }

    #[test]
    fn booking_ignores_ended_reservations() {
        let server = make_server("s1", &[]);
        let mut ended = make_reservation("r1", "[U:1:1]", "s1", 60, 120);
        ended.status = ReservationStatus::Ended;
        let req = make_request("[U:1:2]", "s1", 60, 120);
        assert!(check_booking(&req, &server, &[ended]).is_ok());
    }

    #[test]
    fn booking_enforces_groups_and_active_flag() {
        let restricted = make_server("s1", &["donors"]);
        let req = make_request("[U:1:2]", "s1", 0, 60);
        assert_eq!(
            check_booking(&req, &restricted, &[]),
            Err(ValidationError::NotAuthorized)
        );

        let mut member = req.clone();
        member.user_groups = vec!["donors".into()];
        assert!(check_booking(&member, &restricted, &[]).is_ok());

        let mut inactive = make_server("s2", &[]);
        inactive.active = false;
        let req = make_request("[U:1:2]", "s2", 0, 60);
        assert_eq!(
            check_booking(&req, &inactive, &[]),
            Err(ValidationError::ServerInactive)
        );
    }

    #[test]
    fn extension_only_under_an_hour_remaining() {
        let r = make_reservation("r1", "[U:1:1]", "s1", 0, 120);

        // 65 minutes remaining: too early
        assert_eq!(
            check_extension(&r, &[], t(55)),
            Err(ValidationError::NotExtendable)
        );
        // 55 minutes remaining: granted, +1h
        assert_eq!(check_extension(&r, &[], t(65)), Ok(t(180)));
    }

    #[test]
    fn extension_blocked_by_follow_up_booking() {
        let r = make_reservation("r1", "[U:1:1]", "s1", 0, 120);
        let follow_up = make_reservation("r2", "[U:1:2]", "s1", 150, 210);
        assert_eq!(
            check_extension(&r, &[r.clone(), follow_up], t(65)),
            Err(ValidationError::NotExtendable)
        );

        // A follow-up on a different server does not block.
        let elsewhere = make_reservation("r3", "[U:1:2]", "s2", 150, 210);
        assert_eq!(check_extension(&r, &[r.clone(), elsewhere], t(65)), Ok(t(180)));
    }

    #[test]
    fn extension_rejected_for_ended_reservation() {
        let mut r = make_reservation("r1", "[U:1:1]", "s1", 0, 120);
        r.status = ReservationStatus::Ended;
        assert_eq!(
            check_extension(&r, &[], t(65)),
            Err(ValidationError::AlreadyEnded)
        );
    }

    async fn temp_registry() -> (ReservationRegistry, StateStore) {
        let dir = std::env::temp_dir().join(format!("slotd-registry-{}", Uuid::new_v4()));
        let store = StateStore::open(dir.to_str().unwrap()).await.unwrap();
        (ReservationRegistry::new(store.clone()), store)
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn stuck_transitional_records_are_found() {
        let (registry, store) = temp_registry().await;
        let now = Utc::now();

        let mut stale_start = make_reservation("r1", "[U:1:1]", "s1", 0, 120);
        stale_start.status = ReservationStatus::Starting;
        stale_start.status_changed_at = Some(now - Duration::seconds(300));
        registry.put(&stale_start).await.unwrap();

        let mut fresh_start = make_reservation("r2", "[U:1:2]", "s2", 0, 120);
        fresh_start.status = ReservationStatus::Starting;
        fresh_start.status_changed_at = Some(now);
        registry.put(&fresh_start).await.unwrap();

        // no stamp at all: treated as stale
        let mut unstamped_end = make_reservation("r3", "[U:1:3]", "s3", 0, 120);
        unstamped_end.status = ReservationStatus::Ending;
        registry.put(&unstamped_end).await.unwrap();

        let mut active = make_reservation("r4", "[U:1:4]", "s4", 0, 120);
        active.status = ReservationStatus::Active;
        registry.put(&active).await.unwrap();

        let mut stuck = registry.stuck_in_transition(now, 120).await.unwrap();
        stuck.sort_by(|a, b| a.id.cmp(&b.id));
        let ids: Vec<&str> = stuck.iter().map(|r| r.id.as_str()).collect();
        assert_eq!(ids, vec!["r1", "r3"]);

        store.close().await.unwrap();
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn purge_drops_only_old_ended_rows() {
        let (registry, store) = temp_registry().await;
        let now = Utc::now();

        let mut old_ended = make_reservation("r1", "[U:1:1]", "s1", 0, 120);
        old_ended.status = ReservationStatus::Ended;
        old_ended.ends_at = now - Duration::days(40);
        registry.put(&old_ended).await.unwrap();

        let mut recent_ended = make_reservation("r2", "[U:1:2]", "s2", 0, 120);
        recent_ended.status = ReservationStatus::Ended;
        recent_ended.ends_at = now - Duration::days(5);
        registry.put(&recent_ended).await.unwrap();

        // long-gone window but never flipped terminal: retained
        let mut old_active = make_reservation("r3", "[U:1:3]", "s3", 0, 120);
        old_active.status = ReservationStatus::Active;
        old_active.ends_at = now - Duration::days(40);
        registry.put(&old_active).await.unwrap();

        let purged = registry
            .purge_ended_before(now - Duration::days(30))
            .await
            .unwrap();
        assert_eq!(purged, 1);

        assert!(registry.get("r1").await.unwrap().is_none());
        assert!(registry.get("r2").await.unwrap().is_some());
        assert!(registry.get("r3").await.unwrap().is_some());

        store.close().await.unwrap();
    }
}
