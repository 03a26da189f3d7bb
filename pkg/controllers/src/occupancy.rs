//! Occupancy bookkeeping and the policies that end a reservation early.
//!
//! The scheduler probes each active reservation once per tick, folds the
//! observation into the reservation's counters, then asks the policies
//! whether the reservation should end. Both policies are pure functions
//! of the updated record so the boundaries are testable without a server.

use chrono::{DateTime, Duration, Utc};

use pkg_constants::lifecycle::{AUTO_END_MIN_RUNTIME_MINS, MAX_IDLE_MINUTES};
use pkg_transport::Occupancy;
use pkg_types::reservation::Reservation;

/// Why a policy decided to end a reservation early.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndReason {
    /// Nobody showed up (or everyone left) for longer than the idle cap.
    IdleTimeout,
    /// Opted-in reservation emptied out after a reasonable runtime.
    AutoEnd,
}

impl std::fmt::Display for EndReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EndReason::IdleTimeout => write!(f, "idle timeout"),
            EndReason::AutoEnd => write!(f, "auto-end"),
        }
    }
}

/// Fold one observation into the reservation's occupancy counters.
/// `tick_mins` is how much wall time one scheduler tick represents.
pub fn record_observation(reservation: &mut Reservation, obs: Occupancy, tick_mins: u32) {
    if let Some(count) = obs.player_count {
        reservation.last_player_count = count;
    }
    if obs.occupied {
        reservation.was_occupied = true;
        reservation.inactive_minutes = 0;
    } else {
        reservation.inactive_minutes = reservation.inactive_minutes.saturating_add(tick_mins);
    }
}

/// Ends a reservation nobody is using. Strict comparison: a reservation
/// idle for exactly the cap survives one more tick.
pub struct IdleTimeoutPolicy;

impl IdleTimeoutPolicy {
    pub fn wants_end(reservation: &Reservation) -> bool {
        reservation.inactive_minutes > MAX_IDLE_MINUTES
    }
}

/// Ends an opted-in reservation as soon as it empties out, provided it
/// actually got used and ran long enough to rule out a between-maps blip
/// at the very start.
pub struct AutoEndPolicy;

impl AutoEndPolicy {
    pub fn wants_end(reservation: &Reservation, obs: Occupancy, now: DateTime<Utc>) -> bool {
        reservation.auto_end
            && reservation.was_occupied
            && !obs.occupied
            && reservation.runtime(now) >= Duration::minutes(AUTO_END_MIN_RUNTIME_MINS)
    }
}

/// Combined verdict after `record_observation` has run.
pub fn end_decision(
    reservation: &Reservation,
    obs: Occupancy,
    now: DateTime<Utc>,
) -> Option<EndReason> {
    if AutoEndPolicy::wants_end(reservation, obs, now) {
        return Some(EndReason::AutoEnd);
    }
    if IdleTimeoutPolicy::wants_end(reservation) {
        return Some(EndReason::IdleTimeout);
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use pkg_types::reservation::ReservationStatus;

    fn empty() -> Occupancy {
        Occupancy {
            occupied: false,
            player_count: Some(0),
        }
    }

    fn busy(players: u32) -> Occupancy {
        Occupancy {
            occupied: true,
            player_count: Some(players),
        }
    }

    fn make_reservation(started_mins_ago: i64) -> Reservation {
        let now = Utc::now();
        Reservation {
            id: "r1".into(),
            user_id: "[U:1:111]".into(),
            server_id: "s1".into(),
            starts_at: now - Duration::minutes(started_mins_ago),
            ends_at: now + Duration::hours(2),
            password: "pw".into(),
            rcon_password: "rcon".into(),
            tv_password: "tv".into(),
            map_name: None,
            log_secret: Reservation::generate_secret(),
            status: ReservationStatus::Active,
            status_changed_at: None,
            auto_end: false,
            inactive_minutes: 0,
            last_player_count: 0,
            was_occupied: false,
            warned_nearly_over: false,
            duration_secs: None,
            status_note: None,
            players_seen: vec![],
            created_at: now,
        }
    }

    #[test]
    fn idle_counter_accumulates_and_resets() {
        let mut r = make_reservation(10);
        record_observation(&mut r, empty(), 1);
        record_observation(&mut r, empty(), 1);
        assert_eq!(r.inactive_minutes, 2);
        assert!(!r.was_occupied);

        record_observation(&mut r, busy(7), 1);
        assert_eq!(r.inactive_minutes, 0);
        assert_eq!(r.last_player_count, 7);
        assert!(r.was_occupied);
    }

    #[test]
    fn failed_probe_keeps_last_known_count() {
        let mut r = make_reservation(10);
        record_observation(&mut r, busy(5), 1);
        record_observation(
            &mut r,
            Occupancy {
                occupied: true,
                player_count: None,
            },
            1,
        );
        assert_eq!(r.last_player_count, 5);
        assert_eq!(r.inactive_minutes, 0);
    }

    #[test]
    fn idle_timeout_boundary() {
        let mut r = make_reservation(40);
        r.inactive_minutes = 29;
        assert!(!IdleTimeoutPolicy::wants_end(&r));
        r.inactive_minutes = 30;
        assert!(!IdleTimeoutPolicy::wants_end(&r));
        r.inactive_minutes = 31;
        assert!(IdleTimeoutPolicy::wants_end(&r));
    }

    #[test]
    fn auto_end_requires_opt_in_prior_use_and_runtime() {
        let now = Utc::now();

        // never occupied: an empty probe means nobody showed up yet
        let mut r = make_reservation(45);
        r.auto_end = true;
        assert!(!AutoEndPolicy::wants_end(&r, empty(), now));

        // occupied then emptied, but too early in the reservation
        let mut r = make_reservation(20);
        r.auto_end = true;
        r.was_occupied = true;
        assert!(!AutoEndPolicy::wants_end(&r, empty(), now));

        // not opted in
        let mut r = make_reservation(45);
        r.was_occupied = true;
        assert!(!AutoEndPolicy::wants_end(&r, empty(), now));

        // opted in, was used, long enough, now empty
        let mut r = make_reservation(45);
        r.auto_end = true;
        r.was_occupied = true;
        assert!(AutoEndPolicy::wants_end(&r, empty(), now));

        // still occupied: no end
        assert!(!AutoEndPolicy::wants_end(&r, busy(3), now));
    }

    #[test]
    fn auto_end_takes_precedence_over_idle() {
        let mut r = make_reservation(45);
        r.auto_end = true;
        r.was_occupied = true;
        r.inactive_minutes = 35;
        assert_eq!(
            end_decision(&r, empty(), Utc::now()),
            Some(EndReason::AutoEnd)
        );
    }
}
