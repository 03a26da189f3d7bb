use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use pkg_constants::lifecycle::{MAX_DURATION_HOURS, MIN_DURATION_MINS};

// --- Reservation status ---

/// Closed lifecycle state machine for a reservation.
///
/// `Starting` and `Ending` mark an in-flight transition so a concurrent
/// scheduler tick skips records the orchestrator is already working on.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum ReservationStatus {
    /// Booked and validated, backend not provisioned yet.
    Scheduled,
    /// Orchestrator is provisioning the backend.
    Starting,
    /// Backend provisioned, window open.
    Active,
    /// Orchestrator is tearing the backend down.
    Ending,
    /// Terminal. `ends_at` has been rewritten to the actual end time.
    Ended,
}

impl ReservationStatus {
    /// Guard for legal lifecycle transitions. `Ended` is terminal.
    pub fn can_transition_to(self, next: ReservationStatus) -> bool {
        use ReservationStatus::*;
        matches!(
            (self, next),
            (Scheduled, Starting)
                | (Starting, Active)
                | (Starting, Scheduled) // failed start, retried next tick
                | (Active, Ending)
                | (Starting, Ending)
                | (Scheduled, Ending) // ended before it ever started
                | (Ending, Ended)
        )
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, ReservationStatus::Ended)
    }
}

impl std::fmt::Display for ReservationStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ReservationStatus::Scheduled => write!(f, "Scheduled"),
            ReservationStatus::Starting => write!(f, "Starting"),
            ReservationStatus::Active => write!(f, "Active"),
            ReservationStatus::Ending => write!(f, "Ending"),
            ReservationStatus::Ended => write!(f, "Ended"),
        }
    }
}

// --- Reservation ---

/// A user's exclusive time-boxed claim on one server slot.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Reservation {
    pub id: String,
    /// Steam identity of the booking user. Chat commands embedded in the
    /// log stream are only trusted when they carry this id.
    pub user_id: String,
    pub server_id: String,
    pub starts_at: DateTime<Utc>,
    pub ends_at: DateTime<Utc>,
    pub password: String,
    pub rcon_password: String,
    pub tv_password: String,
    #[serde(default)]
    pub map_name: Option<String>,
    /// Unguessable token prefixed to every forwarded log line.
    pub log_secret: String,
    pub status: ReservationStatus,
    /// When `status` last changed. A `Starting`/`Ending` record whose
    /// stamp is older than the lock TTL belongs to a crashed holder and
    /// is picked up by the scheduler's recovery pass.
    #[serde(default)]
    pub status_changed_at: Option<DateTime<Utc>>,
    /// End as soon as everyone leaves (after a minimum runtime).
    #[serde(default)]
    pub auto_end: bool,
    /// Consecutive scheduler ticks the server reported empty.
    #[serde(default)]
    pub inactive_minutes: u32,
    #[serde(default)]
    pub last_player_count: u32,
    /// Whether anyone ever connected during this reservation.
    #[serde(default)]
    pub was_occupied: bool,
    /// One-shot latch for the "nearly over" chat warning.
    #[serde(default)]
    pub warned_nearly_over: bool,
    /// Actual runtime, computed when the reservation ends.
    #[serde(default)]
    pub duration_secs: Option<i64>,
    /// Operator-facing note, e.g. a failed log-archive during teardown.
    #[serde(default)]
    pub status_note: Option<String>,
    /// Steam ids mined from the archived logs after the reservation ended.
    #[serde(default)]
    pub players_seen: Vec<String>,
    pub created_at: DateTime<Utc>,
}

impl Reservation {
    /// Whether `now` falls inside the booked window `[starts_at, ends_at)`.
    pub fn is_current(&self, now: DateTime<Utc>) -> bool {
        self.starts_at <= now && now < self.ends_at
    }

    pub fn time_remaining(&self, now: DateTime<Utc>) -> Duration {
        self.ends_at - now
    }

    pub fn runtime(&self, now: DateTime<Utc>) -> Duration {
        now - self.starts_at
    }

    /// Whether this reservation's window intersects `[starts, ends)`.
    /// Half-open intervals: back-to-back bookings do not collide.
    pub fn overlaps(&self, starts: DateTime<Utc>, ends: DateTime<Utc>) -> bool {
        self.starts_at < ends && starts < self.ends_at
    }

    /// Generate a fresh log secret (32 hex chars, no hyphens).
    pub fn generate_secret() -> String {
        Uuid::new_v4().simple().to_string()
    }

    /// Apply a lifecycle transition and stamp when it happened. An
    /// illegal transition is a programming error in the caller.
    pub fn transition(&mut self, next: ReservationStatus) {
        debug_assert!(
            self.status.can_transition_to(next),
            "illegal reservation transition {} -> {}",
            self.status,
            next
        );
        self.status = next;
        self.status_changed_at = Some(Utc::now());
    }
}

// --- Booking request ---

/// What the creation API accepts. Group membership comes from the (out of
/// scope) auth layer that fronts the API.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReservationRequest {
    pub user_id: String,
    #[serde(default)]
    pub user_groups: Vec<String>,
    pub server_id: String,
    pub starts_at: DateTime<Utc>,
    pub ends_at: DateTime<Utc>,
    #[serde(default)]
    pub password: Option<String>,
    #[serde(default)]
    pub rcon_password: Option<String>,
    #[serde(default)]
    pub tv_password: Option<String>,
    #[serde(default)]
    pub map_name: Option<String>,
    #[serde(default)]
    pub auto_end: bool,
}

// --- Validation ---

/// Booking rejections the user can act on. Everything else is an
/// infrastructure error and surfaces generically.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ValidationError {
    TooShort,
    TooLong,
    ServerOverlap,
    UserOverlap,
    NotAuthorized,
    ServerInactive,
    AlreadyEnded,
    NotExtendable,
}

impl std::fmt::Display for ValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ValidationError::TooShort => {
                write!(f, "reservation must last at least {} minutes", MIN_DURATION_MINS)
            }
            ValidationError::TooLong => {
                write!(f, "reservation must not exceed {} hours", MAX_DURATION_HOURS)
            }
            ValidationError::ServerOverlap => {
                write!(f, "the server already has a reservation in that window")
            }
            ValidationError::UserOverlap => {
                write!(f, "you already have a reservation in that window")
            }
            ValidationError::NotAuthorized => {
                write!(f, "this server is restricted to a group you are not in")
            }
            ValidationError::ServerInactive => write!(f, "this server is not reservable right now"),
            ValidationError::AlreadyEnded => write!(f, "this reservation has already ended"),
            ValidationError::NotExtendable => {
                write!(f, "extension only possible with under an hour remaining and a free slot")
            }
        }
    }
}

impl std::error::Error for ValidationError {}

/// Validate a requested window against the duration bounds.
pub fn validate_window(starts_at: DateTime<Utc>, ends_at: DateTime<Utc>) -> Result<(), ValidationError> {
    let len = ends_at - starts_at;
    if len < Duration::minutes(MIN_DURATION_MINS) {
        return Err(ValidationError::TooShort);
    }
    if len > Duration::hours(MAX_DURATION_HOURS) {
        return Err(ValidationError::TooLong);
    }
    Ok(())
}
