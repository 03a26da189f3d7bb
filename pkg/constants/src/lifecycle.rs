//! Reservation lifecycle thresholds.

/// Shortest bookable window, in minutes.
pub const MIN_DURATION_MINS: i64 = 30;

/// Longest bookable window, in hours. Extensions are exempt.
pub const MAX_DURATION_HOURS: i64 = 3;

/// Length of one chat-triggered extension, in hours.
pub const EXTENSION_HOURS: i64 = 1;

/// An extension is only granted when less than this many minutes remain.
pub const EXTENSION_ELIGIBLE_MINS: i64 = 60;

/// Consecutive empty-server minutes after which a reservation is force-ended.
pub const MAX_IDLE_MINUTES: u32 = 30;

/// Minimum runtime before the auto-end-on-empty policy may fire, in minutes.
pub const AUTO_END_MIN_RUNTIME_MINS: i64 = 30;

/// The one-time "nearly over" warning fires under this many minutes remaining.
pub const NEARLY_OVER_WARN_MINS: i64 = 10;

/// Reconciliation scheduler tick period, in seconds.
pub const TICK_SECS: u64 = 60;

/// Ended reservations are kept this many days before the background purge.
pub const ENDED_RETENTION_DAYS: i64 = 30;

/// How long a cached RCON status answer stays fresh, in seconds.
pub const STATUS_CACHE_TTL_SECS: u64 = 25;

/// How long a log-secret -> reservation lookup stays cached, in seconds.
pub const SECRET_CACHE_TTL_SECS: u64 = 60;

/// Log pipeline hands a batch off after this many lines...
pub const BATCH_MAX_LINES: usize = 10;

/// ...or after this many milliseconds, whichever comes first.
pub const BATCH_MAX_WAIT_MS: u64 = 100;
