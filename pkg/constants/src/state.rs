//! State store / locking constants.

/// etcd-style key prefix for reservation records.
pub const RESERVATION_PREFIX: &str = "/registry/reservations/";

/// etcd-style key prefix for server records.
pub const SERVER_PREFIX: &str = "/registry/servers/";

/// etcd-style key prefix for provisioning lock leases.
pub const LOCK_PREFIX: &str = "/registry/locks/";

/// How long a provisioning lock lease is valid, in seconds.
/// A crashed holder cannot wedge a server for longer than this.
pub const LOCK_TTL_SECS: u64 = 120;

/// Maximum acquisition attempts before the caller gives up for this tick.
pub const LOCK_RETRY_ATTEMPTS: u32 = 7;

/// First retry delay; doubles each attempt.
pub const LOCK_RETRY_BASE_MS: u64 = 500;

/// Ceiling on the per-attempt retry delay.
pub const LOCK_RETRY_MAX_MS: u64 = 5_000;
