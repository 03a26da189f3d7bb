use anyhow::bail;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::client::StateStore;
use pkg_constants::state::{
    LOCK_PREFIX, LOCK_RETRY_ATTEMPTS, LOCK_RETRY_BASE_MS, LOCK_RETRY_MAX_MS, LOCK_TTL_SECS,
};

/// A named provisioning lock lease, e.g. `server-<id>`.
/// Stored at `/registry/locks/<name>`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LockLease {
    pub name: String,
    pub holder_id: String,
    pub acquired_at: DateTime<Utc>,
    pub ttl_seconds: u64,
}

impl LockLease {
    /// A lease past its TTL may be taken over; this is the safety net
    /// against a crashed holder.
    pub fn is_expired(&self) -> bool {
        let expiry = self.acquired_at + chrono::Duration::seconds(self.ttl_seconds as i64);
        Utc::now() > expiry
    }
}

/// Injected lock dependency. `StateLock` is the real thing; `MemoryLock`
/// keeps orchestrator tests deterministic.
#[async_trait]
pub trait LockService: Send + Sync {
    /// One acquisition attempt. `true` if the named lock is now held by
    /// `holder_id`.
    async fn try_acquire(&self, name: &str, holder_id: &str) -> anyhow::Result<bool>;

    /// Release only if still held by `holder_id`; releasing someone
    /// else's lock (ours expired and was taken over) is a no-op.
    async fn release(&self, name: &str, holder_id: &str) -> anyhow::Result<()>;
}

/// Acquire with the bounded retry schedule: `LOCK_RETRY_ATTEMPTS` tries,
/// backoff starting at `LOCK_RETRY_BASE_MS` and doubling up to
/// `LOCK_RETRY_MAX_MS`. Exhaustion is an `Err` the caller abandons for
/// this tick; the next scheduler pass retries the whole action.
pub async fn acquire_with_retry(
    locks: &dyn LockService,
    name: &str,
    holder_id: &str,
) -> anyhow::Result<()> {
    let mut delay = Duration::from_millis(LOCK_RETRY_BASE_MS);
    for attempt in 1..=LOCK_RETRY_ATTEMPTS {
        if locks.try_acquire(name, holder_id).await? {
            return Ok(());
        }
        if attempt < LOCK_RETRY_ATTEMPTS {
            tokio::time::sleep(delay).await;
            delay = (delay * 2).min(Duration::from_millis(LOCK_RETRY_MAX_MS));
        }
    }
    bail!(
        "could not acquire lock {} after {} attempts",
        name,
        LOCK_RETRY_ATTEMPTS
    )
}

// --- State-store backed lock ---

/// Lock leases persisted in the shared state store, so every slotd
/// process (and a restarted one) sees the same holders.
#[derive(Clone)]
pub struct StateLock {
    store: StateStore,
    /// Serializes the read-check-write on the lease record within this
    /// process. Concurrent acquirers that both read "no lease" would
    /// otherwise both write themselves as holder.
    gate: Arc<Mutex<()>>,
}

impl StateLock {
    pub fn new(store: StateStore) -> Self {
        Self {
            store,
            gate: Arc::new(Mutex::new(())),
        }
    }

    fn key(name: &str) -> String {
        format!("{}{}", LOCK_PREFIX, name)
    }
}

#[async_trait]
impl LockService for StateLock {
    async fn try_acquire(&self, name: &str, holder_id: &str) -> anyhow::Result<bool> {
        let _gate = self.gate.lock().await;
        let key = Self::key(name);
        match self.store.get_json::<LockLease>(&key).await? {
            Some(lease) if lease.holder_id == holder_id => Ok(true),
            Some(lease) if lease.is_expired() => {
                warn!(
                    "Lock {} expired (held by {}), taking over for {}",
                    name, lease.holder_id, holder_id
                );
                let lease = LockLease {
                    name: name.to_string(),
                    holder_id: holder_id.to_string(),
                    acquired_at: Utc::now(),
                    ttl_seconds: LOCK_TTL_SECS,
                };
                self.store.put_json(&key, &lease).await?;
                Ok(true)
            }
            Some(_) => Ok(false),
            None => {
                let lease = LockLease {
                    name: name.to_string(),
                    holder_id: holder_id.to_string(),
                    acquired_at: Utc::now(),
                    ttl_seconds: LOCK_TTL_SECS,
                };
                self.store.put_json(&key, &lease).await?;
                Ok(true)
            }
        }
    }

    async fn release(&self, name: &str, holder_id: &str) -> anyhow::Result<()> {
        let _gate = self.gate.lock().await;
        let key = Self::key(name);
        match self.store.get_json::<LockLease>(&key).await? {
            Some(lease) if lease.holder_id == holder_id => self.store.delete(&key).await,
            Some(lease) => {
                info!(
                    "Not releasing lock {}: now held by {} (we were {})",
                    name, lease.holder_id, holder_id
                );
                Ok(())
            }
            None => Ok(()),
        }
    }
}

// --- In-memory fake for tests ---

/// Process-local lock table with the same TTL takeover semantics.
#[derive(Default)]
pub struct MemoryLock {
    inner: Mutex<HashMap<String, (String, Instant)>>,
}

impl MemoryLock {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl LockService for MemoryLock {
    async fn try_acquire(&self, name: &str, holder_id: &str) -> anyhow::Result<bool> {
        let mut table = self.inner.lock().await;
        match table.get(name) {
            Some((holder, _)) if holder == holder_id => Ok(true),
            Some((_, expiry)) if *expiry > Instant::now() => Ok(false),
            _ => {
                table.insert(
                    name.to_string(),
                    (
                        holder_id.to_string(),
                        Instant::now() + Duration::from_secs(LOCK_TTL_SECS),
                    ),
                );
                Ok(true)
            }
        }
    }

    async fn release(&self, name: &str, holder_id: &str) -> anyhow::Result<()> {
        let mut table = self.inner.lock().await;
        if let Some((holder, _)) = table.get(name)
            && holder == holder_id
        {
            table.remove(name);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn memory_lock_mutual_exclusion() {
        let locks = MemoryLock::new();
        assert!(locks.try_acquire("server-1", "a").await.unwrap());
        assert!(!locks.try_acquire("server-1", "b").await.unwrap());
        // re-entrant for the same holder
        assert!(locks.try_acquire("server-1", "a").await.unwrap());
        // independent names do not contend
        assert!(locks.try_acquire("server-2", "b").await.unwrap());

        locks.release("server-1", "b").await.unwrap(); // wrong holder: no-op
        assert!(!locks.try_acquire("server-1", "b").await.unwrap());
        locks.release("server-1", "a").await.unwrap();
        assert!(locks.try_acquire("server-1", "b").await.unwrap());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn state_lock_single_winner_under_contention() {
        let dir = std::env::temp_dir().join(format!("slotd-lock-{}", uuid::Uuid::new_v4()));
        let store = StateStore::open(dir.to_str().unwrap()).await.unwrap();
        let locks = Arc::new(StateLock::new(store.clone()));

        for round in 0..20 {
            let name = format!("server-{}", round);
            let barrier = Arc::new(tokio::sync::Barrier::new(8));
            let mut tasks = Vec::new();
            for i in 0..8 {
                let locks = locks.clone();
                let name = name.clone();
                let barrier = barrier.clone();
                tasks.push(tokio::spawn(async move {
                    barrier.wait().await;
                    locks.try_acquire(&name, &format!("holder-{}", i)).await.unwrap()
                }));
            }
            let mut winners = 0;
            for task in tasks {
                if task.await.unwrap() {
                    winners += 1;
                }
            }
            assert_eq!(winners, 1, "round {}", round);
        }

        store.close().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn retry_exhaustion_is_an_error() {
        let locks = MemoryLock::new();
        assert!(locks.try_acquire("server-9", "holder").await.unwrap());
        let err = acquire_with_retry(&locks, "server-9", "contender")
            .await
            .unwrap_err();
        assert!(err.to_string().contains("server-9"));
    }

    #[tokio::test(start_paused = true)]
    async fn retry_succeeds_once_released() {
        let locks = std::sync::Arc::new(MemoryLock::new());
        assert!(locks.try_acquire("server-3", "first").await.unwrap());

        let contender = locks.clone();
        let waiter =
            tokio::spawn(
                async move { acquire_with_retry(&*contender, "server-3", "second").await },
            );

        // Free the lock while the contender is backing off.
        tokio::time::sleep(Duration::from_millis(600)).await;
        locks.release("server-3", "first").await.unwrap();

        waiter.await.unwrap().unwrap();
    }

    #[test]
    fn lease_expiry() {
        let lease = LockLease {
            name: "server-1".into(),
            holder_id: "x".into(),
            acquired_at: Utc::now() - chrono::Duration::seconds(LOCK_TTL_SECS as i64 + 5),
            ttl_seconds: LOCK_TTL_SECS,
        };
        assert!(lease.is_expired());

        let fresh = LockLease {
            acquired_at: Utc::now(),
            ..lease
        };
        assert!(!fresh.is_expired());
    }
}
