//! The log ingestion pipeline.
//!
//! A single worker drains the raw line channel in small batches, resolves
//! each line's secret to its reservation, executes owner chat commands,
//! and fans completed batches out to live viewers. One worker drains the
//! channel, so lines sharing a secret are processed in arrival order.

use dashmap::DashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, info, warn};

use crate::parse::{ChatCommand, ChatLine, parse_chat_line, parse_command, split_secret};
use pkg_constants::lifecycle::{BATCH_MAX_LINES, BATCH_MAX_WAIT_MS, SECRET_CACHE_TTL_SECS};
use pkg_orchestrator::{LifecycleAction, Orchestrator};
use pkg_rcon::RconClient;
use pkg_state::registry::{ReservationRegistry, ServerRegistry};
use pkg_types::reservation::{Reservation, ValidationError};

/// One reservation's slice of a processed batch, rendered once per batch
/// for live viewers rather than once per line.
#[derive(Debug, Clone)]
pub struct LogBatch {
    pub reservation_id: String,
    pub lines: Vec<String>,
}

struct CachedSecret {
    reservation: Option<Reservation>,
    fetched_at: Instant,
}

pub struct LogPipeline {
    reservations: ReservationRegistry,
    servers: ServerRegistry,
    orchestrator: Arc<Orchestrator>,
    /// Secret -> reservation lookups are cached briefly; misses are
    /// cached too so a misdirected stream cannot hammer the store.
    secret_cache: DashMap<String, CachedSecret>,
    viewers: broadcast::Sender<LogBatch>,
    op_timeout: Duration,
}

impl LogPipeline {
    pub fn new(
        reservations: ReservationRegistry,
        servers: ServerRegistry,
        orchestrator: Arc<Orchestrator>,
    ) -> Self {
        let (viewers, _) = broadcast::channel(256);
        Self {
            reservations,
            servers,
            orchestrator,
            secret_cache: DashMap::new(),
            viewers,
            op_timeout: Duration::from_secs(10),
        }
    }

    /// Live viewers get one `LogBatch` per reservation per batch.
    pub fn subscribe(&self) -> broadcast::Receiver<LogBatch> {
        self.viewers.subscribe()
    }

    /// Spawn the worker and hand back the line intake. Dropping the
    /// sender drains the channel and stops the worker.
    pub fn start(self: Arc<Self>) -> (mpsc::Sender<String>, tokio::task::JoinHandle<()>) {
        let (tx, mut rx) = mpsc::channel::<String>(1024);
        let handle = tokio::spawn(async move {
            info!("LogPipeline started");
            while let Some(first) = rx.recv().await {
                let mut batch = vec![first];
                let deadline =
                    tokio::time::Instant::now() + Duration::from_millis(BATCH_MAX_WAIT_MS);
                while batch.len() < BATCH_MAX_LINES {
                    match tokio::time::timeout_at(deadline, rx.recv()).await {
                        Ok(Some(line)) => batch.push(line),
                        Ok(None) | Err(_) => break,
                    }
                }
                self.process_batch(batch).await;
            }
            info!("LogPipeline stopped");
        });
        (tx, handle)
    }

    async fn process_batch(&self, lines: Vec<String>) {
        // Group by secret, preserving per-secret arrival order.
        let mut groups: Vec<(String, Vec<String>)> = Vec::new();
        for line in &lines {
            let Some((secret, rest)) = split_secret(line) else {
                debug!("dropping unattributable log line");
                continue;
            };
            match groups.iter_mut().find(|(s, _)| s.as_str() == secret) {
                Some((_, group)) => group.push(rest.to_string()),
                None => groups.push((secret.to_string(), vec![rest.to_string()])),
            }
        }

        for (secret, group) in groups {
            let Some(reservation) = self.resolve(&secret).await else {
                debug!("dropping {} line(s) with unknown secret", group.len());
                continue;
            };
            for rest in &group {
                if let Some(chat) = parse_chat_line(rest)
                    && let Some(command) = parse_command(&chat.message)
                {
                    self.handle_command(&secret, &reservation, &chat, command).await;
                }
            }
            let _ = self.viewers.send(LogBatch {
                reservation_id: reservation.id.clone(),
                lines: group,
            });
        }
    }

    async fn resolve(&self, secret: &str) -> Option<Reservation> {
        if let Some(cached) = self.secret_cache.get(secret)
            && cached.fetched_at.elapsed() < Duration::from_secs(SECRET_CACHE_TTL_SECS)
        {
            return cached.reservation.clone();
        }
        let reservation = match self.reservations.find_by_secret(secret).await {
            Ok(found) => found,
            Err(e) => {
                warn!("secret lookup failed: {}", e);
                return None;
            }
        };
        self.secret_cache.insert(
            secret.to_string(),
            CachedSecret {
                reservation: reservation.clone(),
                fetched_at: Instant::now(),
            },
        );
        reservation
    }

    async fn handle_command(
        &self,
        secret: &str,
        reservation: &Reservation,
        chat: &ChatLine,
        command: ChatCommand,
    ) {
        // Only the owner's chat lines are trusted.
        if chat.steam_id != reservation.user_id {
            debug!(
                "ignoring {:?} from non-owner {} on reservation {}",
                command, chat.steam_id, reservation.id
            );
            return;
        }

        match command {
            ChatCommand::End => {
                info!("chat end from {} for reservation {}", chat.name, reservation.id);
                if let Err(e) = self
                    .orchestrator
                    .run(LifecycleAction::End, &reservation.id)
                    .await
                {
                    warn!("chat end of reservation {} failed: {}", reservation.id, e);
                    return;
                }
                // Lines still in flight for this secret should now drop.
                self.secret_cache.remove(secret);
            }
            ChatCommand::Extend => match self.orchestrator.extend(&reservation.id).await {
                Ok(new_ends_at) => {
                    self.say(
                        reservation,
                        &format!("Extended! New end time: {}", new_ends_at.format("%H:%M UTC")),
                    )
                    .await;
                    self.secret_cache.remove(secret);
                }
                Err(e) => {
                    // Ineligible extension is a benign per-line failure,
                    // reported in game, never a pipeline error.
                    let reply = match e.downcast_ref::<ValidationError>() {
                        Some(ve) => format!("Cannot extend: {}", ve),
                        None => {
                            warn!("extending reservation {} failed: {}", reservation.id, e);
                            "Cannot extend right now, try again shortly.".to_string()
                        }
                    };
                    self.say(reservation, &reply).await;
                }
            },
            ChatCommand::Rcon(remainder) => {
                info!(
                    "chat rcon from {} on reservation {}: {}",
                    chat.name, reservation.id, remainder
                );
                match self.connect(reservation).await {
                    Some(mut client) => {
                        if let Err(e) = client.exec(&remainder).await {
                            debug!("chat rcon on {} failed: {}", reservation.id, e);
                        }
                    }
                    None => debug!("chat rcon on {}: server unreachable", reservation.id),
                }
            }
        }
    }

    async fn say(&self, reservation: &Reservation, message: &str) {
        if let Some(mut client) = self.connect(reservation).await
            && let Err(e) = client.say(message).await
        {
            debug!("chat reply on {} failed: {}", reservation.id, e);
        }
    }

    async fn connect(&self, reservation: &Reservation) -> Option<RconClient> {
        let server = match self.servers.get(&reservation.server_id).await {
            Ok(Some(server)) => server,
            Ok(None) => {
                warn!(
                    "reservation {} references unknown server {}",
                    reservation.id, reservation.server_id
                );
                return None;
            }
            Err(e) => {
                warn!("loading server for reservation {}: {}", reservation.id, e);
                return None;
            }
        };
        match RconClient::connect(&server.addr(), &reservation.rcon_password, self.op_timeout).await
        {
            Ok(client) => Some(client),
            Err(e) => {
                debug!("rcon connect to {} failed: {}", server.addr(), e);
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration as ChronoDuration, Utc};
    use pkg_state::client::StateStore;
    use pkg_state::lock::MemoryLock;
    use pkg_transport::{TransportContext, Transports};
    use pkg_types::reservation::ReservationStatus;
    use pkg_types::server::{Server, ServerKind};
    use uuid::Uuid;

    const SECRET: &str = "0123456789abcdef0123456789abcdef";

    async fn fixture() -> (Arc<LogPipeline>, ReservationRegistry) {
        let dir = std::env::temp_dir().join(format!("slotd-logpipe-{}", Uuid::new_v4()));
        let store = StateStore::open(dir.to_str().unwrap()).await.unwrap();
        let reservations = ReservationRegistry::new(store.clone());
        let servers = ServerRegistry::new(store);
        let ctx = Arc::new(TransportContext::new(std::env::temp_dir()));

        servers
            .put(&Server {
                id: "s1".into(),
                name: "s1".into(),
                // closed port: RCON side effects fail fast and harmlessly
                ip: "127.0.0.1".into(),
                port: 9,
                rcon_password: "standing".into(),
                kind: ServerKind::RconOnly,
                active: true,
                groups: vec![],
                sdr_endpoint: None,
                version: None,
                update_status: None,
                reachable: true,
                last_checked_at: None,
                created_at: Utc::now(),
            })
            .await
            .unwrap();

        let orchestrator = Arc::new(Orchestrator::new(
            reservations.clone(),
            servers.clone(),
            Arc::new(Transports::new(ctx.clone())),
            Arc::new(MemoryLock::new()),
            ctx,
            None,
        ));
        let pipeline = Arc::new(LogPipeline::new(
            reservations.clone(),
            servers,
            orchestrator,
        ));
        (pipeline, reservations)
    }

    fn active_reservation(mins_left: i64) -> Reservation {
        let now = Utc::now();
        Reservation {
            id: "r1".into(),
            user_id: "[U:1:111]".into(),
            server_id: "s1".into(),
            starts_at: now + ChronoDuration::minutes(mins_left) - ChronoDuration::hours(2),
            ends_at: now + ChronoDuration::minutes(mins_left),
            password: "pw".into(),
            rcon_password: "rcon".into(),
            tv_password: "tv".into(),
            map_name: None,
            log_secret: SECRET.into(),
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

    fn chat(steam_id: &str, message: &str) -> String {
        format!(
            "{}L 08/28/2026 - 20:15:01: \"Somebody<3><{}><Red>\" say \"{}\"",
            SECRET, steam_id, message
        )
    }

    async fn wait_for<F, Fut>(mut check: F)
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = bool>,
    {
        for _ in 0..100 {
            if check().await {
                return;
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
        panic!("condition not reached in time");
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn only_the_owner_can_end_via_chat() {
        let (pipeline, reservations) = fixture().await;
        reservations.put(&active_reservation(90)).await.unwrap();
        let (tx, _handle) = pipeline.start();

        tx.send(chat("[U:1:999]", "!end")).await.unwrap();
        tokio::time::sleep(Duration::from_millis(400)).await;
        assert_eq!(
            reservations.get("r1").await.unwrap().unwrap().status,
            ReservationStatus::Active
        );

        tx.send(chat("[U:1:111]", "!end")).await.unwrap();
        wait_for(|| async {
            reservations.get("r1").await.unwrap().unwrap().status == ReservationStatus::Ended
        })
        .await;
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn owner_extend_moves_the_end_time() {
        let (pipeline, reservations) = fixture().await;
        let reservation = active_reservation(55);
        let old_end = reservation.ends_at;
        reservations.put(&reservation).await.unwrap();
        let (tx, _handle) = pipeline.start();

        tx.send(chat("[U:1:111]", "!extend")).await.unwrap();
        wait_for(|| async {
            reservations.get("r1").await.unwrap().unwrap().ends_at
                == old_end + ChronoDuration::hours(1)
        })
        .await;
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn batches_are_rendered_once_per_reservation() {
        let (pipeline, reservations) = fixture().await;
        reservations.put(&active_reservation(90)).await.unwrap();
        let mut viewer = pipeline.subscribe();
        let (tx, _handle) = pipeline.start();

        for i in 0..3 {
            tx.send(format!("{}L line {}", SECRET, i)).await.unwrap();
        }
        let batch = tokio::time::timeout(Duration::from_secs(5), viewer.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(batch.reservation_id, "r1");
        assert_eq!(batch.lines.len(), 3);
        assert_eq!(batch.lines[0], "L line 0");
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn unknown_secrets_are_dropped() {
        let (pipeline, reservations) = fixture().await;
        reservations.put(&active_reservation(90)).await.unwrap();
        let mut viewer = pipeline.subscribe();
        let (tx, _handle) = pipeline.start();

        let stranger = "ffffffffffffffffffffffffffffffff";
        tx.send(format!("{}L somebody else's line", stranger))
            .await
            .unwrap();
        tx.send("not even a tagged line".to_string()).await.unwrap();
        tx.send(format!("{}L a real line", SECRET)).await.unwrap();

        let batch = tokio::time::timeout(Duration::from_secs(5), viewer.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(batch.reservation_id, "r1");
        assert_eq!(batch.lines, vec!["L a real line".to_string()]);
    }
}
