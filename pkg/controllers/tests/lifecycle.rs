//! Full lifecycle: book, scheduler-driven start, chat extension, expiry,
//! plus recovery of records stranded mid-transition.

use async_trait::async_trait;
use chrono::{Duration as ChronoDuration, Utc};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;
use uuid::Uuid;

use pkg_controllers::ReconciliationScheduler;
use pkg_logpipe::LogPipeline;
use pkg_orchestrator::Orchestrator;
use pkg_state::client::StateStore;
use pkg_state::lock::{LockService, MemoryLock};
use pkg_state::registry::{ReservationRegistry, ServerRegistry};
use pkg_transport::{Occupancy, ServerTransport, TransportContext, TransportSelector};
use pkg_types::reservation::{Reservation, ReservationRequest, ReservationStatus};
use pkg_types::server::{Server, ServerKind};

struct CountingTransport {
    ctx: Arc<TransportContext>,
    starts: AtomicUsize,
    ends: AtomicUsize,
    occupied: AtomicBool,
}

#[async_trait]
impl ServerTransport for CountingTransport {
    fn name(&self) -> &'static str {
        "counting"
    }

    fn ctx(&self) -> &TransportContext {
        &self.ctx
    }

    async fn start(&self, _server: &Server, _reservation: &Reservation) -> anyhow::Result<()> {
        self.starts.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn end(&self, _server: &Server, _reservation: &Reservation) -> anyhow::Result<()> {
        self.ends.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn restart(&self, _server: &Server) -> anyhow::Result<()> {
        Ok(())
    }

    async fn observe(&self, _server: &Server, _reservation: &Reservation) -> Occupancy {
        let occupied = self.occupied.load(Ordering::SeqCst);
        Occupancy {
            occupied,
            player_count: Some(if occupied { 12 } else { 0 }),
        }
    }
}

struct Selector(CountingTransport);

impl TransportSelector for Selector {
    fn for_server(&self, _server: &Server) -> &dyn ServerTransport {
        &self.0
    }
}

struct Harness {
    reservations: ReservationRegistry,
    servers: ServerRegistry,
    orchestrator: Arc<Orchestrator>,
    scheduler: ReconciliationScheduler,
    selector: Arc<Selector>,
    locks: Arc<MemoryLock>,
}

async fn harness() -> Harness {
    let dir = std::env::temp_dir().join(format!("slotd-e2e-{}", Uuid::new_v4()));
    let store = StateStore::open(dir.to_str().unwrap()).await.unwrap();
    let reservations = ReservationRegistry::new(store.clone());
    let servers = ServerRegistry::new(store);
    let ctx = Arc::new(TransportContext::new(std::env::temp_dir()));
    let selector = Arc::new(Selector(CountingTransport {
        ctx: ctx.clone(),
        starts: AtomicUsize::new(0),
        ends: AtomicUsize::new(0),
        occupied: AtomicBool::new(true),
    }));
    let locks = Arc::new(MemoryLock::new());

    servers
        .put(&Server {
            id: "s1".into(),
            name: "chi-1".into(),
            // closed port: incidental RCON chatter fails fast
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
        selector.clone(),
        locks.clone(),
        ctx.clone(),
        None,
    ));
    let scheduler = ReconciliationScheduler::new(
        reservations.clone(),
        servers.clone(),
        orchestrator.clone(),
        selector.clone(),
        locks.clone(),
        ctx,
        Some(Duration::from_secs(60)),
    );
    Harness {
        reservations,
        servers,
        orchestrator,
        scheduler,
        selector,
        locks,
    }
}

async fn book_two_hours(h: &Harness) -> Reservation {
    let now = Utc::now();
    let server = h.servers.get("s1").await.unwrap().unwrap();
    h.reservations
        .create(
            &ReservationRequest {
                user_id: "[U:1:111]".into(),
                user_groups: vec![],
                server_id: "s1".into(),
                starts_at: now,
                ends_at: now + ChronoDuration::hours(2),
                password: None,
                rcon_password: None,
                tv_password: None,
                map_name: None,
                auto_end: false,
            },
            &server,
        )
        .await
        .unwrap()
}

#[tokio::test(flavor = "multi_thread")]
async fn reservation_lifecycle_end_to_end() {
    let h = harness().await;
    let created = book_two_hours(&h).await;
    assert_eq!(created.status, ReservationStatus::Scheduled);

    // One tick starts it; a second tick does not start it again.
    h.scheduler.reconcile().await.unwrap();
    let active = h.reservations.get(&created.id).await.unwrap().unwrap();
    assert_eq!(active.status, ReservationStatus::Active);
    assert_eq!(h.selector.0.starts.load(Ordering::SeqCst), 1);

    h.scheduler.reconcile().await.unwrap();
    assert_eq!(h.selector.0.starts.load(Ordering::SeqCst), 1);

    // 55 minutes remaining: the owner's chat !extend adds an hour.
    let mut nearly_over = h.reservations.get(&created.id).await.unwrap().unwrap();
    nearly_over.ends_at = Utc::now() + ChronoDuration::minutes(55);
    let old_end = nearly_over.ends_at;
    h.reservations.put(&nearly_over).await.unwrap();

    let pipeline = Arc::new(LogPipeline::new(
        h.reservations.clone(),
        h.servers.clone(),
        h.orchestrator.clone(),
    ));
    let (tx, _handle) = pipeline.start();
    tx.send(format!(
        "{}L 08/28/2026 - 20:15:01: \"Owner<3><[U:1:111]><Red>\" say \"!extend\"",
        nearly_over.log_secret
    ))
    .await
    .unwrap();

    let mut extended = None;
    for _ in 0..100 {
        let r = h.reservations.get(&created.id).await.unwrap().unwrap();
        if r.ends_at == old_end + ChronoDuration::hours(1) {
            extended = Some(r);
            break;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    let extended = extended.expect("extension never landed");
    assert_eq!(extended.status, ReservationStatus::Active);

    // Window closes: exactly one transport end, terminal state sticks.
    let mut expired = extended;
    expired.ends_at = Utc::now() - ChronoDuration::minutes(1);
    h.reservations.put(&expired).await.unwrap();

    h.scheduler.reconcile().await.unwrap();
    let ended = h.reservations.get(&created.id).await.unwrap().unwrap();
    assert_eq!(ended.status, ReservationStatus::Ended);
    assert_eq!(h.selector.0.ends.load(Ordering::SeqCst), 1);
    assert!(ended.duration_secs.is_some());

    h.scheduler.reconcile().await.unwrap();
    assert_eq!(h.selector.0.ends.load(Ordering::SeqCst), 1);
}

#[tokio::test(flavor = "multi_thread")]
async fn stalled_transitions_are_recovered() {
    let h = harness().await;
    let created = book_two_hours(&h).await;

    // Simulate a crash after the Starting write: the record is stranded
    // with a stamp older than the lock TTL.
    let mut stranded = h.reservations.get(&created.id).await.unwrap().unwrap();
    stranded.status = ReservationStatus::Starting;
    stranded.status_changed_at = Some(Utc::now() - ChronoDuration::minutes(10));
    h.reservations.put(&stranded).await.unwrap();

    // Recovery reschedules it and the same tick starts it.
    h.scheduler.reconcile().await.unwrap();
    let active = h.reservations.get(&created.id).await.unwrap().unwrap();
    assert_eq!(active.status, ReservationStatus::Active);
    assert_eq!(h.selector.0.starts.load(Ordering::SeqCst), 1);

    // Same crash shape on the way down: stranded in Ending.
    let mut stranded = active;
    stranded.status = ReservationStatus::Ending;
    stranded.status_changed_at = Some(Utc::now() - ChronoDuration::minutes(10));
    h.reservations.put(&stranded).await.unwrap();

    h.scheduler.reconcile().await.unwrap();
    let ended = h.reservations.get(&created.id).await.unwrap().unwrap();
    assert_eq!(ended.status, ReservationStatus::Ended);
    assert_eq!(h.selector.0.ends.load(Ordering::SeqCst), 1);
}

#[tokio::test(flavor = "multi_thread")]
async fn occupancy_persist_yields_to_the_server_lock() {
    let h = harness().await;
    h.selector.0.occupied.store(false, Ordering::SeqCst);
    let created = book_two_hours(&h).await;

    // Start it, then one empty observation lands.
    h.scheduler.reconcile().await.unwrap();
    let r = h.reservations.get(&created.id).await.unwrap().unwrap();
    assert_eq!(r.status, ReservationStatus::Active);
    assert_eq!(r.inactive_minutes, 1);

    // With the server lock held elsewhere (an end in flight, say), the
    // probe's write is skipped instead of clobbering the record.
    assert!(h.locks.try_acquire("server-s1", "elsewhere").await.unwrap());
    h.scheduler.reconcile().await.unwrap();
    let r = h.reservations.get(&created.id).await.unwrap().unwrap();
    assert_eq!(r.inactive_minutes, 1);

    h.locks.release("server-s1", "elsewhere").await.unwrap();
    h.scheduler.reconcile().await.unwrap();
    let r = h.reservations.get(&created.id).await.unwrap().unwrap();
    assert_eq!(r.inactive_minutes, 2);
}
