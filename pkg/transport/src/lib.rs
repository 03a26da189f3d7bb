//! Pluggable server backends.
//!
//! One `ServerTransport` contract drives every hosting flavor in the
//! fleet: a process on this host, an SSH box, an FTP box, an RCON-only
//! box, or an ephemeral cloud container. The orchestrator and scheduler
//! only ever see the trait.

pub mod archive;
pub mod cloud;
pub mod ftp;
pub mod local;
pub mod rcon_only;
pub mod ssh;

use anyhow::Result;
use async_trait::async_trait;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::warn;

use pkg_constants::lifecycle::STATUS_CACHE_TTL_SECS;
use pkg_rcon::StatusCache;
use pkg_types::reservation::Reservation;
use pkg_types::server::{Server, ServerKind};

/// Name of the reservation config delivered to a server. One current
/// reservation per server, so a fixed name is unambiguous.
pub const CONFIG_FILE: &str = "reservation.cfg";

/// Shared plumbing every transport variant needs.
pub struct TransportContext {
    /// Where end-of-reservation log/demo bundles land.
    pub archive_dir: PathBuf,
    pub status_cache: StatusCache,
    /// Bound on any single remote operation.
    pub op_timeout: Duration,
    pub http: reqwest::Client,
}

impl TransportContext {
    pub fn new(archive_dir: PathBuf) -> Self {
        Self {
            archive_dir,
            status_cache: StatusCache::new(Duration::from_secs(STATUS_CACHE_TTL_SECS)),
            op_timeout: Duration::from_secs(10),
            http: reqwest::Client::new(),
        }
    }

    pub fn bundle_path(&self, reservation: &Reservation) -> PathBuf {
        self.archive_dir.join(format!("{}.tar.gz", reservation.id))
    }
}

/// One occupancy observation of a reserved server.
#[derive(Debug, Clone, Copy)]
pub struct Occupancy {
    pub occupied: bool,
    /// Human player count where the probe could see one.
    pub player_count: Option<u32>,
}

/// Remote lifecycle primitives for one server. All operations are
/// best-effort with bounded timeouts; callers rescue-and-continue so a
/// failed archive never blocks a terminal state flip.
#[async_trait]
pub trait ServerTransport: Send + Sync {
    /// Variant label used in logs.
    fn name(&self) -> &'static str;

    fn ctx(&self) -> &TransportContext;

    /// Render the reservation config, deliver it, and force the server
    /// to pick it up. Safe to retry.
    async fn start(&self, server: &Server, reservation: &Reservation) -> Result<()>;

    /// Like start, but without a full restart where the variant supports
    /// hot-reload. Default falls back to start.
    async fn update(&self, server: &Server, reservation: &Reservation) -> Result<()> {
        self.start(server, reservation).await
    }

    /// Collect logs/demos into a local bundle, delete the remote copies,
    /// remove the reservation config, and return the server to idle.
    async fn end(&self, server: &Server, reservation: &Reservation) -> Result<()>;

    /// Variant-specific process control.
    async fn restart(&self, server: &Server) -> Result<()>;

    /// Live occupancy probe. Any timeout or connection error reports
    /// occupied: wrongly freeing a server that is in use is worse than a
    /// stale one.
    async fn observe(&self, server: &Server, reservation: &Reservation) -> Occupancy {
        match self
            .ctx()
            .status_cache
            .status(&server.addr(), &reservation.rcon_password, self.ctx().op_timeout)
            .await
        {
            Ok(status) => Occupancy {
                occupied: status.occupied(),
                player_count: Some(status.player_count),
            },
            Err(e) => {
                warn!(
                    "[{}] occupancy probe failed for server {} (reservation {}): {}, assuming occupied",
                    self.name(),
                    server.id,
                    reservation.id,
                    e
                );
                Occupancy {
                    occupied: true,
                    player_count: None,
                }
            }
        }
    }
}

/// Maps a server record to the transport that drives it. The orchestrator
/// and scheduler depend on this seam, never on a concrete variant.
pub trait TransportSelector: Send + Sync {
    fn for_server(&self, server: &Server) -> &dyn ServerTransport;
}

/// One instance of every variant, dispatched by `Server::kind`.
pub struct Transports {
    local: local::LocalTransport,
    ssh: ssh::SshTransport,
    ftp: ftp::FtpTransport,
    rcon_only: rcon_only::RconOnlyTransport,
    cloud: cloud::CloudTransport,
}

impl Transports {
    pub fn new(ctx: Arc<TransportContext>) -> Self {
        Self {
            local: local::LocalTransport::new(ctx.clone()),
            ssh: ssh::SshTransport::new(ctx.clone()),
            ftp: ftp::FtpTransport::new(ctx.clone()),
            rcon_only: rcon_only::RconOnlyTransport::new(ctx.clone()),
            cloud: cloud::CloudTransport::new(ctx),
        }
    }

    pub fn for_server(&self, server: &Server) -> &dyn ServerTransport {
        match &server.kind {
            ServerKind::Local { .. } => &self.local,
            ServerKind::Ssh { .. } => &self.ssh,
            ServerKind::Ftp { .. } => &self.ftp,
            ServerKind::RconOnly => &self.rcon_only,
            ServerKind::Cloud { .. } => &self.cloud,
        }
    }
}

impl TransportSelector for Transports {
    fn for_server(&self, server: &Server) -> &dyn ServerTransport {
        Transports::for_server(self, server)
    }
}

/// Render the per-reservation server config. Executed by the game server
/// on (re)start, or hot-reloaded with `exec reservation.cfg`.
pub fn render_server_config(server: &Server, reservation: &Reservation) -> String {
    let mut cfg = String::new();
    cfg.push_str(&format!("hostname \"{} ({})\"\n", server.name, reservation.user_id));
    cfg.push_str(&format!("sv_password \"{}\"\n", reservation.password));
    cfg.push_str(&format!("rcon_password \"{}\"\n", reservation.rcon_password));
    cfg.push_str("tv_enable 1\n");
    cfg.push_str(&format!("tv_password \"{}\"\n", reservation.tv_password));
    cfg.push_str(&format!("sv_logsecret {}\n", reservation.log_secret));
    cfg.push_str("log on\n");
    if let Some(map) = &reservation.map_name {
        cfg.push_str(&format!("changelevel {}\n", map));
    }
    cfg
}
