//! Game server running on the same host as slotd.
//!
//! Config is written straight into the server directory; restart is a
//! SIGTERM to the discovered process, which the supervisor (systemd,
//! runit) brings back up with the new config.

use anyhow::{Result, bail};
use async_trait::async_trait;
use nix::sys::signal::{Signal, kill};
use nix::unistd::Pid;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use sysinfo::System;
use tracing::{info, warn};

use crate::{CONFIG_FILE, ServerTransport, TransportContext, archive, render_server_config};
use pkg_rcon::RconClient;
use pkg_types::reservation::Reservation;
use pkg_types::server::{Server, ServerKind};

pub struct LocalTransport {
    ctx: Arc<TransportContext>,
}

impl LocalTransport {
    pub fn new(ctx: Arc<TransportContext>) -> Self {
        Self { ctx }
    }

    fn server_dir<'a>(server: &'a Server) -> Result<&'a Path> {
        match &server.kind {
            ServerKind::Local { server_dir } => Ok(Path::new(server_dir)),
            other => bail!("server {} is {}, not local", server.id, other.label()),
        }
    }

    /// Scan the process table for the game-server process launched with
    /// this port.
    fn find_pid(port: u16) -> Option<i32> {
        let system = System::new_all();
        let port_arg = port.to_string();
        for (pid, process) in system.processes() {
            let args: Vec<String> = process
                .cmd()
                .iter()
                .map(|a| a.to_string_lossy().to_string())
                .collect();
            if args_mention_port(&args, &port_arg) {
                return Some(pid.as_u32() as i32);
            }
        }
        None
    }

    fn collect_artifacts(dir: &Path) -> Vec<PathBuf> {
        let mut files = Vec::new();
        for sub in [dir.join("logs"), dir.to_path_buf()] {
            let Ok(entries) = std::fs::read_dir(&sub) else {
                continue;
            };
            for entry in entries.flatten() {
                let path = entry.path();
                match path.extension().and_then(|e| e.to_str()) {
                    Some("log") | Some("dem") => files.push(path),
                    _ => {}
                }
            }
        }
        files
    }
}

/// Whether a process command line carries `+port <p>` / `-port <p>`.
fn args_mention_port(args: &[String], port: &str) -> bool {
    args.windows(2)
        .any(|w| (w[0] == "+port" || w[0] == "-port") && w[1] == port)
}

#[async_trait]
impl ServerTransport for LocalTransport {
    fn name(&self) -> &'static str {
        "local"
    }

    fn ctx(&self) -> &TransportContext {
        &self.ctx
    }

    async fn start(&self, server: &Server, reservation: &Reservation) -> Result<()> {
        let dir = Self::server_dir(server)?;
        let cfg_path = dir.join("cfg").join(CONFIG_FILE);
        tokio::fs::write(&cfg_path, render_server_config(server, reservation)).await?;
        info!(
            "[local] wrote {} for reservation {}",
            cfg_path.display(),
            reservation.id
        );
        self.restart(server).await
    }

    async fn update(&self, server: &Server, reservation: &Reservation) -> Result<()> {
        let dir = Self::server_dir(server)?;
        let cfg_path = dir.join("cfg").join(CONFIG_FILE);
        tokio::fs::write(&cfg_path, render_server_config(server, reservation)).await?;
        // Hot reload instead of a restart: the running instance execs the
        // refreshed config over RCON.
        let mut client = RconClient::connect(
            &server.addr(),
            &reservation.rcon_password,
            self.ctx.op_timeout,
        )
        .await?;
        client.exec(&format!("exec {}", CONFIG_FILE)).await?;
        Ok(())
    }

    async fn end(&self, server: &Server, reservation: &Reservation) -> Result<()> {
        let dir = Self::server_dir(server)?;
        let artifacts = Self::collect_artifacts(dir);
        let bundle = self.ctx.bundle_path(reservation);
        archive::bundle_files(&artifacts, &bundle)?;
        info!(
            "[local] archived {} artifacts for reservation {} -> {}",
            artifacts.len(),
            reservation.id,
            bundle.display()
        );
        for file in &artifacts {
            if let Err(e) = std::fs::remove_file(file) {
                warn!("[local] could not remove {}: {}", file.display(), e);
            }
        }
        let cfg_path = dir.join("cfg").join(CONFIG_FILE);
        if let Err(e) = std::fs::remove_file(&cfg_path) {
            warn!("[local] could not remove {}: {}", cfg_path.display(), e);
        }
        self.restart(server).await
    }

    async fn restart(&self, server: &Server) -> Result<()> {
        match Self::find_pid(server.port) {
            Some(pid) => {
                info!("[local] SIGTERM to pid {} (server {})", pid, server.id);
                kill(Pid::from_raw(pid), Signal::SIGTERM)?;
                Ok(())
            }
            None => bail!(
                "[local] no process found for server {} on port {}",
                server.id,
                server.port
            ),
        }
    }
}
