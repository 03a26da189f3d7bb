//! Remote box with shell access: files over scp, process control over ssh.
//!
//! Both are driven as subprocesses with captured output, so a hung remote
//! only ever costs the bounded wait, never a worker.

use anyhow::{Result, bail};
use async_trait::async_trait;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::process::Command;
use tokio::time::timeout;
use tracing::{info, warn};

use crate::{CONFIG_FILE, ServerTransport, TransportContext, archive, render_server_config};
use pkg_types::reservation::Reservation;
use pkg_types::server::{Server, ServerKind};

pub struct SshTransport {
    ctx: Arc<TransportContext>,
}

struct SshTarget {
    login: String,
    server_dir: String,
}

impl SshTransport {
    pub fn new(ctx: Arc<TransportContext>) -> Self {
        Self { ctx }
    }

    fn target(server: &Server) -> Result<SshTarget> {
        match &server.kind {
            ServerKind::Ssh {
                host,
                user,
                server_dir,
            } => Ok(SshTarget {
                login: format!("{}@{}", user, host),
                server_dir: server_dir.clone(),
            }),
            other => bail!("server {} is {}, not ssh", server.id, other.label()),
        }
    }

    /// Run a remote command, returning stdout. Non-zero exit becomes an
    /// error carrying stderr.
    async fn ssh(&self, target: &SshTarget, command: &str) -> Result<String> {
        let output = timeout(
            self.ctx.op_timeout,
            Command::new("ssh")
                .args(["-o", "BatchMode=yes", &target.login, command])
                .output(),
        )
        .await
        .map_err(|_| anyhow::anyhow!("ssh to {} timed out", target.login))??;
        if !output.status.success() {
            bail!(
                "ssh {} '{}' failed: {}",
                target.login,
                command,
                String::from_utf8_lossy(&output.stderr).trim()
            );
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }

    async fn scp(&self, from: &str, to: &str) -> Result<()> {
        let output = timeout(
            self.ctx.op_timeout,
            Command::new("scp")
                .args(["-o", "BatchMode=yes", from, to])
                .output(),
        )
        .await
        .map_err(|_| anyhow::anyhow!("scp {} -> {} timed out", from, to))??;
        if !output.status.success() {
            bail!(
                "scp {} -> {} failed: {}",
                from,
                to,
                String::from_utf8_lossy(&output.stderr).trim()
            );
        }
        Ok(())
    }

    /// Render the config locally and push it into the remote cfg dir.
    async fn push_config(
        &self,
        target: &SshTarget,
        server: &Server,
        reservation: &Reservation,
    ) -> Result<()> {
        let staging = std::env::temp_dir().join(format!("{}-{}", reservation.id, CONFIG_FILE));
        tokio::fs::write(&staging, render_server_config(server, reservation)).await?;
        let remote = format!("{}:{}/cfg/{}", target.login, target.server_dir, CONFIG_FILE);
        let result = self.scp(&staging.to_string_lossy(), &remote).await;
        tokio::fs::remove_file(&staging).await.ok();
        result
    }
}

#[async_trait]
impl ServerTransport for SshTransport {
    fn name(&self) -> &'static str {
        "ssh"
    }

    fn ctx(&self) -> &TransportContext {
        &self.ctx
    }

    async fn start(&self, server: &Server, reservation: &Reservation) -> Result<()> {
        let target = Self::target(server)?;
        self.push_config(&target, server, reservation).await?;
        info!(
            "[ssh] delivered config to {} for reservation {}",
            target.login, reservation.id
        );
        self.restart(server).await
    }

    async fn update(&self, server: &Server, reservation: &Reservation) -> Result<()> {
        let target = Self::target(server)?;
        self.push_config(&target, server, reservation).await?;
        let mut client = pkg_rcon::RconClient::connect(
            &server.addr(),
            &reservation.rcon_password,
            self.ctx.op_timeout,
        )
        .await?;
        client.exec(&format!("exec {}", CONFIG_FILE)).await?;
        Ok(())
    }

    async fn end(&self, server: &Server, reservation: &Reservation) -> Result<()> {
        let target = Self::target(server)?;

        // Stage remote logs/demos locally, bundle, then delete remotely.
        let listing = self
            .ssh(
                &target,
                &format!(
                    "find {dir}/logs -name '*.log' 2>/dev/null; find {dir} -maxdepth 1 -name '*.dem' 2>/dev/null",
                    dir = target.server_dir
                ),
            )
            .await?;
        let remote_files: Vec<&str> = listing.lines().filter(|l| !l.trim().is_empty()).collect();

        let staging = std::env::temp_dir().join(format!("slotd-end-{}", reservation.id));
        tokio::fs::create_dir_all(&staging).await?;
        let mut staged: Vec<PathBuf> = Vec::new();
        for remote in &remote_files {
            let name = remote.rsplit('/').next().unwrap_or(remote);
            let local = staging.join(name);
            match self
                .scp(&format!("{}:{}", target.login, remote), &local.to_string_lossy())
                .await
            {
                Ok(()) => staged.push(local),
                Err(e) => warn!("[ssh] skipping artifact {}: {}", remote, e),
            }
        }
        archive::bundle_files(&staged, &self.ctx.bundle_path(reservation))?;
        tokio::fs::remove_dir_all(&staging).await.ok();

        for remote in &remote_files {
            if let Err(e) = self.ssh(&target, &format!("rm -f '{}'", remote)).await {
                warn!("[ssh] could not remove remote {}: {}", remote, e);
            }
        }
        self.ssh(
            &target,
            &format!("rm -f {}/cfg/{}", target.server_dir, CONFIG_FILE),
        )
        .await
        .ok();

        info!(
            "[ssh] archived {} artifacts for reservation {}",
            staged.len(),
            reservation.id
        );
        self.restart(server).await
    }

    async fn restart(&self, server: &Server) -> Result<()> {
        let target = Self::target(server)?;
        // The supervisor on the far side restarts the process after the kill.
        let pid = self
            .ssh(&target, &format!("pgrep -f '\\+port {}'", server.port))
            .await?;
        let pid = pid.trim();
        if pid.is_empty() {
            bail!("[ssh] no process on {} for port {}", target.login, server.port);
        }
        self.ssh(&target, &format!("kill -TERM {}", pid)).await?;
        info!("[ssh] restarted server {} (pid {})", server.id, pid);
        Ok(())
    }
}
