//! Box with neither shell nor file access: everything goes over RCON.
//!
//! The reservation config is applied as a sequence of cvar commands; `end`
//! can only reset and restart, so log/demo collection is a no-op for this
//! variant.

use anyhow::Result;
use async_trait::async_trait;
use std::sync::Arc;
use tracing::info;

use crate::{ServerTransport, TransportContext};
use pkg_rcon::RconClient;
use pkg_types::reservation::Reservation;
use pkg_types::server::Server;

pub struct RconOnlyTransport {
    ctx: Arc<TransportContext>,
}

impl RconOnlyTransport {
    pub fn new(ctx: Arc<TransportContext>) -> Self {
        Self { ctx }
    }

    /// The cvar sequence standing in for a delivered config file.
    fn apply_commands(reservation: &Reservation) -> Vec<String> {
        let mut commands = vec![
            format!("sv_password \"{}\"", reservation.password),
            "tv_enable 1".to_string(),
            format!("tv_password \"{}\"", reservation.tv_password),
            format!("sv_logsecret {}", reservation.log_secret),
            "log on".to_string(),
            // Handed over last: every command after this one needs the
            // reservation's own password.
            format!("rcon_password \"{}\"", reservation.rcon_password),
        ];
        if let Some(map) = &reservation.map_name {
            commands.push(format!("changelevel {}", map));
        }
        commands
    }
}

#[async_trait]
impl ServerTransport for RconOnlyTransport {
    fn name(&self) -> &'static str {
        "rcon-only"
    }

    fn ctx(&self) -> &TransportContext {
        &self.ctx
    }

    async fn start(&self, server: &Server, reservation: &Reservation) -> Result<()> {
        let mut client =
            RconClient::connect(&server.addr(), &server.rcon_password, self.ctx.op_timeout).await?;
        for command in Self::apply_commands(reservation) {
            client.exec(&command).await?;
        }
        info!(
            "[rcon-only] applied reservation {} to server {}",
            reservation.id, server.id
        );
        Ok(())
    }

    async fn update(&self, server: &Server, reservation: &Reservation) -> Result<()> {
        // Hot reload: reapply with the live (reservation) password.
        let mut client = RconClient::connect(
            &server.addr(),
            &reservation.rcon_password,
            self.ctx.op_timeout,
        )
        .await?;
        for command in Self::apply_commands(reservation) {
            client.exec(&command).await?;
        }
        Ok(())
    }

    async fn end(&self, server: &Server, reservation: &Reservation) -> Result<()> {
        // Nothing to collect without file access; hand RCON back to the
        // standing password, then wipe state with a restart.
        let mut client = RconClient::connect(
            &server.addr(),
            &reservation.rcon_password,
            self.ctx.op_timeout,
        )
        .await?;
        client.say("Reservation ended. Thanks for playing!").await.ok();
        client
            .exec(&format!("rcon_password \"{}\"", server.rcon_password))
            .await?;
        drop(client);
        self.restart(server).await
    }

    async fn restart(&self, server: &Server) -> Result<()> {
        let mut client =
            RconClient::connect(&server.addr(), &server.rcon_password, self.ctx.op_timeout).await?;
        client.exec("_restart").await.ok(); // connection drops mid-restart
        info!("[rcon-only] issued _restart to server {}", server.id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use pkg_types::reservation::ReservationStatus;

    #[test]
    fn rcon_password_handover_is_last_cvar() {
        let reservation = Reservation {
            id: "r1".into(),
            user_id: "[U:1:111]".into(),
            server_id: "s1".into(),
            starts_at: Utc::now(),
            ends_at: Utc::now() + chrono::Duration::hours(2),
            password: "join".into(),
            rcon_password: "mine".into(),
            tv_password: "tv".into(),
            map_name: None,
            log_secret: "f".repeat(32),
            status: ReservationStatus::Scheduled,
            status_changed_at: None,
            auto_end: false,
            inactive_minutes: 0,
            last_player_count: 0,
            was_occupied: false,
            warned_nearly_over: false,
            duration_secs: None,
            status_note: None,
            players_seen: vec![],
            created_at: Utc::now(),
        };
        let commands = RconOnlyTransport::apply_commands(&reservation);
        assert_eq!(commands.last().unwrap(), "rcon_password \"mine\"");
        assert!(commands.iter().any(|c| c == "sv_password \"join\""));
    }
}
