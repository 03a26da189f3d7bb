//! Keeps idle server records fresh.
//!
//! Servers without a current reservation still answer RCON on their
//! standing password; probing them refreshes the cached game version and
//! SDR relay endpoint and flags boxes that stopped answering. Reserved
//! servers are skipped, their RCON password belongs to the reservation.

use anyhow::Result;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use tracing::{debug, warn};

use pkg_rcon::ServerStatus;
use pkg_state::registry::{ReservationRegistry, ServerRegistry};
use pkg_transport::TransportContext;
use pkg_types::server::Server;

/// Merge one probe outcome into the record. Returns whether anything
/// material changed; an unchanged record is not rewritten.
pub fn apply_probe(
    server: &mut Server,
    status: Option<&ServerStatus>,
    now: DateTime<Utc>,
) -> bool {
    let (reachable, version, sdr_endpoint) = match status {
        Some(s) => (
            true,
            s.version.clone().or_else(|| server.version.clone()),
            s.public_addr.clone().or_else(|| server.sdr_endpoint.clone()),
        ),
        None => (false, server.version.clone(), server.sdr_endpoint.clone()),
    };
    let changed = reachable != server.reachable
        || version != server.version
        || sdr_endpoint != server.sdr_endpoint;
    if changed {
        server.reachable = reachable;
        server.version = version;
        server.sdr_endpoint = sdr_endpoint;
        server.last_checked_at = Some(now);
    }
    changed
}

pub struct FleetProbe {
    servers: ServerRegistry,
    reservations: ReservationRegistry,
    ctx: Arc<TransportContext>,
}

impl FleetProbe {
    pub fn new(
        servers: ServerRegistry,
        reservations: ReservationRegistry,
        ctx: Arc<TransportContext>,
    ) -> Self {
        Self {
            servers,
            reservations,
            ctx,
        }
    }

    /// One pass over the unreserved part of the fleet. Returns how many
    /// records were rewritten.
    pub async fn refresh(&self, now: DateTime<Utc>) -> Result<usize> {
        let mut rewritten = 0;
        for mut server in self.servers.active().await? {
            if self
                .reservations
                .current_for_server(&server.id, now)
                .await?
                .is_some()
            {
                continue;
            }

            let probed = self
                .ctx
                .status_cache
                .status(&server.addr(), &server.rcon_password, self.ctx.op_timeout)
                .await;
            let status = match &probed {
                Ok(s) => Some(s),
                Err(e) => {
                    debug!("fleet probe of server {} failed: {}", server.id, e);
                    None
                }
            };

            if apply_probe(&mut server, status, now) {
                if let Err(e) = self.servers.put(&server).await {
                    warn!("persisting server {} after probe failed: {}", server.id, e);
                    continue;
                }
                rewritten += 1;
            }
        }
        Ok(rewritten)
    }
}
