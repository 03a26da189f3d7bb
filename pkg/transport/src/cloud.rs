//! Ephemeral container fleet behind a vendor orchestration API.
//!
//! Starting a reservation creates a "match"; the vendor replies with the
//! connection endpoint, which we remember keyed by server id so end and
//! occupancy checks can find the instance. The vendor has no in-place
//! restart, so restart tears the match down and the next start relaunches.

use anyhow::{Result, bail};
use async_trait::async_trait;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{info, warn};

use crate::{Occupancy, ServerTransport, TransportContext};
use pkg_types::reservation::Reservation;
use pkg_types::server::{Server, ServerKind};

#[derive(Debug, Clone, Serialize)]
struct MatchRequest<'a> {
    server: &'a str,
    map: Option<&'a str>,
    password: &'a str,
    rcon_password: &'a str,
    tv_password: &'a str,
}

#[derive(Debug, Clone, Deserialize)]
struct MatchResponse {
    id: String,
    ip: String,
    port: u16,
}

#[derive(Debug, Clone)]
struct CloudMatch {
    match_id: String,
    endpoint: String,
}

pub struct CloudTransport {
    ctx: Arc<TransportContext>,
    /// Live matches keyed by server id.
    matches: DashMap<String, CloudMatch>,
}

struct CloudApi {
    api_url: String,
    api_key: String,
}

impl CloudTransport {
    pub fn new(ctx: Arc<TransportContext>) -> Self {
        Self {
            ctx,
            matches: DashMap::new(),
        }
    }

    fn api(server: &Server) -> Result<CloudApi> {
        match &server.kind {
            ServerKind::Cloud { api_url, api_key } => Ok(CloudApi {
                api_url: api_url.clone(),
                api_key: api_key.clone(),
            }),
            other => bail!("server {} is {}, not cloud", server.id, other.label()),
        }
    }

    async fn delete_match(&self, api: &CloudApi, server_id: &str) -> Result<()> {
        let Some((_, current)) = self.matches.remove(server_id) else {
            // Nothing tracked: already torn down, or slotd restarted.
            return Ok(());
        };
        let response = self
            .ctx
            .http
            .delete(format!("{}/matches/{}", api.api_url, current.match_id))
            .bearer_auth(&api.api_key)
            .timeout(self.ctx.op_timeout)
            .send()
            .await?;
        if !response.status().is_success() {
            bail!(
                "cloud match delete {} returned {}",
                current.match_id,
                response.status()
            );
        }
        info!("[cloud] deleted match {} ({})", current.match_id, current.endpoint);
        Ok(())
    }
}

#[async_trait]
impl ServerTransport for CloudTransport {
    fn name(&self) -> &'static str {
        "cloud"
    }

    fn ctx(&self) -> &TransportContext {
        &self.ctx
    }

    async fn start(&self, server: &Server, reservation: &Reservation) -> Result<()> {
        let api = Self::api(server)?;
        if let Some(existing) = self.matches.get(&server.id) {
            // Retried start: the match is already up.
            info!(
                "[cloud] match {} already live for server {}",
                existing.match_id, server.id
            );
            return Ok(());
        }

        let body = MatchRequest {
            server: &server.name,
            map: reservation.map_name.as_deref(),
            password: &reservation.password,
            rcon_password: &reservation.rcon_password,
            tv_password: &reservation.tv_password,
        };
        let response = self
            .ctx
            .http
            .post(format!("{}/matches", api.api_url))
            .bearer_auth(&api.api_key)
            .timeout(self.ctx.op_timeout)
            .json(&body)
            .send()
            .await?;
        if !response.status().is_success() {
            bail!("cloud match create returned {}", response.status());
        }
        let created: MatchResponse = response.json().await?;
        let endpoint = format!("{}:{}", created.ip, created.port);
        info!(
            "[cloud] launched match {} at {} for reservation {}",
            created.id, endpoint, reservation.id
        );
        self.matches.insert(
            server.id.clone(),
            CloudMatch {
                match_id: created.id,
                endpoint,
            },
        );
        Ok(())
    }

    async fn update(&self, server: &Server, reservation: &Reservation) -> Result<()> {
        // No vendor-side hot reload; push the cvars over RCON instead.
        let Some(live) = self.matches.get(&server.id).map(|m| m.endpoint.clone()) else {
            bail!("no live match for server {}", server.id);
        };
        let mut client = pkg_rcon::RconClient::connect(
            &live,
            &reservation.rcon_password,
            self.ctx.op_timeout,
        )
        .await?;
        client
            .exec(&format!("sv_password \"{}\"", reservation.password))
            .await?;
        client
            .exec(&format!("tv_password \"{}\"", reservation.tv_password))
            .await?;
        Ok(())
    }

    async fn end(&self, server: &Server, reservation: &Reservation) -> Result<()> {
        let api = Self::api(server)?;
        // The vendor archives logs on its side; our teardown is just the
        // match delete.
        if let Err(e) = self.delete_match(&api, &server.id).await {
            warn!(
                "[cloud] teardown of reservation {} incomplete: {}",
                reservation.id, e
            );
            return Err(e);
        }
        Ok(())
    }

    async fn restart(&self, server: &Server) -> Result<()> {
        let api = Self::api(server)?;
        self.delete_match(&api, &server.id).await
    }

    async fn observe(&self, server: &Server, reservation: &Reservation) -> Occupancy {
        // Probe the vendor-assigned endpoint, not the placeholder address
        // on the server record.
        let addr = self
            .matches
            .get(&server.id)
            .map(|m| m.endpoint.clone())
            .unwrap_or_else(|| server.addr());
        match self
            .ctx
            .status_cache
            .status(&addr, &reservation.rcon_password, self.ctx.op_timeout)
            .await
        {
            Ok(status) => Occupancy {
                occupied: status.occupied(),
                player_count: Some(status.player_count),
            },
            Err(e) => {
                warn!(
                    "[cloud] occupancy probe failed for {} ({}): {}, assuming occupied",
                    server.id, addr, e
                );
                Occupancy {
                    occupied: true,
                    player_count: None,
                }
            }
        }
    }
}
