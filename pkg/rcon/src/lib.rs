//! Source-RCON protocol client.
//!
//! One short-lived TCP connection per operation; every socket read/write
//! is bounded by a timeout. Connection refusal and timeout are recoverable
//! errors — callers decide whether to retry, skip, or treat as "occupied".

use anyhow::{Result, bail};
use dashmap::DashMap;
use std::time::{Duration, Instant};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::debug;

const SERVERDATA_AUTH: i32 = 3;
const SERVERDATA_AUTH_RESPONSE: i32 = 2;
const SERVERDATA_EXECCOMMAND: i32 = 2;

/// Largest response body we accept before assuming a corrupt frame.
const MAX_PACKET_SIZE: i32 = 64 * 1024;

// --- Wire framing ---

/// One RCON frame: `{len}{id}{type}{body}\0\0`, all i32s little-endian,
/// `len` covering everything after itself.
#[derive(Debug, Clone, PartialEq, Eq)]
struct Packet {
    id: i32,
    ptype: i32,
    body: String,
}

impl Packet {
    fn encode(&self) -> Vec<u8> {
        let body = self.body.as_bytes();
        let len = (4 + 4 + body.len() + 2) as i32;
        let mut buf = Vec::with_capacity(4 + len as usize);
        buf.extend_from_slice(&len.to_le_bytes());
        buf.extend_from_slice(&self.id.to_le_bytes());
        buf.extend_from_slice(&self.ptype.to_le_bytes());
        buf.extend_from_slice(body);
        buf.extend_from_slice(&[0, 0]);
        buf
    }

    /// Parse the payload that follows the length prefix.
    fn decode(payload: &[u8]) -> Result<Self> {
        if payload.len() < 10 {
            bail!("rcon frame too short: {} bytes", payload.len());
        }
        let id = i32::from_le_bytes(payload[0..4].try_into()?);
        let ptype = i32::from_le_bytes(payload[4..8].try_into()?);
        let body = String::from_utf8_lossy(&payload[8..payload.len() - 2]).into_owned();
        Ok(Packet { id, ptype, body })
    }
}

// --- Client ---

pub struct RconClient {
    stream: TcpStream,
    next_id: i32,
    op_timeout: Duration,
}

impl RconClient {
    /// Connect and authenticate. An id of -1 in the auth response means
    /// the password was rejected.
    pub async fn connect(addr: &str, password: &str, op_timeout: Duration) -> Result<Self> {
        let stream = timeout(op_timeout, TcpStream::connect(addr))
            .await
            .map_err(|_| anyhow::anyhow!("rcon connect to {} timed out", addr))??;
        let mut client = Self {
            stream,
            next_id: 1,
            op_timeout,
        };

        let auth_id = client.send(SERVERDATA_AUTH, password).await?;
        // The server may send an empty RESPONSE_VALUE before AUTH_RESPONSE.
        loop {
            let reply = client.recv().await?;
            if reply.ptype == SERVERDATA_AUTH_RESPONSE {
                if reply.id == -1 {
                    bail!("rcon auth rejected by {}", addr);
                }
                if reply.id != auth_id {
                    bail!("rcon auth response id mismatch from {}", addr);
                }
                debug!("rcon authenticated to {}", addr);
                return Ok(client);
            }
        }
    }

    /// Issue a single command and return the response body.
    pub async fn exec(&mut self, command: &str) -> Result<String> {
        let id = self.send(SERVERDATA_EXECCOMMAND, command).await?;
        let reply = self.recv().await?;
        if reply.id != id {
            bail!("rcon response id mismatch (sent {}, got {})", id, reply.id);
        }
        Ok(reply.body)
    }

    /// Structured `status` query.
    pub async fn status(&mut self) -> Result<ServerStatus> {
        let text = self.exec("status").await?;
        parse_status(&text)
    }

    /// Broadcast a chat message to everyone on the server.
    pub async fn say(&mut self, message: &str) -> Result<()> {
        self.exec(&format!("say {}", message)).await?;
        Ok(())
    }

    async fn send(&mut self, ptype: i32, body: &str) -> Result<i32> {
        let id = self.next_id;
        self.next_id = self.next_id.wrapping_add(1).max(1);
        let frame = Packet {
            id,
            ptype,
            body: body.to_string(),
        }
        .encode();
        timeout(self.op_timeout, self.stream.write_all(&frame))
            .await
            .map_err(|_| anyhow::anyhow!("rcon write timed out"))??;
        Ok(id)
    }

    async fn recv(&mut self) -> Result<Packet> {
        let mut len_buf = [0u8; 4];
        timeout(self.op_timeout, self.stream.read_exact(&mut len_buf))
            .await
            .map_err(|_| anyhow::anyhow!("rcon read timed out"))??;
        let len = i32::from_le_bytes(len_buf);
        if !(10..=MAX_PACKET_SIZE).contains(&len) {
            bail!("rcon frame length {} out of range", len);
        }
        let mut payload = vec![0u8; len as usize];
        timeout(self.op_timeout, self.stream.read_exact(&mut payload))
            .await
            .map_err(|_| anyhow::anyhow!("rcon read timed out"))??;
        Packet::decode(&payload)
    }
}

// --- Status parsing ---

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerStatus {
    pub hostname: String,
    pub map: String,
    pub player_count: u32,
    pub max_players: u32,
    pub version: Option<String>,
    /// The relay address from the `udp/ip` line, when the server exposes
    /// one (SDR-enabled servers report the relay here, not their real ip).
    pub public_addr: Option<String>,
}

impl ServerStatus {
    pub fn occupied(&self) -> bool {
        self.player_count > 0
    }
}

/// Tokenize the fixed `key : value` block at the top of a `status`
/// response. Unknown lines are ignored; hostname and map are required.
pub fn parse_status(text: &str) -> Result<ServerStatus> {
    let mut hostname = None;
    let mut map = None;
    let mut player_count = 0;
    let mut max_players = 0;
    let mut version = None;
    let mut public_addr = None;

    for line in text.lines() {
        let Some((key, value)) = line.split_once(':') else {
            continue;
        };
        let value = value.trim();
        match key.trim() {
            "hostname" => hostname = Some(value.to_string()),
            // "cp_badlands at: 0 x, 0 y, 0 z"
            "map" => map = Some(value.split_whitespace().next().unwrap_or("").to_string()),
            "version" => version = Some(value.split('/').next().unwrap_or(value).trim().to_string()),
            "udp/ip" => public_addr = Some(value.split_whitespace().next().unwrap_or("").to_string()),
            // "2 humans, 0 bots (24 max)"
            "players" => {
                let mut tokens = value.split_whitespace();
                player_count = tokens.next().and_then(|t| t.parse().ok()).unwrap_or(0);
                max_players = value
                    .split('(')
                    .nth(1)
                    .and_then(|t| t.split_whitespace().next())
                    .and_then(|t| t.parse().ok())
                    .unwrap_or(0);
            }
            _ => {}
        }
    }

    let (Some(hostname), Some(map)) = (hostname, map) else {
        bail!("unparseable status response");
    };
    Ok(ServerStatus {
        hostname,
        map,
        player_count,
        max_players,
        version,
        public_addr,
    })
}

// --- Status cache ---

/// Short-lived cache in front of `status` so per-minute health checks do
/// not hammer a live game server.
pub struct StatusCache {
    ttl: Duration,
    inner: DashMap<String, (Instant, ServerStatus)>,
}

impl StatusCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            inner: DashMap::new(),
        }
    }

    pub fn get(&self, addr: &str) -> Option<ServerStatus> {
        let entry = self.inner.get(addr)?;
        let (stored_at, status) = entry.value();
        if stored_at.elapsed() < self.ttl {
            Some(status.clone())
        } else {
            None
        }
    }

    pub fn insert(&self, addr: &str, status: ServerStatus) {
        self.inner.insert(addr.to_string(), (Instant::now(), status));
    }

    /// Cached status, querying the server on a miss.
    pub async fn status(
        &self,
        addr: &str,
        password: &str,
        op_timeout: Duration,
    ) -> Result<ServerStatus> {
        if let Some(hit) = self.get(addr) {
            return Ok(hit);
        }
        let mut client = RconClient::connect(addr, password, op_timeout).await?;
        let status = client.status().await?;
        self.insert(addr, status.clone());
        Ok(status)
    }
}
