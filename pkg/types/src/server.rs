use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// --- Transport variants ---

/// How slotd reaches a server's host. One reservation state machine drives
/// all of these through the `ServerTransport` trait in pkg-transport.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ServerKind {
    /// Game server on the same host as slotd; restart via process signal.
    Local { server_dir: String },
    /// Remote box with shell access; files over scp, restart over ssh.
    Ssh {
        host: String,
        user: String,
        server_dir: String,
    },
    /// Remote box exposing only FTP for files; restart over RCON.
    Ftp {
        host: String,
        port: u16,
        user: String,
        password: String,
        server_dir: String,
    },
    /// No file or shell access at all; everything over RCON.
    RconOnly,
    /// Ephemeral container fleet behind a vendor orchestration API.
    Cloud { api_url: String, api_key: String },
}

impl ServerKind {
    pub fn label(&self) -> &'static str {
        match self {
            ServerKind::Local { .. } => "local",
            ServerKind::Ssh { .. } => "ssh",
            ServerKind::Ftp { .. } => "ftp",
            ServerKind::RconOnly => "rcon-only",
            ServerKind::Cloud { .. } => "cloud",
        }
    }
}

// --- Server ---

/// One addressable game-server instance in the reservable pool.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Server {
    pub id: String,
    pub name: String,
    pub ip: String,
    pub port: u16,
    /// Standing RCON password used between reservations; a reservation
    /// overrides it with its own for the duration of the booking.
    pub rcon_password: String,
    pub kind: ServerKind,
    /// Inactive servers are kept out of the reservable pool (e.g. while
    /// self-updating).
    #[serde(default = "default_active")]
    pub active: bool,
    /// Empty means reservable by anyone; otherwise restricted to members
    /// of at least one listed group.
    #[serde(default)]
    pub groups: Vec<String>,
    /// Last known SDR relay endpoint, cached for client reconnect hints.
    #[serde(default)]
    pub sdr_endpoint: Option<String>,
    /// Last known game version.
    #[serde(default)]
    pub version: Option<String>,
    #[serde(default)]
    pub update_status: Option<String>,
    /// Outcome of the most recent reachability probe.
    #[serde(default = "default_active")]
    pub reachable: bool,
    #[serde(default)]
    pub last_checked_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

fn default_active() -> bool {
    true
}

impl Server {
    /// RCON address of the running game-server process.
    pub fn addr(&self) -> String {
        format!("{}:{}", self.ip, self.port)
    }

    /// Group-less servers are open to everyone; grouped servers require a
    /// matching membership.
    pub fn allows_user(&self, user_groups: &[String]) -> bool {
        self.groups.is_empty() || self.groups.iter().any(|g| user_groups.contains(g))
    }
}
