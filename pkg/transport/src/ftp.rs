//! Remote box that only exposes FTP for files.
//!
//! A minimal control-channel client (USER/PASS, PASV, STOR/RETR/DELE/NLST)
//! over tokio TCP covers everything this transport needs; restarts go
//! through RCON since the box has no shell.

use anyhow::{Result, bail};
use async_trait::async_trait;
use std::net::Ipv4Addr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufStream};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::{info, warn};

use crate::{CONFIG_FILE, ServerTransport, TransportContext, archive, render_server_config};
use pkg_rcon::RconClient;
use pkg_types::reservation::Reservation;
use pkg_types::server::{Server, ServerKind};

// --- FTP client ---

pub struct FtpClient {
    control: BufStream<TcpStream>,
    op_timeout: Duration,
}

impl FtpClient {
    pub async fn connect(
        addr: &str,
        user: &str,
        password: &str,
        op_timeout: Duration,
    ) -> Result<Self> {
        let stream = timeout(op_timeout, TcpStream::connect(addr))
            .await
            .map_err(|_| anyhow::anyhow!("ftp connect to {} timed out", addr))??;
        let mut client = Self {
            control: BufStream::new(stream),
            op_timeout,
        };
        client.expect_reply(220).await?;
        let (code, _) = client.command(&format!("USER {}", user)).await?;
        if code == 331 {
            client.command_expect(&format!("PASS {}", password), 230).await?;
        } else if code != 230 {
            bail!("ftp login rejected for {}", user);
        }
        Ok(client)
    }

    async fn command(&mut self, cmd: &str) -> Result<(u16, String)> {
        let line = format!("{}\r\n", cmd);
        timeout(self.op_timeout, self.control.write_all(line.as_bytes()))
            .await
            .map_err(|_| anyhow::anyhow!("ftp write timed out"))??;
        timeout(self.op_timeout, self.control.flush())
            .await
            .map_err(|_| anyhow::anyhow!("ftp write timed out"))??;
        self.read_reply().await
    }

    async fn command_expect(&mut self, cmd: &str, expected: u16) -> Result<String> {
        let (code, text) = self.command(cmd).await?;
        if code != expected {
            bail!("ftp '{}' failed: {} {}", cmd.split(' ').next().unwrap_or(cmd), code, text);
        }
        Ok(text)
    }

    async fn expect_reply(&mut self, expected: u16) -> Result<String> {
        let (code, text) = self.read_reply().await?;
        if code != expected {
            bail!("ftp expected {}, got {} {}", expected, code, text);
        }
        Ok(text)
    }

    /// Read one (possibly multiline) reply from the control channel.
    async fn read_reply(&mut self) -> Result<(u16, String)> {
        let mut line = String::new();
        timeout(self.op_timeout, self.control.read_line(&mut line))
            .await
            .map_err(|_| anyhow::anyhow!("ftp read timed out"))??;
        let code = reply_code(&line)?;
        let mut text = line.clone();
        // "123-" opens a multiline reply closed by "123 ".
        if line.len() >= 4 && line.as_bytes()[3] == b'-' {
            let terminator = format!("{} ", code);
            loop {
                let mut next = String::new();
                timeout(self.op_timeout, self.control.read_line(&mut next))
                    .await
                    .map_err(|_| anyhow::anyhow!("ftp read timed out"))??;
                let done = next.starts_with(&terminator);
                text.push_str(&next);
                if done {
                    break;
                }
            }
        }
        Ok((code, text.trim().to_string()))
    }

    /// Enter passive mode and open the data connection.
    async fn data_connection(&mut self) -> Result<TcpStream> {
        let reply = self.command_expect("PASV", 227).await?;
        let addr = parse_pasv_reply(&reply)?;
        let stream = timeout(self.op_timeout, TcpStream::connect(addr))
            .await
            .map_err(|_| anyhow::anyhow!("ftp data connect timed out"))??;
        Ok(stream)
    }

    pub async fn stor(&mut self, path: &str, data: &[u8]) -> Result<()> {
        self.command_expect("TYPE I", 200).await?;
        let mut data_conn = self.data_connection().await?;
        let (code, text) = self.command(&format!("STOR {}", path)).await?;
        if code != 150 && code != 125 {
            bail!("ftp STOR {} refused: {} {}", path, code, text);
        }
        timeout(self.op_timeout, data_conn.write_all(data))
            .await
            .map_err(|_| anyhow::anyhow!("ftp data write timed out"))??;
        drop(data_conn);
        self.expect_reply(226).await?;
        Ok(())
    }

    pub async fn retr(&mut self, path: &str) -> Result<Vec<u8>> {
        self.command_expect("TYPE I", 200).await?;
        let mut data_conn = self.data_connection().await?;
        let (code, text) = self.command(&format!("RETR {}", path)).await?;
        if code != 150 && code != 125 {
            bail!("ftp RETR {} refused: {} {}", path, code, text);
        }
        let mut data = Vec::new();
        timeout(self.op_timeout, data_conn.read_to_end(&mut data))
            .await
            .map_err(|_| anyhow::anyhow!("ftp data read timed out"))??;
        drop(data_conn);
        self.expect_reply(226).await?;
        Ok(data)
    }

    pub async fn dele(&mut self, path: &str) -> Result<()> {
        self.command_expect(&format!("DELE {}", path), 250).await?;
        Ok(())
    }

    /// Bare name listing of a directory.
    pub async fn nlst(&mut self, dir: &str) -> Result<Vec<String>> {
        let mut data_conn = self.data_connection().await?;
        let (code, text) = self.command(&format!("NLST {}", dir)).await?;
        if code != 150 && code != 125 {
            bail!("ftp NLST {} refused: {} {}", dir, code, text);
        }
        let mut listing = String::new();
        timeout(self.op_timeout, data_conn.read_to_string(&mut listing))
            .await
            .map_err(|_| anyhow::anyhow!("ftp data read timed out"))??;
        drop(data_conn);
        self.expect_reply(226).await?;
        Ok(listing
            .lines()
            .map(|l| l.trim().to_string())
            .filter(|l| !l.is_empty())
            .collect())
    }

    pub async fn quit(mut self) {
        let _ = self.command("QUIT").await;
    }
}

fn reply_code(line: &str) -> Result<u16> {
    // checked slice: a reply may be short or start mid-codepoint
    let Some(code) = line.get(..3) else {
        bail!("ftp reply without code: {:?}", line);
    };
    code.parse()
        .map_err(|_| anyhow::anyhow!("ftp reply without code: {:?}", line))
}

/// Parse `227 Entering Passive Mode (h1,h2,h3,h4,p1,p2).`
fn parse_pasv_reply(reply: &str) -> Result<(Ipv4Addr, u16)> {
    let inner = reply
        .split('(')
        .nth(1)
        .and_then(|r| r.split(')').next())
        .ok_or_else(|| anyhow::anyhow!("malformed PASV reply: {}", reply))?;
    let parts: Vec<u16> = inner
        .split(',')
        .map(|p| p.trim().parse())
        .collect::<Result<_, _>>()
        .map_err(|_| anyhow::anyhow!("malformed PASV reply: {}", reply))?;
    if parts.len() != 6 || parts[..4].iter().any(|p| *p > 255) || parts[4] > 255 || parts[5] > 255 {
        bail!("malformed PASV reply: {}", reply);
    }
    let ip = Ipv4Addr::new(parts[0] as u8, parts[1] as u8, parts[2] as u8, parts[3] as u8);
    Ok((ip, parts[4] * 256 + parts[5]))
}

// --- Transport ---

pub struct FtpTransport {
    ctx: Arc<TransportContext>,
}

struct FtpTarget {
    addr: String,
    user: String,
    password: String,
    server_dir: String,
}

impl FtpTransport {
    pub fn new(ctx: Arc<TransportContext>) -> Self {
        Self { ctx }
    }

    fn target(server: &Server) -> Result<FtpTarget> {
        match &server.kind {
            ServerKind::Ftp {
                host,
                port,
                user,
                password,
                server_dir,
            } => Ok(FtpTarget {
                addr: format!("{}:{}", host, port),
                user: user.clone(),
                password: password.clone(),
                server_dir: server_dir.clone(),
            }),
            other => bail!("server {} is {}, not ftp", server.id, other.label()),
        }
    }

    async fn client(&self, target: &FtpTarget) -> Result<FtpClient> {
        FtpClient::connect(&target.addr, &target.user, &target.password, self.ctx.op_timeout).await
    }

    async fn push_config(
        &self,
        target: &FtpTarget,
        server: &Server,
        reservation: &Reservation,
    ) -> Result<()> {
        let mut client = self.client(target).await?;
        let path = format!("{}/cfg/{}", target.server_dir, CONFIG_FILE);
        client
            .stor(&path, render_server_config(server, reservation).as_bytes())
            .await?;
        client.quit().await;
        Ok(())
    }
}

#[async_trait]
impl ServerTransport for FtpTransport {
    fn name(&self) -> &'static str {
        "ftp"
    }

    fn ctx(&self) -> &TransportContext {
        &self.ctx
    }

    async fn start(&self, server: &Server, reservation: &Reservation) -> Result<()> {
        let target = Self::target(server)?;
        self.push_config(&target, server, reservation).await?;
        info!(
            "[ftp] delivered config to {} for reservation {}",
            target.addr, reservation.id
        );
        self.restart(server).await
    }

    async fn update(&self, server: &Server, reservation: &Reservation) -> Result<()> {
        let target = Self::target(server)?;
        self.push_config(&target, server, reservation).await?;
        let mut rcon = RconClient::connect(
            &server.addr(),
            &reservation.rcon_password,
            self.ctx.op_timeout,
        )
        .await?;
        rcon.exec(&format!("exec {}", CONFIG_FILE)).await?;
        Ok(())
    }

    async fn end(&self, server: &Server, reservation: &Reservation) -> Result<()> {
        let target = Self::target(server)?;
        let mut client = self.client(&target).await?;

        let logs_dir = format!("{}/logs", target.server_dir);
        let mut remote_files = client.nlst(&logs_dir).await.unwrap_or_default();
        remote_files.retain(|f| f.ends_with(".log") || f.ends_with(".dem"));

        let mut staged: Vec<(String, Vec<u8>)> = Vec::new();
        for file in &remote_files {
            let path = format!("{}/{}", logs_dir, file);
            match client.retr(&path).await {
                Ok(data) => {
                    staged.push((file.clone(), data));
                    if let Err(e) = client.dele(&path).await {
                        warn!("[ftp] could not delete remote {}: {}", path, e);
                    }
                }
                Err(e) => warn!("[ftp] skipping artifact {}: {}", path, e),
            }
        }
        archive::bundle_bytes(&staged, &self.ctx.bundle_path(reservation))?;

        let cfg_path = format!("{}/cfg/{}", target.server_dir, CONFIG_FILE);
        if let Err(e) = client.dele(&cfg_path).await {
            warn!("[ftp] could not remove remote config {}: {}", cfg_path, e);
        }
        client.quit().await;

        info!(
            "[ftp] archived {} artifacts for reservation {}",
            staged.len(),
            reservation.id
        );
        self.restart(server).await
    }

    async fn restart(&self, server: &Server) -> Result<()> {
        // No shell on FTP boxes; the game process restarts itself on
        // `_restart` issued over RCON with the standing password.
        let mut rcon =
            RconClient::connect(&server.addr(), &server.rcon_password, self.ctx.op_timeout).await?;
        rcon.exec("_restart").await.ok(); // connection drops mid-restart
        info!("[ftp] issued _restart to server {}", server.id);
        Ok(())
    }
}
