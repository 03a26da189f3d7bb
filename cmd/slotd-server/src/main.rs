use clap::Parser;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

use pkg_api::{AppState, server::start_server};
use pkg_controllers::ReconciliationScheduler;
use pkg_logpipe::LogPipeline;
use pkg_orchestrator::Orchestrator;
use pkg_state::client::StateStore;
use pkg_state::lock::StateLock;
use pkg_state::registry::{ReservationRegistry, ServerRegistry};
use pkg_transport::{TransportContext, Transports};
use pkg_types::config::{SlotdConfigFile, load_config_file};

#[derive(Parser, Debug)]
#[command(name = "slotd-server", about = "slotd reservation control plane")]
struct Cli {
    /// Path to YAML config file
    #[arg(long, short, default_value = "/etc/slotd/config.yaml")]
    config: String,

    /// Port to listen on
    #[arg(long)]
    port: Option<u16>,

    /// Directory for SlateDB state storage
    #[arg(long)]
    data_dir: Option<String>,

    /// Directory for end-of-reservation log archives
    #[arg(long)]
    archive_dir: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt::init();
    let cli = Cli::parse();

    // Load config file (returns defaults if file not found)
    let file_cfg: SlotdConfigFile = load_config_file(&cli.config)?;
    info!("Config file: {}", cli.config);

    // Merge: CLI args > config file > defaults
    let port = cli.port.or(file_cfg.port).unwrap_or(8080);
    let data_dir = cli
        .data_dir
        .or(file_cfg.data_dir)
        .unwrap_or_else(|| "/var/lib/slotd/data".to_string());
    let archive_dir = cli
        .archive_dir
        .or(file_cfg.archive_dir)
        .unwrap_or_else(|| "/var/lib/slotd/archives".to_string());

    info!("Starting slotd-server");
    info!("  Port:        {}", port);
    info!("  Data dir:    {}", data_dir);
    info!("  Archive dir: {}", archive_dir);

    std::fs::create_dir_all(&archive_dir)?;

    let store = StateStore::open(&data_dir).await?;
    let reservations = ReservationRegistry::new(store.clone());
    let servers = ServerRegistry::new(store.clone());
    let locks = Arc::new(StateLock::new(store));

    let ctx = Arc::new(TransportContext::new(PathBuf::from(&archive_dir)));
    let transports = Arc::new(Transports::new(ctx.clone()));

    let orchestrator = Arc::new(Orchestrator::new(
        reservations.clone(),
        servers.clone(),
        transports.clone(),
        locks.clone(),
        ctx.clone(),
        file_cfg.identity_url,
    ));

    let scheduler = ReconciliationScheduler::new(
        reservations.clone(),
        servers.clone(),
        orchestrator.clone(),
        transports,
        locks,
        ctx,
        file_cfg.tick_secs.map(Duration::from_secs),
    );
    scheduler.start();

    let pipeline = Arc::new(LogPipeline::new(
        reservations.clone(),
        servers.clone(),
        orchestrator.clone(),
    ));
    let (ingest, _pipeline_handle) = pipeline.start();

    let state = AppState {
        reservations,
        servers,
        orchestrator,
        ingest,
    };
    start_server(SocketAddr::from(([0, 0, 0, 0], port)), state).await?;

    Ok(())
}
