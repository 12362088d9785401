use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tracing::{info, Level};

use siege_core::telemetry::init_tracing;
use siege_tower::{app_router, persist_loop, Tower, DEFAULT_PERSIST_PATH, DEFAULT_PORT, PERSIST_INTERVAL};

#[derive(Parser, Debug)]
#[command(name = "siege-tower")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Tower Siege target service", long_about = None)]
struct Cli {
    /// Port to listen on (all interfaces)
    #[arg(long, env = "SIEGE_TOWER_PORT", default_value_t = DEFAULT_PORT)]
    port: u16,

    /// File the per-agent counters are written to
    #[arg(long, default_value = DEFAULT_PERSIST_PATH)]
    persist_path: PathBuf,

    /// Emit JSON-formatted log lines
    #[arg(long)]
    json: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.json, Level::INFO);

    let tower = Arc::new(Tower::new());
    tokio::spawn(persist_loop(tower.clone(), cli.persist_path, PERSIST_INTERVAL));

    let addr = SocketAddr::from(([0, 0, 0, 0], cli.port));
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;
    info!("Tower server listening on http://{}", listener.local_addr()?);
    axum::serve(listener, app_router(tower)).await?;
    Ok(())
}
