use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, ValueEnum};
use tracing::{info, Level};

use siege_core::telemetry::init_tracing;
use siege_core::{
    BattleConfig, BattleLedger, DirectOverlay, LocalProvisioner, OverlayNetwork, ProviderRegistry,
    TailscaleOverlay,
};
use siege_server::{serve, AppState};
use siege_state::SurrealLedger;

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum Overlay {
    /// Reach sandboxes at their own address
    Direct,
    /// Join every sandbox to a tailnet (needs TAILSCALE_KEY)
    Tailscale,
}

#[derive(Parser, Debug)]
#[command(name = "sieged")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Tower Siege battle server", long_about = None)]
struct Cli {
    /// Address to listen on
    #[arg(long, env = "SIEGE_BIND", default_value = "127.0.0.1:4000")]
    bind: SocketAddr,

    /// Overlay network joining tower and agent sandboxes
    #[arg(long, env = "SIEGE_OVERLAY", value_enum, default_value_t = Overlay::Direct)]
    overlay: Overlay,

    /// Directory for local sandbox working directories (default: system temp dir)
    #[arg(long, env = "SIEGE_SANDBOX_DIR")]
    sandbox_dir: Option<PathBuf>,

    /// Keep runs in memory only instead of SIEGE_DB_URL
    #[arg(long)]
    ephemeral: bool,

    /// Enable verbose output
    #[arg(short, long)]
    verbose: bool,

    /// Emit JSON-formatted log lines
    #[arg(long)]
    json: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let level = if cli.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };
    init_tracing(cli.json, level);

    let config = BattleConfig::from_env().context("invalid SIEGE_* configuration")?;

    let ledger: Arc<dyn BattleLedger> = if cli.ephemeral {
        Arc::new(
            SurrealLedger::in_memory()
                .await
                .context("Failed to open in-memory ledger")?,
        )
    } else {
        Arc::new(
            SurrealLedger::from_env()
                .await
                .context("Failed to connect to the battle database")?,
        )
    };

    let provisioner = match cli.sandbox_dir {
        Some(dir) => LocalProvisioner::in_dir(dir),
        None => LocalProvisioner::new(),
    };
    let overlay: Arc<dyn OverlayNetwork> = match cli.overlay {
        Overlay::Direct => Arc::new(DirectOverlay),
        Overlay::Tailscale => Arc::new(TailscaleOverlay::from_env()),
    };

    let providers = ProviderRegistry::from_env();
    info!(
        overlay = ?cli.overlay,
        initial_health = config.initial_health,
        tower_port = config.tower_port,
        "battle server configured"
    );

    let state = AppState::assemble(ledger, Arc::new(provisioner), overlay, providers, config);
    serve(cli.bind, state).await
}
