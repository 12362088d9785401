//! Tower Siege CLI
//!
//! The `siege` command drives a `sieged` server.
//!
//! ## Commands
//!
//! - `start`: Start a battle, optionally with a custom roster
//! - `stop`: Request cancellation of a running battle
//! - `get`: Print a run's record, events and results
//! - `list`: List runs, newest first
//! - `watch`: Follow a run's event stream until the battle ends

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::Level;

use siege_cli::SiegeClient;
use siege_core::telemetry::init_tracing;
use siege_state::{AgentProfile, BattleEvent, EventKind, RunId};

#[derive(Parser)]
#[command(name = "siege")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Tower Siege battle client", long_about = None)]
struct Cli {
    /// Base URL of the battle server
    #[arg(long, global = true, env = "SIEGE_SERVER", default_value = "http://127.0.0.1:4000")]
    server: String,

    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Emit JSON-formatted log lines
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start a battle
    Start {
        /// JSON file with an array of agent profiles (default: the stock roster)
        #[arg(long)]
        agents: Option<PathBuf>,

        /// Follow the event stream after starting
        #[arg(short, long)]
        watch: bool,
    },

    /// Stop a running battle
    Stop {
        /// Run ID
        run_id: String,
    },

    /// Show a run's record, events and results
    Get {
        /// Run ID
        run_id: String,
    },

    /// List runs
    List,

    /// Follow a run's events until the battle ends
    Watch {
        /// Run ID
        run_id: String,

        /// Only show events after this sequence number
        #[arg(long, default_value = "0")]
        after: u64,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let level = if cli.verbose {
        Level::DEBUG
    } else {
        Level::WARN
    };
    init_tracing(cli.json, level);

    let client = SiegeClient::new(cli.server);

    match cli.command {
        Commands::Start { agents, watch } => cmd_start(&client, agents.as_deref(), watch).await,
        Commands::Stop { run_id } => cmd_stop(&client, &RunId::from(run_id.as_str())).await,
        Commands::Get { run_id } => cmd_get(&client, &RunId::from(run_id.as_str())).await,
        Commands::List => cmd_list(&client).await,
        Commands::Watch { run_id, after } => {
            cmd_watch(&client, &RunId::from(run_id.as_str()), after).await
        }
    }
}

fn read_agents(path: &Path) -> Result<Vec<AgentProfile>> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read agents file: {:?}", path))?;
    serde_json::from_str(&content).context("Failed to parse agents file as a JSON array of agents")
}

async fn cmd_start(client: &SiegeClient, agents: Option<&Path>, watch: bool) -> Result<()> {
    let agents = agents.map(read_agents).transpose()?;
    let run_id = client.start(agents).await?;
    println!("Started battle {run_id}");
    if watch {
        cmd_watch(client, &run_id, 0).await?;
    }
    Ok(())
}

async fn cmd_stop(client: &SiegeClient, run_id: &RunId) -> Result<()> {
    if client.stop(run_id).await? {
        println!("Stop requested for {run_id}");
    } else {
        println!("Battle {run_id} is not running");
    }
    Ok(())
}

async fn cmd_get(client: &SiegeClient, run_id: &RunId) -> Result<()> {
    let snapshot = client.get(run_id).await?;
    println!("{}", serde_json::to_string_pretty(&snapshot)?);
    Ok(())
}

async fn cmd_list(client: &SiegeClient) -> Result<()> {
    let runs = client.list().await?;
    if runs.is_empty() {
        println!("No battles yet");
    }
    for run in runs {
        let health = run
            .final_health
            .map(|h| h.to_string())
            .unwrap_or_else(|| "-".to_string());
        println!(
            "{}  {:<9}  agents={}  final_health={}  created={}",
            run.run_id,
            run.status,
            run.agents.len(),
            health,
            run.created_at.to_rfc3339()
        );
    }
    Ok(())
}

async fn cmd_watch(client: &SiegeClient, run_id: &RunId, after: u64) -> Result<()> {
    let cursor = client
        .watch(run_id, after, |event| println!("{}", format_event(event)))
        .await?;
    println!("-- end of battle {run_id} (last seq {})", cursor.last_seq);
    Ok(())
}

/// One line per event: `[seq] kind agent: message`.
fn format_event(event: &BattleEvent) -> String {
    let mut line = format!("[{:>4}] {:<14}", event.seq, event.kind.as_str());
    if let Some(agent) = &event.agent_id {
        line.push_str(&format!(" {agent}:"));
    }
    let detail = match (&event.message, event.kind) {
        (Some(message), _) => Some(message.clone()),
        (None, EventKind::AgentStatus) => event
            .payload
            .as_ref()
            .and_then(|p| p["status"].as_str())
            .map(str::to_string),
        (None, _) => event.payload.as_ref().map(|p| p.to_string()),
    };
    if let Some(detail) = detail {
        line.push(' ');
        line.push_str(&detail);
    }
    line
}
