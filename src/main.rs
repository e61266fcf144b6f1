use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tracing::info;

use chatcell::config::{self, GatewayConfig, IsolationMode};
use chatcell::history::{HistoryStore, JsonlHistory, MemoryHistory};
use chatcell::isolation::{InProcessIsolation, IsolationManager, ProcessIsolation};
use chatcell::logging::{init_logging, LogConfig};
use chatcell::server::{run_server_with_config, GatewayState, ServerConfig};

/// Per-device isolated WebSocket chat gateway.
#[derive(Parser, Debug)]
#[command(
    name = "chatcell",
    version = env!("CARGO_PKG_VERSION"),
    about = "per-device isolated WebSocket chat gateway"
)]
struct Cli {
    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Start the gateway server (default when no subcommand is given).
    Start,

    /// Print the config file path in use.
    ConfigPath,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    match cli.command {
        None | Some(Command::Start) => run_gateway().await,
        Some(Command::ConfigPath) => {
            println!("{}", config::get_config_path().display());
            Ok(())
        }
    }
}

async fn run_gateway() -> Result<(), Box<dyn std::error::Error>> {
    init_logging(LogConfig::default())?;
    let config = config::load_config()?;

    let history = build_history(&config);
    let isolation = match config.isolation {
        IsolationMode::InProcess => IsolationManager::new(
            Box::new(InProcessIsolation::new()),
            config.worker_port_base,
        ),
        IsolationMode::Process => IsolationManager::new(
            Box::new(ProcessIsolation::sibling_worker()?),
            config.worker_port_base,
        ),
    };

    let state = Arc::new(GatewayState::new(&config, history, isolation));
    let server_config = ServerConfig::from_gateway_config(&config, state)?;
    let handle = run_server_with_config(server_config).await?;

    info!(port = handle.port(), "gateway started, ctrl-c to stop");
    tokio::signal::ctrl_c().await?;
    info!("shutdown requested");
    handle.shutdown().await;
    Ok(())
}

fn build_history(config: &GatewayConfig) -> Arc<dyn HistoryStore> {
    match &config.history_dir {
        Some(dir) => Arc::new(JsonlHistory::new(PathBuf::from(dir))),
        None => Arc::new(MemoryHistory::new()),
    }
}
