//! Dedicated echo worker, one process per device.
//!
//! Spawned by the gateway's process isolation manager with
//! `--device-id <id> --port <port>`; exits 0 on the cooperative shutdown
//! request.

use clap::Parser;

use chatcell::logging::{init_logging, LogConfig};
use chatcell::worker::{self, WorkerArgs};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = WorkerArgs::parse();
    init_logging(LogConfig::worker())?;
    worker::run(args).await?;
    Ok(())
}
