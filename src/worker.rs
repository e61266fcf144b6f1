//! Isolated echo worker.
//!
//! One worker serves exactly one device: it binds the port assigned by the
//! isolation manager, accepts WebSocket connections, and echoes every frame
//! verbatim back to its origin socket. The same serving loop backs both
//! isolation strategies (the out-of-process `chatcell-worker` binary and the
//! in-process variant), so echo semantics are identical across the two.
//!
//! Shutdown is cooperative: a `shutdown` line on stdin (or stdin EOF, which
//! covers a vanished parent) closes the listener and the process exits 0.

use clap::Parser;
use futures_util::{SinkExt, StreamExt};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tracing::{debug, info, warn};

/// Command-line arguments for the `chatcell-worker` binary.
#[derive(Parser, Debug)]
#[command(name = "chatcell-worker", about = "Dedicated echo worker for one device")]
pub struct WorkerArgs {
    /// Device this worker is dedicated to.
    #[arg(long = "device-id")]
    pub device_id: String,

    /// Port to bind, assigned by the parent's port allocator.
    #[arg(long)]
    pub port: u16,
}

/// Run the worker: bind the assigned port, serve echo connections until a
/// termination request arrives on stdin.
pub async fn run(args: WorkerArgs) -> Result<(), std::io::Error> {
    let listener = TcpListener::bind(("127.0.0.1", args.port)).await?;
    info!(
        target: "worker",
        device_id = %args.device_id,
        port = args.port,
        "worker listening"
    );

    let (stop_tx, stop_rx) = watch::channel(false);
    tokio::spawn(watch_stdin(stop_tx));

    serve_echo(listener, args.device_id, stop_rx).await;
    info!(target: "worker", "worker exiting");
    Ok(())
}

/// Watch stdin for the cooperative termination request.
async fn watch_stdin(stop_tx: watch::Sender<bool>) {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) if line.trim() == "shutdown" => break,
            Ok(Some(_)) => continue,
            // EOF means the parent dropped our stdin (or died); treat it the
            // same as an explicit request.
            Ok(None) | Err(_) => break,
        }
    }
    let _ = stop_tx.send(true);
}

/// Accept loop shared by both isolation strategies.
///
/// Spawns one task per accepted connection and returns when `stop` fires or
/// the listener errors. In-flight connections finish on their own.
pub async fn serve_echo(listener: TcpListener, device_id: String, mut stop: watch::Receiver<bool>) {
    loop {
        tokio::select! {
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    tokio::spawn(echo_connection(stream, peer.to_string(), device_id.clone()));
                }
                Err(err) => {
                    warn!(target: "worker", device_id = %device_id, error = %err, "accept failed");
                    break;
                }
            },
            changed = stop.changed() => {
                if changed.is_err() || *stop.borrow() {
                    break;
                }
            }
        }
    }
    info!(target: "worker", device_id = %device_id, "listener closed");
}

/// Echo every frame on one connection verbatim back to its origin socket.
async fn echo_connection(stream: TcpStream, peer: String, device_id: String) {
    let ws = match tokio_tungstenite::accept_async(stream).await {
        Ok(ws) => ws,
        Err(err) => {
            warn!(target: "worker", peer = %peer, error = %err, "websocket handshake failed");
            return;
        }
    };
    info!(target: "worker", device_id = %device_id, peer = %peer, "connection accepted");

    let (mut write, mut read) = ws.split();
    while let Some(next) = read.next().await {
        let msg = match next {
            Ok(msg) => msg,
            Err(err) => {
                debug!(target: "worker", peer = %peer, error = %err, "read error");
                break;
            }
        };
        if msg.is_close() {
            break;
        }
        if !msg.is_text() && !msg.is_binary() {
            continue;
        }
        let len = msg.len();
        info!(target: "worker", device_id = %device_id, peer = %peer, len, "frame received");
        if write.send(msg).await.is_err() {
            break;
        }
        info!(target: "worker", device_id = %device_id, peer = %peer, len, "frame echoed");
    }
    info!(target: "worker", device_id = %device_id, peer = %peer, "connection closed");
}
