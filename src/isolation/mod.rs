//! Isolation strategies and the process isolation manager.
//!
//! Each device gets a dedicated server bound to its own port so one device's
//! traffic can never leak into another's. Two strategies share one contract:
//!
//! - [`ProcessIsolation`]: spawns the `chatcell-worker` binary as a separate
//!   OS process (`--device-id <id> --port <port>`), sharing no memory with
//!   the parent.
//! - [`InProcessIsolation`]: runs the same echo serving loop as a task
//!   inside the parent.
//!
//! [`IsolationManager`] owns the port allocator, the device connection
//! tracker, and the live handles; exit watchers reclaim records when a worker
//! exits, voluntarily or not.

use std::collections::HashMap;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpListener;
use tokio::process::{ChildStdin, Command};
use tokio::sync::watch;
use tracing::{info, warn};

use crate::devices::{DeviceConnection, DeviceTracker};
use crate::worker;

#[derive(Debug, thiserror::Error)]
pub enum IsolationError {
    #[error("port counter exhausted")]
    PortsExhausted,
    #[error("no isolated server for device: {0}")]
    NotConnected(String),
    #[error("failed to start isolated server: {0}")]
    Io(#[from] std::io::Error),
}

/// Monotonically increasing port allocator.
///
/// Ports are consumed append-only: a port is never handed out twice, even
/// after the process that owned it exits. Allocation fails once the counter
/// leaves the u16 range; there is no recycling policy.
#[derive(Debug)]
pub struct PortAllocator {
    next: AtomicU32,
}

impl PortAllocator {
    pub fn new(base: u16) -> Self {
        Self {
            next: AtomicU32::new(u32::from(base)),
        }
    }

    pub fn allocate(&self) -> Result<u16, IsolationError> {
        let port = self.next.fetch_add(1, Ordering::SeqCst);
        u16::try_from(port).map_err(|_| IsolationError::PortsExhausted)
    }
}

enum HandleKind {
    Process {
        stdin: Option<ChildStdin>,
    },
    InProcess {
        stop: watch::Sender<bool>,
    },
}

impl std::fmt::Debug for HandleKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Process { .. } => f.write_str("Process"),
            Self::InProcess { .. } => f.write_str("InProcess"),
        }
    }
}

/// Handle to one device's isolated server, whichever strategy produced it.
#[derive(Debug)]
pub struct IsolationHandle {
    device_id: String,
    port: u16,
    kind: HandleKind,
    exited: watch::Receiver<bool>,
}

impl IsolationHandle {
    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn device_id(&self) -> &str {
        &self.device_id
    }

    /// Receiver that flips to `true` once the underlying server has exited.
    pub fn exit_signal(&self) -> watch::Receiver<bool> {
        self.exited.clone()
    }

    /// Request cooperative shutdown and await exit.
    ///
    /// No forced kill: the worker is expected to exit promptly once asked.
    pub async fn terminate(mut self) {
        match self.kind {
            HandleKind::Process { ref mut stdin } => {
                if let Some(mut stdin) = stdin.take() {
                    let _ = stdin.write_all(b"shutdown\n").await;
                    let _ = stdin.flush().await;
                    // Dropping stdin is the EOF fallback for a worker that
                    // missed the line.
                }
            }
            HandleKind::InProcess { ref stop } => {
                let _ = stop.send(true);
            }
        }
        while !*self.exited.borrow() {
            if self.exited.changed().await.is_err() {
                break;
            }
        }
    }
}

/// Strategy for standing up one device's isolated server on a given port.
#[async_trait]
pub trait IsolationStrategy: Send + Sync {
    async fn spawn(&self, device_id: &str, port: u16) -> Result<IsolationHandle, IsolationError>;
}

/// Out-of-process isolation: one spawned `chatcell-worker` per device.
#[derive(Debug)]
pub struct ProcessIsolation {
    worker_bin: PathBuf,
}

impl ProcessIsolation {
    pub fn new(worker_bin: PathBuf) -> Self {
        Self { worker_bin }
    }

    /// Locate the worker binary next to the current executable.
    pub fn sibling_worker() -> Result<Self, std::io::Error> {
        let exe = std::env::current_exe()?;
        let dir = exe.parent().ok_or_else(|| {
            std::io::Error::new(std::io::ErrorKind::NotFound, "executable has no parent dir")
        })?;
        Ok(Self::new(dir.join("chatcell-worker")))
    }
}

#[async_trait]
impl IsolationStrategy for ProcessIsolation {
    async fn spawn(&self, device_id: &str, port: u16) -> Result<IsolationHandle, IsolationError> {
        let mut child = Command::new(&self.worker_bin)
            .arg("--device-id")
            .arg(device_id)
            .arg("--port")
            .arg(port.to_string())
            .stdin(Stdio::piped())
            .spawn()?;
        let stdin = child.stdin.take();

        let (exit_tx, exit_rx) = watch::channel(false);
        let id = device_id.to_string();
        tokio::spawn(async move {
            match child.wait().await {
                Ok(status) => {
                    info!(
                        target: "isolation",
                        device_id = %id,
                        code = ?status.code(),
                        "worker process exited"
                    );
                }
                Err(err) => {
                    warn!(target: "isolation", device_id = %id, error = %err, "worker wait failed");
                }
            }
            let _ = exit_tx.send(true);
        });

        info!(target: "isolation", device_id = %device_id, port, "worker process spawned");
        Ok(IsolationHandle {
            device_id: device_id.to_string(),
            port,
            kind: HandleKind::Process { stdin },
            exited: exit_rx,
        })
    }
}

/// In-process isolation: the same echo loop as the worker binary, run as a
/// task inside the parent.
#[derive(Debug, Default)]
pub struct InProcessIsolation;

impl InProcessIsolation {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl IsolationStrategy for InProcessIsolation {
    async fn spawn(&self, device_id: &str, port: u16) -> Result<IsolationHandle, IsolationError> {
        let listener = TcpListener::bind(("127.0.0.1", port)).await?;
        let (stop_tx, stop_rx) = watch::channel(false);
        let (exit_tx, exit_rx) = watch::channel(false);

        let id = device_id.to_string();
        tokio::spawn(async move {
            worker::serve_echo(listener, id, stop_rx).await;
            let _ = exit_tx.send(true);
        });

        info!(target: "isolation", device_id = %device_id, port, "in-process server started");
        Ok(IsolationHandle {
            device_id: device_id.to_string(),
            port,
            kind: HandleKind::InProcess { stop: stop_tx },
            exited: exit_rx,
        })
    }
}

/// Owns per-device isolated servers: allocates ports, spawns via the
/// configured strategy, tracks connections, and reclaims records on exit.
pub struct IsolationManager {
    strategy: Box<dyn IsolationStrategy>,
    ports: PortAllocator,
    tracker: DeviceTracker,
    handles: Mutex<HashMap<String, IsolationHandle>>,
}

impl std::fmt::Debug for IsolationManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IsolationManager")
            .field("tracked", &self.tracker.len())
            .finish()
    }
}

impl IsolationManager {
    pub fn new(strategy: Box<dyn IsolationStrategy>, port_base: u16) -> Arc<Self> {
        Arc::new(Self {
            strategy,
            ports: PortAllocator::new(port_base),
            tracker: DeviceTracker::new(),
            handles: Mutex::new(HashMap::new()),
        })
    }

    pub fn tracker(&self) -> &DeviceTracker {
        &self.tracker
    }

    /// Ensure the device has an isolated server; returns its port.
    ///
    /// Idempotent per live device: a second call while the first server is
    /// running refreshes activity and returns the existing port.
    pub async fn connect(self: &Arc<Self>, device_id: &str) -> Result<u16, IsolationError> {
        if let Some(existing) = self.tracker.get(device_id) {
            self.tracker.touch(device_id);
            return Ok(existing.port);
        }

        let port = self.ports.allocate()?;
        let handle = self.strategy.spawn(device_id, port).await?;

        if !self.tracker.insert(DeviceConnection::new(device_id, port)) {
            // Lost a concurrent connect race; the other server owns the device.
            let existing = self
                .tracker
                .get(device_id)
                .map(|c| c.port)
                .unwrap_or(port);
            handle.terminate().await;
            return Ok(existing);
        }

        let mut exited = handle.exit_signal();
        self.handles.lock().insert(device_id.to_string(), handle);

        let manager = Arc::clone(self);
        let id = device_id.to_string();
        tokio::spawn(async move {
            // Fires on exit, voluntary or crash. No automatic respawn.
            while !*exited.borrow() {
                if exited.changed().await.is_err() {
                    break;
                }
            }
            manager.reclaim(&id);
        });

        Ok(port)
    }

    /// Mark traffic for a device. No-op for devices without an isolated server.
    pub fn touch(&self, device_id: &str) {
        self.tracker.touch(device_id);
    }

    /// Request shutdown of a device's isolated server and await its exit.
    pub async fn disconnect(&self, device_id: &str) -> Result<(), IsolationError> {
        let handle = self
            .handles
            .lock()
            .remove(device_id)
            .ok_or_else(|| IsolationError::NotConnected(device_id.to_string()))?;
        handle.terminate().await;
        self.tracker.remove(device_id);
        Ok(())
    }

    /// Disconnect every device idle past `threshold`. Returns how many were
    /// reaped.
    pub async fn reap_idle(self: &Arc<Self>, threshold: Duration) -> usize {
        let idle = self
            .tracker
            .idle_devices(threshold, crate::devices::now_ms());
        let mut reaped = 0;
        for device_id in idle {
            match self.disconnect(&device_id).await {
                Ok(()) => reaped += 1,
                Err(IsolationError::NotConnected(_)) => {
                    // Handle already reclaimed by an exit watcher; drop the
                    // stale tracker entry.
                    self.tracker.remove(&device_id);
                    reaped += 1;
                }
                Err(err) => {
                    warn!(target: "reaper", device_id = %device_id, error = %err, "disconnect failed");
                }
            }
        }
        reaped
    }

    fn reclaim(&self, device_id: &str) {
        self.handles.lock().remove(device_id);
        if self.tracker.remove(device_id).is_some() {
            info!(target: "isolation", device_id = %device_id, "device records reclaimed");
        }
    }

    /// Number of devices with a live isolated server.
    pub fn active(&self) -> usize {
        self.tracker.len()
    }
}
