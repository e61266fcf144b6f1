//! Configuration loading.
//!
//! JSON config file with serde-typed fields and production defaults. The
//! path comes from `CHATCELL_CONFIG`, falling back to
//! `~/.chatcell/chatcell.json`. A missing file yields defaults; a malformed
//! one is an error.

use std::env;
use std::fs;
use std::net::SocketAddr;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use thiserror::Error;

const DEFAULT_BIND: &str = "127.0.0.1:8787";
const DEFAULT_WORKER_PORT_BASE: u16 = 9300;
const DEFAULT_IDLE_THRESHOLD_MS: u64 = 10 * 60 * 1000;
const DEFAULT_SWEEP_INTERVAL_MS: u64 = 60 * 1000;
const DEFAULT_MAX_PAYLOAD_BYTES: usize = 64 * 1024;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {message}")]
    ReadError { path: String, message: String },

    #[error("failed to parse config at {path}: {message}")]
    ParseError { path: String, message: String },

    #[error("invalid bind address {addr}: {message}")]
    InvalidBind { addr: String, message: String },
}

/// Which isolation strategy the gateway uses for dedicated device servers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum IsolationMode {
    /// Echo sub-server task inside the gateway process.
    #[default]
    InProcess,
    /// Separate `chatcell-worker` OS process per device.
    Process,
}

/// Gateway configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct GatewayConfig {
    /// Address the shared listener binds to. `CHATCELL_BIND` overrides.
    pub bind: String,
    pub isolation: IsolationMode,
    /// First port handed out by the per-device port allocator.
    pub worker_port_base: u16,
    pub idle_threshold_ms: u64,
    pub sweep_interval_ms: u64,
    /// Base directory for JSONL chat history. `None` keeps history in memory.
    pub history_dir: Option<PathBuf>,
    pub max_payload_bytes: usize,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            bind: DEFAULT_BIND.to_string(),
            isolation: IsolationMode::default(),
            worker_port_base: DEFAULT_WORKER_PORT_BASE,
            idle_threshold_ms: DEFAULT_IDLE_THRESHOLD_MS,
            sweep_interval_ms: DEFAULT_SWEEP_INTERVAL_MS,
            history_dir: None,
            max_payload_bytes: DEFAULT_MAX_PAYLOAD_BYTES,
        }
    }
}

impl GatewayConfig {
    /// Resolved bind address, honoring the `CHATCELL_BIND` override.
    pub fn bind_addr(&self) -> Result<SocketAddr, ConfigError> {
        let addr = env::var("CHATCELL_BIND").unwrap_or_else(|_| self.bind.clone());
        addr.parse().map_err(|e| ConfigError::InvalidBind {
            addr,
            message: format!("{e}"),
        })
    }
}

/// Config file path: `CHATCELL_CONFIG` if set, else `~/.chatcell/chatcell.json`.
pub fn get_config_path() -> PathBuf {
    if let Ok(path) = env::var("CHATCELL_CONFIG") {
        return PathBuf::from(path);
    }
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".chatcell")
        .join("chatcell.json")
}

/// Load configuration from the default path.
pub fn load_config() -> Result<GatewayConfig, ConfigError> {
    load_config_from(&get_config_path())
}

/// Load configuration from an explicit path. Missing file yields defaults.
pub fn load_config_from(path: &std::path::Path) -> Result<GatewayConfig, ConfigError> {
    if !path.exists() {
        return Ok(GatewayConfig::default());
    }
    let raw = fs::read_to_string(path).map_err(|e| ConfigError::ReadError {
        path: path.display().to_string(),
        message: e.to_string(),
    })?;
    serde_json::from_str(&raw).map_err(|e| ConfigError::ParseError {
        path: path.display().to_string(),
        message: e.to_string(),
    })
}
