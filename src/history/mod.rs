//! Chat history storage.
//!
//! The gateway treats history as an external collaborator behind the
//! [`HistoryStore`] trait: reads feed the `history` frame sent after connect,
//! writes persist echoed chat messages. Both are best-effort from the
//! router's perspective: a failed read degrades to an omitted history frame
//! and a failed write is logged and discarded.
//!
//! [`JsonlHistory`] stores one append-friendly JSONL file per device;
//! [`MemoryHistory`] backs tests and ephemeral deployments.

use std::collections::HashMap;
use std::fs::{self, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::PathBuf;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

/// One persisted chat entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatEntry {
    pub content: String,
    /// RFC 3339 server timestamp recorded at persist time.
    pub timestamp: String,
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum HistoryError {
    #[error("history io error: {0}")]
    Io(String),
    #[error("history serialization error: {0}")]
    Serialization(String),
}

impl From<std::io::Error> for HistoryError {
    fn from(err: std::io::Error) -> Self {
        HistoryError::Io(err.to_string())
    }
}

impl From<serde_json::Error> for HistoryError {
    fn from(err: serde_json::Error) -> Self {
        HistoryError::Serialization(err.to_string())
    }
}

/// Persistent chat history keyed by device identity.
#[async_trait]
pub trait HistoryStore: Send + Sync {
    /// Ordered prior chat entries for a device. Empty for unknown devices.
    async fn chat_history(&self, device_id: &str) -> Result<Vec<ChatEntry>, HistoryError>;

    /// Append one chat message for a device.
    async fn save_message(&self, device_id: &str, content: &str) -> Result<(), HistoryError>;
}

/// In-memory history store.
#[derive(Debug, Default)]
pub struct MemoryHistory {
    inner: Mutex<HashMap<String, Vec<ChatEntry>>>,
}

impl MemoryHistory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed history for a device (test setup).
    pub fn preload(&self, device_id: &str, entries: Vec<ChatEntry>) {
        self.inner.lock().insert(device_id.to_string(), entries);
    }

    /// Number of stored entries for a device.
    pub fn entry_count(&self, device_id: &str) -> usize {
        self.inner.lock().get(device_id).map_or(0, Vec::len)
    }
}

#[async_trait]
impl HistoryStore for MemoryHistory {
    async fn chat_history(&self, device_id: &str) -> Result<Vec<ChatEntry>, HistoryError> {
        Ok(self.inner.lock().get(device_id).cloned().unwrap_or_default())
    }

    async fn save_message(&self, device_id: &str, content: &str) -> Result<(), HistoryError> {
        self.inner
            .lock()
            .entry(device_id.to_string())
            .or_default()
            .push(ChatEntry {
                content: content.to_string(),
                timestamp: chrono::Utc::now().to_rfc3339(),
            });
        Ok(())
    }
}

/// File-backed history store: one JSONL file per device under `base_dir`.
#[derive(Debug)]
pub struct JsonlHistory {
    base_dir: PathBuf,
}

impl JsonlHistory {
    pub fn new(base_dir: PathBuf) -> Self {
        Self { base_dir }
    }

    fn device_path(&self, device_id: &str) -> PathBuf {
        // Derived ids are "dev-<hex>[-<ts>]", but sanitize anyway since the
        // id lands in a filename.
        let safe: String = device_id
            .chars()
            .map(|c| {
                if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                    c
                } else {
                    '_'
                }
            })
            .collect();
        self.base_dir.join(format!("{safe}.jsonl"))
    }
}

#[async_trait]
impl HistoryStore for JsonlHistory {
    async fn chat_history(&self, device_id: &str) -> Result<Vec<ChatEntry>, HistoryError> {
        let path = self.device_path(device_id);
        if !path.exists() {
            return Ok(Vec::new());
        }
        let file = fs::File::open(&path)?;
        let reader = BufReader::new(file);
        let mut entries = Vec::new();
        for line in reader.lines() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            entries.push(serde_json::from_str(&line)?);
        }
        Ok(entries)
    }

    async fn save_message(&self, device_id: &str, content: &str) -> Result<(), HistoryError> {
        fs::create_dir_all(&self.base_dir)?;
        let entry = ChatEntry {
            content: content.to_string(),
            timestamp: chrono::Utc::now().to_rfc3339(),
        };
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.device_path(device_id))?;
        let line = serde_json::to_string(&entry)?;
        writeln!(file, "{line}")?;
        Ok(())
    }
}
