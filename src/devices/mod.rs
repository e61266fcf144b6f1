//! Device connection tracker.
//!
//! Per-device bookkeeping for the isolation path: which port a device's
//! dedicated server owns, when it connected, and when it last saw traffic.
//! The idle reaper and the isolation manager both operate on this map on
//! their own schedules, decoupled from individual connection handling.

use std::collections::HashMap;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use parking_lot::Mutex;

/// Bookkeeping record for one device's isolated server.
///
/// `last_active_ms` is the only field that changes after creation.
#[derive(Debug, Clone)]
pub struct DeviceConnection {
    pub device_id: String,
    /// Port exclusively owned by this device's server while the record lives.
    pub port: u16,
    pub connected_at_ms: u64,
    pub last_active_ms: u64,
}

impl DeviceConnection {
    pub fn new(device_id: &str, port: u16) -> Self {
        let now = now_ms();
        Self {
            device_id: device_id.to_string(),
            port,
            connected_at_ms: now,
            last_active_ms: now,
        }
    }
}

/// In-memory map of device id to [`DeviceConnection`], at most one entry per
/// device at any time.
#[derive(Debug, Default)]
pub struct DeviceTracker {
    inner: Mutex<HashMap<String, DeviceConnection>>,
}

impl DeviceTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a record for a device. Returns `false` without replacing if the
    /// device already has a live record.
    pub fn insert(&self, conn: DeviceConnection) -> bool {
        let mut inner = self.inner.lock();
        if inner.contains_key(&conn.device_id) {
            return false;
        }
        inner.insert(conn.device_id.clone(), conn);
        true
    }

    pub fn get(&self, device_id: &str) -> Option<DeviceConnection> {
        self.inner.lock().get(device_id).cloned()
    }

    /// Update `last_active_ms` for a device. No-op for untracked devices.
    pub fn touch(&self, device_id: &str) {
        if let Some(conn) = self.inner.lock().get_mut(device_id) {
            conn.last_active_ms = now_ms();
        }
    }

    pub fn remove(&self, device_id: &str) -> Option<DeviceConnection> {
        self.inner.lock().remove(device_id)
    }

    /// Device ids whose `last_active_ms` is older than `threshold` at `now`.
    pub fn idle_devices(&self, threshold: Duration, now_ms: u64) -> Vec<String> {
        let cutoff = now_ms.saturating_sub(threshold.as_millis() as u64);
        self.inner
            .lock()
            .values()
            .filter(|c| c.last_active_ms < cutoff)
            .map(|c| c.device_id.clone())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().is_empty()
    }
}

pub(crate) fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_else(|_| Duration::from_secs(0))
        .as_millis() as u64
}
