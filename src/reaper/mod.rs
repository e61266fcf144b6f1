//! Idle device reaper.
//!
//! Background task that periodically sweeps the device connection tracker and
//! shuts down isolated servers for devices inactive past the idle threshold.
//! A coarse sweep, not a per-entry timer: an idle device may linger for up to
//! one sweep interval.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tracing::debug;

use crate::isolation::IsolationManager;

/// Run the reaper loop until `shutdown` fires.
pub async fn reaper_loop(
    manager: Arc<IsolationManager>,
    interval: Duration,
    idle_threshold: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut ticker = tokio::time::interval(interval);
    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            _ = shutdown.changed() => break,
        }
        if *shutdown.borrow() {
            break;
        }

        let reaped = manager.reap_idle(idle_threshold).await;
        if reaped > 0 {
            debug!(target: "reaper", reaped, "idle devices evicted");
        }
    }
    debug!(target: "reaper", "reaper loop stopped");
}
