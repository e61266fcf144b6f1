//! Session registry.
//!
//! Process-wide map of active sessions, keyed by generated session id. Each
//! session exclusively owns the outbound handle for its socket; the entry is
//! removed at or before socket close. Shared across all connection tasks, so
//! mutation goes through a `parking_lot` mutex.

use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;

use axum::extract::ws::Message;
use parking_lot::Mutex;
use tokio::sync::mpsc;

/// One active logical connection.
#[derive(Debug)]
pub struct Session {
    pub session_id: String,
    pub device_id: String,
    pub remote_addr: SocketAddr,
    /// Outbound handle into the socket send task. Exclusively owned by this
    /// session for its lifetime.
    pub sender: mpsc::UnboundedSender<Message>,
    pub connected_at_ms: u64,
    /// Channels this session has subscribed to.
    pub subscriptions: HashSet<String>,
}

/// Non-owning view of a session, safe to hand across component boundaries.
#[derive(Debug, Clone)]
pub struct SessionInfo {
    pub session_id: String,
    pub device_id: String,
    pub remote_addr: SocketAddr,
    pub connected_at_ms: u64,
}

#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("session already registered: {0}")]
    DuplicateSession(String),
}

/// In-memory registry of active sessions.
#[derive(Debug, Default)]
pub struct SessionRegistry {
    inner: Mutex<HashMap<String, Session>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a new session. Session ids are generated from device id plus
    /// connect time, so duplicates should not occur; the check stays anyway.
    pub fn register(&self, session: Session) -> Result<(), RegistryError> {
        let mut inner = self.inner.lock();
        if inner.contains_key(&session.session_id) {
            return Err(RegistryError::DuplicateSession(session.session_id));
        }
        inner.insert(session.session_id.clone(), session);
        Ok(())
    }

    pub fn lookup(&self, session_id: &str) -> Option<SessionInfo> {
        self.inner.lock().get(session_id).map(|s| SessionInfo {
            session_id: s.session_id.clone(),
            device_id: s.device_id.clone(),
            remote_addr: s.remote_addr,
            connected_at_ms: s.connected_at_ms,
        })
    }

    pub fn contains(&self, session_id: &str) -> bool {
        self.inner.lock().contains_key(session_id)
    }

    /// Remove a session. Idempotent; a no-op if the id is absent.
    pub fn remove(&self, session_id: &str) {
        self.inner.lock().remove(session_id);
    }

    /// Record interest in a named channel for a session.
    ///
    /// Returns `false` if the session is unknown.
    pub fn subscribe(&self, session_id: &str, channel: &str) -> bool {
        let mut inner = self.inner.lock();
        match inner.get_mut(session_id) {
            Some(session) => {
                session.subscriptions.insert(channel.to_string());
                true
            }
            None => false,
        }
    }

    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().is_empty()
    }
}
