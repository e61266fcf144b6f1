//! Device identity derivation.
//!
//! Turns transport metadata from an inbound connection into a string
//! identifier used to key sessions, history, and isolation records. Two
//! strategies coexist:
//!
//! - [`connection_identity`]: lightweight, from the handshake token plus
//!   remote address. Used to key per-connection isolation.
//! - [`device_identity`]: broader, folding in client-supplied metadata and
//!   the connection timestamp.
//!
//! Neither survives a reconnect: the handshake token changes per connection
//! and the broader variant embeds the timestamp by construction. Callers that
//! need durable per-device identity (e.g. chat-history continuity) must
//! persist their own client-side token.

use std::net::SocketAddr;

use sha2::{Digest, Sha256};

/// Hex characters of the digest kept in derived identifiers.
const IDENTITY_HEX_LEN: usize = 12;

/// Client-supplied descriptive metadata captured at upgrade time.
#[derive(Debug, Clone, Default)]
pub struct ClientMeta {
    pub user_agent: Option<String>,
    pub platform: Option<String>,
}

/// Derive the lightweight per-connection identity from the handshake token
/// and remote address.
pub fn connection_identity(handshake_token: &str, remote_addr: &SocketAddr) -> String {
    let mut hasher = Sha256::new();
    hasher.update(handshake_token.as_bytes());
    hasher.update(b"|");
    hasher.update(remote_addr.to_string().as_bytes());
    format!("dev-{}", short_hex(&hasher.finalize()))
}

/// Derive the broader device identity from client metadata, remote address,
/// and connection timestamp.
///
/// More device-specific than [`connection_identity`], but still changes on
/// every connection because the timestamp is part of the input.
pub fn device_identity(meta: &ClientMeta, remote_addr: &SocketAddr, timestamp_ms: u64) -> String {
    let mut hasher = Sha256::new();
    hasher.update(meta.user_agent.as_deref().unwrap_or("").as_bytes());
    hasher.update(b"|");
    hasher.update(meta.platform.as_deref().unwrap_or("").as_bytes());
    hasher.update(b"|");
    hasher.update(remote_addr.to_string().as_bytes());
    format!("dev-{}-{}", short_hex(&hasher.finalize()), timestamp_ms)
}

fn short_hex(digest: &[u8]) -> String {
    digest
        .iter()
        .map(|b| format!("{:02x}", b))
        .collect::<String>()
        .chars()
        .take(IDENTITY_HEX_LEN)
        .collect()
}
